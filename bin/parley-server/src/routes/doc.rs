use utoipa::OpenApi;

use super::chat::ChatApi;
use super::health::HealthApi;
use super::hello::HelloApi;

#[derive(OpenApi)]
#[openapi(info(
    title = "parley-server",
    description = "Streaming chat backend with durable sessions"
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(HealthApi::openapi());
    root.merge(ChatApi::openapi());
    root.merge(HelloApi::openapi());
    root
}
