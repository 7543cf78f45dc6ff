//! Chat request / response types.

use parley_core::Message;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Request body for `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct ChatRequest {
    /// The user's message for this turn, at most 32768 characters.
    #[validate(length(min = 1, max = 32768, message = "prompt must be between 1 and 32768 characters"))]
    pub prompt: String,
}

/// One text part of a history turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TextPart {
    pub text: String,
}

/// A turn as shown in the chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistoryMessage {
    /// `"user"` or `"assistant"`.
    pub role: String,
    /// Always exactly one text part.
    pub content: Vec<TextPart>,
}

impl From<Message> for HistoryMessage {
    fn from(message: Message) -> Self {
        Self {
            role: message.role.to_string(),
            content: message
                .content
                .iter()
                .filter_map(|part| part.as_text())
                .map(|text| TextPart { text: text.to_owned() })
                .collect(),
        }
    }
}

/// Response body for `GET /chat`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    pub messages: Vec<HistoryMessage>,
}

/// Payload of an `error` SSE event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamError {
    pub error: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prompt_length_is_validated() {
        assert!(ChatRequest { prompt: "hi".into() }.validate().is_ok());
        assert!(ChatRequest { prompt: String::new() }.validate().is_err());
        let too_long = "x".repeat(32 * 1024 + 1);
        assert!(ChatRequest { prompt: too_long }.validate().is_err());
    }

    #[test]
    fn history_message_serializes_like_stored_turns() {
        let msg: HistoryMessage = Message::assistant("hello").into();
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({"role": "assistant", "content": [{"text": "hello"}]})
        );
    }
}
