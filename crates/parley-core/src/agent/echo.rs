//! Offline agent that streams the prompt back word by word.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::{Agent, AgentContext, AgentEvent, AgentStream};
use crate::error::AgentError;

#[derive(Debug, Clone, Default)]
pub struct EchoAgent {
    delay: Option<Duration>,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause before each fragment, to mimic a slow model.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn stream(&self, context: AgentContext) -> Result<AgentStream, AgentError> {
        let reply = format!("You said: {}", context.prompt);
        let fragments: Vec<AgentEvent> = reply
            .split_inclusive(' ')
            .map(|word| AgentEvent::Fragment(word.to_owned()))
            .chain(std::iter::once(AgentEvent::Complete { message: None }))
            .collect();

        let delay = self.delay;
        let events = stream::iter(fragments).then(move |event| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            event
        });
        Ok(events.boxed())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(prompt: &str) -> AgentContext {
        AgentContext {
            model: "echo".into(),
            system_directive: None,
            history: Vec::new(),
            prompt: prompt.into(),
        }
    }

    #[tokio::test]
    async fn echoes_prompt_word_by_word() {
        let events: Vec<AgentEvent> = EchoAgent::new()
            .stream(context("hi there"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                AgentEvent::Fragment("You ".into()),
                AgentEvent::Fragment("said: ".into()),
                AgentEvent::Fragment("hi ".into()),
                AgentEvent::Fragment("there".into()),
                AgentEvent::Complete { message: None },
            ]
        );
    }

    #[tokio::test]
    async fn delay_is_applied_per_fragment() {
        let start = std::time::Instant::now();
        let events: Vec<AgentEvent> = EchoAgent::with_delay(Duration::from_millis(10))
            .stream(context("x"))
            .await
            .unwrap()
            .collect()
            .await;
        // "You ", "said: ", "x", Complete
        assert_eq!(events.len(), 4);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
