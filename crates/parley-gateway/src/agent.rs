use anyhow::Result;
use async_trait::async_trait;
use parley_core::{Agent, ContentPart, MessageRecord, Turn};

/// Offline agent: repeats the batched request back, noting how much history
/// it was given. Stands in for a model-backed agent.
#[derive(Debug)]
pub(crate) struct EchoAgent {
    name: String,
}

impl EchoAgent {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn respond(
        &self,
        history: &[Turn],
        request: &MessageRecord,
    ) -> Result<Vec<MessageRecord>> {
        let text = request.text();
        let reply = match history.len() {
            0 => format!("{} heard:\n{text}", self.name),
            n => format!("{} heard ({n} earlier turns):\n{text}", self.name),
        };

        Ok(vec![
            MessageRecord::response(request.conversation.clone(), vec![ContentPart::text(reply)])
                .with_metadata("model", "echo")
                .with_metadata("history_turns", history.len().to_string()),
        ])
    }
}
