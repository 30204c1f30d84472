use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parley_core::{Channel, ConversationKey, InboundMessage, OutboundMessage, OutboundSink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Line-oriented channel fed through mpsc queues.
///
/// Each inbound line may start with a conversation key and a `name:` sender
/// tag, e.g. `group:g1 alice: hello`. Missing parts fall back to the
/// channel's defaults, so plain lines land in the default conversation.
#[allow(missing_debug_implementations)] // contains mpsc channels
pub struct TerminalChannel {
    id: String,
    default_conversation: ConversationKey,
    default_sender: String,
    rx: mpsc::Receiver<String>,
    sink: Arc<TerminalSink>,
}

/// Handle for the console side to send/receive lines.
#[allow(missing_debug_implementations)] // contains mpsc channels
pub struct TerminalHandle {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

/// Create a linked pair of (TerminalChannel, TerminalHandle).
/// Lines sent via `TerminalHandle.tx` are received by `TerminalChannel.recv()`.
/// Replies delivered through the channel's outbound sink arrive on `TerminalHandle.rx`.
pub fn terminal_pair(
    buffer: usize,
    default_conversation: ConversationKey,
    default_sender: impl Into<String>,
) -> (TerminalChannel, TerminalHandle) {
    let (console_to_gw_tx, console_to_gw_rx) = mpsc::channel(buffer);
    let (gw_to_console_tx, gw_to_console_rx) = mpsc::channel(buffer);

    let channel = TerminalChannel {
        id: "terminal".to_owned(),
        default_conversation,
        default_sender: default_sender.into(),
        rx: console_to_gw_rx,
        sink: Arc::new(TerminalSink {
            tx: gw_to_console_tx,
        }),
    };

    let handle = TerminalHandle {
        tx: console_to_gw_tx,
        rx: gw_to_console_rx,
    };

    (channel, handle)
}

/// Split a console line into `(conversation, sender, text)`.
pub fn parse_line<'a>(
    line: &'a str,
    default_conversation: &ConversationKey,
    default_sender: &'a str,
) -> (ConversationKey, &'a str, &'a str) {
    let mut rest = line.trim();

    let mut conversation = default_conversation.clone();
    if let Some((head, tail)) = rest.split_once(char::is_whitespace)
        && let Ok(key) = head.parse::<ConversationKey>()
    {
        conversation = key;
        rest = tail.trim_start();
    }

    let mut sender = default_sender;
    if let Some((head, tail)) = rest.split_once(char::is_whitespace)
        && let Some(name) = head.strip_suffix(':')
        && !name.is_empty()
    {
        sender = name;
        rest = tail.trim_start();
    }

    (conversation, sender, rest)
}

#[async_trait]
impl Channel for TerminalChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn recv(&mut self) -> Result<InboundMessage> {
        loop {
            let line = self
                .rx
                .recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("terminal channel closed"))?;

            let (conversation, sender, content) =
                parse_line(&line, &self.default_conversation, &self.default_sender);
            if content.is_empty() {
                debug!("skipping empty terminal line");
                continue;
            }

            return Ok(InboundMessage {
                channel: self.id.clone(),
                conversation,
                sender: sender.to_owned(),
                sender_name: None,
                content: content.to_owned(),
                timestamp: Utc::now(),
            });
        }
    }

    fn outbound(&self) -> Arc<dyn OutboundSink> {
        Arc::clone(&self.sink) as Arc<dyn OutboundSink>
    }
}

/// Send half of a [`TerminalChannel`]. Replies are rendered as
/// `[<conversation>] <text>`.
#[derive(Debug, Clone)]
pub struct TerminalSink {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl OutboundSink for TerminalSink {
    async fn deliver(&self, msg: OutboundMessage) -> Result<()> {
        let line = format!("[{}] {}", msg.conversation, msg.text());
        self.tx
            .send(line)
            .await
            .map_err(|_send_err| anyhow::anyhow!("terminal channel receiver dropped"))?;
        Ok(())
    }
}
