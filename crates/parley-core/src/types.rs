use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies an independent stream of messages: a group chat or a direct
/// conversation with one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ConversationKey {
    Group(String),
    Direct(String),
}

impl ConversationKey {
    pub fn group(id: impl Into<String>) -> Self {
        Self::Group(id.into())
    }

    pub fn direct(id: impl Into<String>) -> Self {
        Self::Direct(id.into())
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Group(id) | Self::Direct(id) => id,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(id) => write!(f, "group:{id}"),
            Self::Direct(id) => write!(f, "dm:{id}"),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("conversation key missing prefix: {s}"))?;
        anyhow::ensure!(!id.is_empty(), "conversation key has empty id: {s}");
        match prefix {
            "group" => Ok(Self::Group(id.to_owned())),
            "dm" => Ok(Self::Direct(id.to_owned())),
            other => anyhow::bail!("unknown conversation kind '{other}' in key: {s}"),
        }
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        value.parse()
    }
}

/// Time-ordered record identifier (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlates every record produced by one agent invocation.
///
/// Ordered lexically; reconstruction uses that order to break ties between
/// runs that ended at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Request,
    Response,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl FromStr for RecordKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "request" => Ok(Self::Request),
            "response" => Ok(Self::Response),
            other => anyhow::bail!("unknown record kind: {other}"),
        }
    }
}

/// One piece of record content. The runtime never looks inside these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Image { .. } => None,
        }
    }
}

/// An immutable entry of the flat conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: RecordId,
    pub conversation: ConversationKey,
    pub actor_id: Option<String>,
    pub kind: RecordKind,
    pub parts: Vec<ContentPart>,
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MessageRecord {
    pub fn request(
        conversation: ConversationKey,
        actor_id: Option<String>,
        parts: Vec<ContentPart>,
    ) -> Self {
        Self::new(conversation, actor_id, RecordKind::Request, parts)
    }

    pub fn response(conversation: ConversationKey, parts: Vec<ContentPart>) -> Self {
        Self::new(conversation, None, RecordKind::Response, parts)
    }

    fn new(
        conversation: ConversationKey,
        actor_id: Option<String>,
        kind: RecordKind,
        parts: Vec<ContentPart>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            conversation,
            actor_id,
            kind,
            parts,
            timestamp: Utc::now(),
            run_id: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Concatenated text parts, newline separated.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Contiguous records sharing one run id (or one stretch of orphans).
///
/// Always holds at least one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    records: Vec<MessageRecord>,
}

impl Turn {
    pub fn new(first: MessageRecord) -> Self {
        Self {
            records: vec![first],
        }
    }

    /// Build a turn from an already-grouped list. Fails on an empty list or
    /// when the records disagree on their run id.
    pub fn from_records(records: Vec<MessageRecord>) -> anyhow::Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| anyhow::anyhow!("a turn needs at least one record"))?;
        if let Some(stray) = records.iter().find(|r| r.run_id != first.run_id) {
            anyhow::bail!(
                "record {} has run {:?}, turn started with {:?}",
                stray.id,
                stray.run_id.as_ref().map(RunId::as_str),
                first.run_id.as_ref().map(RunId::as_str)
            );
        }
        Ok(Self { records })
    }

    /// Callers group by run id before pushing.
    pub(crate) fn push(&mut self, record: MessageRecord) {
        debug_assert_eq!(record.run_id, self.records[0].run_id);
        self.records.push(record);
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.records[0].run_id.as_ref()
    }

    pub fn is_orphan(&self) -> bool {
        self.run_id().is_none()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.records[0].timestamp
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<MessageRecord> {
        self.records
    }
}

/// One candidate run returned by [`TurnStore::query_run_ids`](crate::TurnStore::query_run_ids).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatDirection {
    Inbound,
    Outbound,
}

impl ChatDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// A plain transcript line, independent of the model log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub conversation: ConversationKey,
    pub actor_id: String,
    pub direction: ChatDirection,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// An inbound message from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub conversation: ConversationKey,
    pub sender: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn display_sender(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender)
    }
}

/// An outbound message to be sent via a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub conversation: ConversationKey,
    pub parts: Vec<ContentPart>,
}

impl OutboundMessage {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
