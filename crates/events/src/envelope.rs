use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use modbridge_core::{MessageId, PeerId};

/// Category of a cross-process query (`type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryKind {
    /// Read-only question (e.g. "which roles does this guild have?").
    Query,
    /// Administrative action the peer should perform.
    Management,
}

impl core::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QueryKind::Query => f.write_str("QUERY"),
            QueryKind::Management => f.write_str("MANAGEMENT"),
        }
    }
}

/// Envelope for a request sent to a peer process.
///
/// Notes:
/// - `message_id` is the correlation id; the reply must echo it unchanged.
/// - `timestamp` is epoch milliseconds at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEnvelope {
    #[serde(rename = "type")]
    kind: QueryKind,
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<JsonValue>,
    message_id: MessageId,
    timestamp: i64,
}

impl QueryEnvelope {
    pub fn new(
        kind: QueryKind,
        event: impl Into<String>,
        data: Option<JsonValue>,
        message_id: MessageId,
        timestamp: i64,
    ) -> Self {
        Self {
            kind,
            event: event.into(),
            data,
            message_id,
            timestamp,
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> Option<&JsonValue> {
        self.data.as_ref()
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn into_data(self) -> Option<JsonValue> {
        self.data
    }
}

/// Envelope for a reply; `data.success` decides resolve vs reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    message_id: MessageId,
    data: JsonValue,
}

impl ReplyEnvelope {
    pub fn new(message_id: MessageId, data: JsonValue) -> Self {
        Self { message_id, data }
    }

    /// Successful reply. Object payloads are flattened next to `success`;
    /// anything else is nested under `data`.
    pub fn success(message_id: MessageId, payload: JsonValue) -> Self {
        let mut body = match payload {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        body.insert("success".to_string(), JsonValue::Bool(true));
        Self::new(message_id, JsonValue::Object(body))
    }

    pub fn failure(message_id: MessageId, error: impl Into<String>) -> Self {
        Self::new(
            message_id,
            serde_json::json!({ "success": false, "error": error.into() }),
        )
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn into_data(self) -> JsonValue {
        self.data
    }

    /// A missing or non-boolean `success` counts as failure.
    pub fn is_success(&self) -> bool {
        self.data
            .get("success")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    pub fn error(&self) -> Option<&str> {
        self.data.get("error").and_then(JsonValue::as_str)
    }
}

/// Anything that travels over the channel, classified by shape.
///
/// Untagged: a body is a query if it has `type`/`event`/`messageId`/`timestamp`,
/// a reply if it has `messageId` and `data`, and opaque otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelMessage {
    Query(QueryEnvelope),
    Reply(ReplyEnvelope),
    Other(JsonValue),
}

impl ChannelMessage {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl From<QueryEnvelope> for ChannelMessage {
    fn from(value: QueryEnvelope) -> Self {
        Self::Query(value)
    }
}

impl From<ReplyEnvelope> for ChannelMessage {
    fn from(value: ReplyEnvelope) -> Self {
        Self::Reply(value)
    }
}

/// A message received from a specific connection.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: PeerId,
    pub message: ChannelMessage,
}
