//! Event envelope: the immutable wire record for every event.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::DurabilityPolicy;
use crate::error::EventError;

/// Transport header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "eventType";
/// Transport header carrying the producing service.
pub const HEADER_SOURCE: &str = "source";
/// Transport header carrying the schema version.
pub const HEADER_VERSION: &str = "version";

/// Schema version stamped when the producer does not supply one.
pub const DEFAULT_VERSION: &str = "1.0";

/// Transport-level message headers, mirrored from the envelope.
pub type Headers = BTreeMap<String, String>;

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Producing service id; falls back to the bus `source`.
    pub source: Option<String>,
    /// Free-form metadata copied into the envelope.
    pub metadata: Map<String, Value>,
    /// Schema version; falls back to `"1.0"`.
    pub version: Option<String>,
    /// Reliable-channel routing key; falls back to the event type.
    pub routing_key: Option<String>,
    /// Stream-channel topic; falls back to the derived topic.
    pub topic: Option<String>,
    /// Durability policy for this publish only.
    pub durability: Option<DurabilityPolicy>,
}

impl PublishOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_durability(mut self, durability: DurabilityPolicy) -> Self {
        self.durability = Some(durability);
        self
    }
}

/// Envelope wrapping every event published on the bus.
///
/// `id` and `timestamp` are assigned once at construction. Fields are only
/// readable afterwards, so a redelivered envelope carries identical content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: String,

    #[serde(rename = "type")]
    event_type: String,

    #[serde(with = "millis_timestamp")]
    timestamp: DateTime<Utc>,

    source: String,

    data: Value,

    #[serde(default)]
    metadata: Map<String, Value>,

    #[serde(default = "default_version")]
    version: String,
}

impl EventEnvelope {
    /// Build a new envelope for `event_type`.
    ///
    /// Fails with [`EventError::InvalidEventType`] when the type is empty or
    /// only whitespace.
    pub fn new(
        event_type: &str,
        data: Value,
        options: &PublishOptions,
        default_source: &str,
    ) -> Result<Self, EventError> {
        if event_type.trim().is_empty() {
            return Err(EventError::InvalidEventType {
                event_type: event_type.to_string(),
            });
        }

        Ok(Self {
            id: Uuid::now_v7().to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now().trunc_subsecs(3),
            source: options
                .source
                .clone()
                .unwrap_or_else(|| default_source.to_string()),
            data,
            metadata: options.metadata.clone(),
            version: options.version.clone().unwrap_or_else(default_version),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Decode the payload into a typed value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.data.clone()).map_err(|e| EventError::DeserializationFailed {
            cause: format!("payload of {}: {e}", self.event_type),
        })
    }

    /// Headers mirrored onto the transport message.
    #[must_use]
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_EVENT_TYPE.to_string(), self.event_type.clone());
        headers.insert(HEADER_SOURCE.to_string(), self.source.clone());
        headers.insert(HEADER_VERSION.to_string(), self.version.clone());
        headers
    }

    /// Serialize the envelope to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationFailed {
            event_type: self.event_type.clone(),
            cause: e.to_string(),
        })
    }

    /// Deserialize an envelope from JSON bytes.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationFailed {
                cause: e.to_string(),
            })?;

        if envelope.event_type.trim().is_empty() {
            return Err(EventError::DeserializationFailed {
                cause: "envelope has an empty type".to_string(),
            });
        }

        Ok(envelope)
    }
}

/// ISO-8601 UTC with exactly three fractional digits.
mod millis_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
