use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use uuid::Uuid;

/// An opaque ingestion event as handed over by a protocol adapter.
///
/// The buffering core never inspects the payload; it only counts and
/// sizes items. This type is the canonical concrete instantiation of
/// [`BufferItem`], but the core is generic and adapters may carry their
/// own richer types through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Origin adapter tag, e.g. "syslog-udp" or "file-tailer".
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Raw wire bytes, untouched by the buffer.
    #[serde(with = "payload_bytes")]
    pub payload: Bytes,
    /// Ingestion metadata (remote address, adapter labels).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: Utc::now(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Approximate in-memory footprint.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.id.len()
            + self.source.len()
            + self.payload.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

mod payload_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(payload)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        Ok(Bytes::from(raw))
    }
}

/// Bound required of any type flowing through the buffer core.
///
/// Serde bounds exist only so the disk tier can persist spilled items;
/// the memory tier imposes nothing beyond `Send`.
pub trait BufferItem: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> BufferItem for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_round_trip_keeps_payload() {
        let event = Event::new("syslog-udp", Bytes::from_static(b"<34>Oct 11 test"))
            .with_metadata("remote_addr", "10.0.0.7");

        let encoded =
            bincode::serde::encode_to_vec(&event, bincode::config::standard()).unwrap();
        let (decoded, _): (Event, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn estimated_size_counts_payload_and_metadata() {
        let small = Event::new("file", Bytes::from_static(b"x"));
        let large = Event::new("file", Bytes::from(vec![0u8; 4096]));
        assert!(large.estimated_size() > small.estimated_size() + 4000);
    }
}
