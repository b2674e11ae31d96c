use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use canopy_core::RankId;

/// Envelope schema this build speaks. Ranks ignore envelopes of any other
/// version rather than guess at their payloads.
pub const ENVELOPE_VERSION: u16 = 1;

/// Wire-format envelope for rank-to-rank traffic.
///
/// Envelopes are serialized with MessagePack. The `topic` selects the
/// handler on the receiving rank, `source` names the sending rank, and
/// `correlation_id` ties a settlement back to the donation that caused it
/// in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing topic (see [`crate::topics`]).
    pub topic: String,

    /// Rank that sent the message.
    pub source: RankId,

    /// Payload bytes: MessagePack for typed payloads, or an already-encoded
    /// donation bundle.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    pub correlation_id: Uuid,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    ENVELOPE_VERSION
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        source: RankId,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self::raw(topic, source, rmp_serde::to_vec_named(payload)?))
    }

    /// Wrap bytes that are already encoded.
    pub fn raw(topic: impl Into<String>, source: RankId, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            source,
            payload,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            version: ENVELOPE_VERSION,
        }
    }

    pub fn is_current_version(&self) -> bool {
        self.version == ENVELOPE_VERSION
    }

    /// Reuse an existing correlation ID (replies, settlements).
    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// Serialize this entire message envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a message envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{topics, WorkRequest};

    #[test]
    fn typed_payload_roundtrips() {
        let request = WorkRequest { from: RankId(3), budget: 4096 };
        let msg = Message::new(topics::WORK_REQUEST, RankId(3), &request).unwrap();
        assert_eq!(msg.topic, topics::WORK_REQUEST);
        assert_eq!(msg.decode::<WorkRequest>().unwrap(), request);
    }

    #[test]
    fn raw_envelope_survives_bytes_roundtrip() {
        let msg = Message::raw(topics::DONATION_BUNDLE, RankId(1), vec![0xc0, 1, 2, 3]);
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.source, RankId(1));
        assert_eq!(decoded.correlation_id, msg.correlation_id);
        assert_eq!(decoded.payload, vec![0xc0, 1, 2, 3]);
    }

    #[test]
    fn envelope_without_version_reads_as_current() {
        #[derive(Serialize)]
        struct Legacy {
            topic: String,
            source: RankId,
            #[serde(with = "serde_bytes")]
            payload: Vec<u8>,
            timestamp: DateTime<Utc>,
            correlation_id: Uuid,
        }
        let legacy = Legacy {
            topic: topics::SHUTDOWN.into(),
            source: RankId(0),
            payload: vec![],
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
        };
        let decoded = Message::from_bytes(&rmp_serde::to_vec_named(&legacy).unwrap()).unwrap();
        assert!(decoded.is_current_version());

        let mut newer = Message::raw(topics::SHUTDOWN, RankId(0), vec![]);
        newer.version = ENVELOPE_VERSION + 1;
        let decoded = Message::from_bytes(&newer.to_bytes().unwrap()).unwrap();
        assert!(!decoded.is_current_version());
    }

    #[test]
    fn correlated_preserves_id() {
        let id = Uuid::new_v4();
        let msg = Message::raw("reply", RankId(0), vec![]).correlated(id);
        assert_eq!(msg.correlation_id, id);
    }
}
