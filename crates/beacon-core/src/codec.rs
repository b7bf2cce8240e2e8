//! Record Codec
//!
//! Converts an [`InstanceRecord`] to and from the byte encoding stored in the
//! coordination store. Implementations must round-trip exactly:
//! `decode(encode(r)) == r` for every valid record. Corrupt bytes fail with
//! [`CodecError::Decode`], never a partial or guessed record.

use crate::record::InstanceRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode instance record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed instance record: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Pluggable wire encoding for stored instance records.
pub trait RecordCodec: Send + Sync {
    fn encode(&self, record: &InstanceRecord) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<InstanceRecord, CodecError>;
}

/// Default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordCodec;

impl RecordCodec for JsonRecordCodec {
    fn encode(&self, record: &InstanceRecord) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(record).map_err(CodecError::Encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<InstanceRecord, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_round_trip() {
        let codec = JsonRecordCodec;
        let record = InstanceRecord::new(Uuid::new_v4(), "payments", "10.0.0.5", 9090);

        let bytes = codec.encode(&record).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(record, decoded);
    }

    #[test]
    fn test_round_trip_edge_ports() {
        let codec = JsonRecordCodec;
        for port in [1u16, 80, u16::MAX] {
            let record = InstanceRecord::new(Uuid::new_v4(), "svc", "192.168.1.1", port);
            let decoded = codec.decode(&codec.encode(&record).unwrap()).unwrap();
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn test_corrupt_bytes_fail_decode() {
        let codec = JsonRecordCodec;
        assert!(matches!(
            codec.decode(b"not json at all"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_partial_json_fails_decode() {
        let codec = JsonRecordCodec;
        // Valid JSON, but missing required fields. Must not yield a guessed record.
        assert!(matches!(
            codec.decode(br#"{"service_name":"payments"}"#),
            Err(CodecError::Decode(_))
        ));
    }
}
