//! Encoding contract for values kept in the queue store.
//!
//! Queue keys double as store key suffixes and set members, so their
//! encoding must be stable and human-readable. Tasks are opaque payloads
//! and normally go through the JSON helpers below.

use std::fmt::Display;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// A value with an explicit string encoding for the queue store.
pub trait StoreCodec: Sized {
    /// Encodes the value for storage.
    fn encode(&self) -> Result<String, StoreError>;

    /// Decodes a value previously produced by [`StoreCodec::encode`].
    fn decode(raw: &str) -> Result<Self, StoreError>;
}

impl StoreCodec for String {
    fn encode(&self) -> Result<String, StoreError> {
        Ok(self.clone())
    }

    fn decode(raw: &str) -> Result<Self, StoreError> {
        Ok(raw.to_string())
    }
}

/// Identifier of one queue in a [`TaskScheduler`](super::TaskScheduler).
pub trait QueueId: StoreCodec + Clone + Eq + Hash + Display + Send + Sync + 'static {}

impl<T> QueueId for T where T: StoreCodec + Clone + Eq + Hash + Display + Send + Sync + 'static {}

/// Element stored in a [`TaskScheduler`](super::TaskScheduler) queue.
pub trait QueueItem: StoreCodec + Send + Sync + 'static {}

impl<T> QueueItem for T where T: StoreCodec + Send + Sync + 'static {}

/// Encodes `value` as compact JSON.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Encode(e.to_string()))
}

/// Decodes a JSON value written by [`encode_json`].
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode {
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_decode_json_reports_raw_value() {
        let err = decode_json::<Sample>("{not json").unwrap_err();
        match err {
            StoreError::Decode { value, .. } => assert_eq!(value, "{not json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_encode_json_is_compact() {
        let encoded = encode_json(&Sample {
            name: "a".to_string(),
            count: 2,
        })
        .unwrap();
        assert_eq!(encoded, r#"{"name":"a","count":2}"#);
    }
}
