//! Payload serialization helpers.
//!
//! Envelopes cross the wire as postcard bytes. These wrappers pin the error
//! mapping so call sites stay on `RpcError` throughout.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::RpcError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    postcard::to_allocvec(value).map_err(RpcError::Serialize)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    postcard::from_bytes(bytes).map_err(RpcError::Deserialize)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pair {
        name: String,
        value: i32,
    }

    #[test]
    fn encode_decode_round_trip() {
        let pair = Pair {
            name: "answer".into(),
            value: 42,
        };
        let bytes = encode(&pair).unwrap();
        let decoded: Pair = decode(&bytes).unwrap();
        assert_eq!(decoded, pair);
    }

    #[test]
    fn decode_of_garbage_is_a_deserialize_error() {
        let result: Result<Pair, _> = decode(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(RpcError::Deserialize(_))));
    }
}
