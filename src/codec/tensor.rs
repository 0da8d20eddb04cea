//! C1: tensor codec. Bytes-level round-trip is exact for dtype and shape;
//! a truncated or malformed blob never yields a partial map.

use crate::error::DecodeError;
use crate::types::ParameterMap;

pub fn encode(map: &ParameterMap) -> Vec<u8> {
    bincode::serialize(map).expect("ParameterMap encoding is infallible for in-memory values")
}

pub fn decode(bytes: &[u8]) -> Result<ParameterMap, DecodeError> {
    bincode::deserialize(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Tensor};

    fn sample_map() -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert(
            "layer1.weight",
            Tensor::new(DType::F32, vec![2, 2], vec![0u8; 16]),
        );
        map.insert(
            "layer1.bias",
            Tensor::new(DType::F64, vec![2], vec![1u8; 16]),
        );
        map
    }

    #[test]
    fn round_trip_is_exact() {
        let map = sample_map();
        let encoded = encode(&map);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(map, decoded);
    }

    #[test]
    fn truncated_blob_fails_to_decode() {
        let map = sample_map();
        let mut encoded = encode(&map);
        encoded.truncate(encoded.len() / 2);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn empty_input_fails_to_decode() {
        assert!(decode(&[]).is_err());
    }
}
