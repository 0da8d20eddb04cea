//! C2: HE codec. Two operations, `encrypt`/`decrypt`; the server only ever
//! calls `decrypt`. The reference implementation is a pass-through over the
//! tensor codec (spec §9 explicitly allows this) tagged with a magic prefix
//! and a checksum so a genuinely corrupt blob is distinguishable from a
//! tensor-decode failure once a real HE library is swapped in.

use sha2::{Digest, Sha256};

use crate::codec::tensor;
use crate::error::PrivacyDecodeError;
use crate::types::ParameterMap;

const MAGIC: &[u8; 4] = b"HE01";
const CHECKSUM_LEN: usize = 32;

pub fn encrypt(map: &ParameterMap) -> Vec<u8> {
    let body = tensor::encode(map);
    let checksum = Sha256::digest(&body);
    let mut out = Vec::with_capacity(MAGIC.len() + CHECKSUM_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&checksum);
    out.extend_from_slice(&body);
    out
}

pub fn decrypt(bytes: &[u8]) -> Result<ParameterMap, PrivacyDecodeError> {
    if bytes.len() < MAGIC.len() + CHECKSUM_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(PrivacyDecodeError::DecryptFailed(
            "missing or wrong HE envelope magic".to_string(),
        ));
    }
    let checksum = &bytes[MAGIC.len()..MAGIC.len() + CHECKSUM_LEN];
    let body = &bytes[MAGIC.len() + CHECKSUM_LEN..];
    if Sha256::digest(body).as_slice() != checksum {
        return Err(PrivacyDecodeError::DecryptFailed(
            "HE envelope checksum mismatch".to_string(),
        ));
    }
    tensor::decode(body)
        .map_err(|e| PrivacyDecodeError::DecryptFailed(format!("inner tensor decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Tensor};

    fn sample_map() -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert("w", Tensor::new(DType::F32, vec![1], vec![0u8; 4]));
        map
    }

    #[test]
    fn round_trip_through_pass_through_codec() {
        let map = sample_map();
        let encrypted = encrypt(&map);
        let decrypted = decrypt(&encrypted).unwrap();
        assert_eq!(map, decrypted);
    }

    #[test]
    fn tampered_envelope_fails_decrypt() {
        let map = sample_map();
        let mut encrypted = encrypt(&map);
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert!(decrypt(&encrypted).is_err());
    }

    #[test]
    fn wrong_magic_fails_decrypt() {
        let bytes = vec![0u8; 64];
        assert!(decrypt(&bytes).is_err());
    }
}
