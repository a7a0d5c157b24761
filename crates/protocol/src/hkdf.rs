//! HKDF key derivation (RFC 5869) over HMAC-SHA-256.
//!
//! Used once per session to stretch the raw key-agreement secret into the
//! directional IV, cipher, and MAC keys. Extract and expand are exposed
//! separately so the test vectors can exercise each stage.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Output size of the underlying hash.
const HASH_LEN: usize = 32;

/// Maximum expandable output: 255 hash blocks.
pub const MAX_OUTPUT_LENGTH: usize = 255 * HASH_LEN;

/// Extracts a pseudorandom key from the input keying material.
///
/// An empty salt is replaced by a string of `HASH_LEN` zero bytes, per the
/// RFC.
pub fn extract(salt: &[u8], ikm: &[u8]) -> [u8; HASH_LEN] {
    let zeros = [0u8; HASH_LEN];
    let salt = if salt.is_empty() { &zeros[..] } else { salt };

    let mut mac = hmac_with_key(salt);
    mac.update(ikm);

    let mut prk = [0u8; HASH_LEN];
    prk.copy_from_slice(&mac.finalize().into_bytes());
    prk
}

/// Expands a pseudorandom key into `len` bytes of output keying material.
///
/// `len` may be zero; it must not exceed [`MAX_OUTPUT_LENGTH`].
pub fn expand(prk: &[u8; HASH_LEN], info: &[u8], len: usize) -> Result<Vec<u8>> {
    if len > MAX_OUTPUT_LENGTH {
        return Err(ProtocolError::DerivationTooLong {
            requested: len,
            max: MAX_OUTPUT_LENGTH,
        });
    }

    let mut okm = Vec::with_capacity(len);
    let mut previous: [u8; HASH_LEN] = [0u8; HASH_LEN];
    let mut block_index = 0u8;

    while okm.len() < len {
        block_index += 1;

        let mut mac = hmac_with_key(prk);
        if block_index > 1 {
            mac.update(&previous);
        }
        mac.update(info);
        mac.update(&[block_index]);

        previous.copy_from_slice(&mac.finalize().into_bytes());

        let take = HASH_LEN.min(len - okm.len());
        okm.extend_from_slice(&previous[..take]);
    }

    Ok(okm)
}

/// One-shot extract-then-expand.
pub fn derive(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let prk = extract(salt, ikm);
    expand(&prk, info, len)
}

fn hmac_with_key(key: &[u8]) -> HmacSha256 {
    // HMAC-SHA-256 accepts keys of any length.
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vectors from RFC 5869 appendix A.

    #[test]
    fn test_rfc5869_case_1() {
        let ikm = hex::decode("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").unwrap();
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let prk = extract(&salt, &ikm);
        assert_eq!(
            hex::encode(prk),
            "077709362c2e32df0ddc3f0dc47bba6390b6c73bb50f9c3122ec844ad7c2b3e5"
        );

        let okm = expand(&prk, &info, 42).unwrap();
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_rfc5869_case_2() {
        let ikm = hex::decode(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f\
             202122232425262728292a2b2c2d2e2f303132333435363738393a3b3c3d3e3f\
             404142434445464748494a4b4c4d4e4f",
        )
        .unwrap();
        let salt = hex::decode(
            "606162636465666768696a6b6c6d6e6f707172737475767778797a7b7c7d7e7f\
             808182838485868788898a8b8c8d8e8f909192939495969798999a9b9c9d9e9f\
             a0a1a2a3a4a5a6a7a8a9aaabacadaeaf",
        )
        .unwrap();
        let info = hex::decode(
            "b0b1b2b3b4b5b6b7b8b9babbbcbdbebfc0c1c2c3c4c5c6c7c8c9cacbcccdcecf\
             d0d1d2d3d4d5d6d7d8d9dadbdcdddedfe0e1e2e3e4e5e6e7e8e9eaebecedeeef\
             f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff",
        )
        .unwrap();

        let okm = derive(&salt, &ikm, &info, 82).unwrap();
        assert_eq!(
            hex::encode(okm),
            "b11e398dc80327a1c8e7f78c596a49344f012eda2d4efad8a050cc4c19afa97c\
             59045a99cac7827271cb41c65e590e09da3275600c2f09b8367793a9aca3db71\
             cc30c58179ec3e87c14c01d5c1f3434f1d87"
        );
    }

    #[test]
    fn test_rfc5869_case_3_empty_salt_and_info() {
        let ikm = hex::decode("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").unwrap();

        let prk = extract(&[], &ikm);
        assert_eq!(
            hex::encode(prk),
            "19ef24a32c717b167f33a91d6f648bdf96596776afdb6377ac434c1c293ccb04"
        );

        let okm = expand(&prk, &[], 42).unwrap();
        assert_eq!(
            hex::encode(okm),
            "8da4e775a563c18f715f802a063c5a31b8a11f5c5ee1879ec3454e5f3c738d2d9d201395faa4b61a96c8"
        );
    }

    #[test]
    fn test_zero_length_output() {
        let okm = derive(b"salt", b"ikm", b"info", 0).unwrap();
        assert!(okm.is_empty());
    }

    #[test]
    fn test_maximum_length_output() {
        let okm = derive(b"salt", b"ikm", b"info", MAX_OUTPUT_LENGTH).unwrap();
        assert_eq!(okm.len(), MAX_OUTPUT_LENGTH);
    }

    #[test]
    fn test_over_maximum_length_rejected() {
        let err = derive(b"salt", b"ikm", b"info", MAX_OUTPUT_LENGTH + 1).unwrap_err();
        assert!(matches!(err, ProtocolError::DerivationTooLong { .. }));
    }

    #[test]
    fn test_distinct_info_produces_distinct_output() {
        let a = derive(b"salt", b"ikm", b"context-a", 32).unwrap();
        let b = derive(b"salt", b"ikm", b"context-b", 32).unwrap();
        assert_ne!(a, b);
    }
}
