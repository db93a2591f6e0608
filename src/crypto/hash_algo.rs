use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::{unknown_hash, HashAlgorithm};
use crate::error::CoreResult;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256, full 256-bit output. Unencrypted default hash for new repositories that
/// don't request truncation.
pub struct HmacSha256Full {
    secret: Vec<u8>,
}

impl HashAlgorithm for HmacSha256Full {
    fn name(&self) -> &'static str {
        "HMAC-SHA256"
    }

    fn output_len(&self) -> usize {
        32
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// HMAC-SHA256, truncated to the first 128 bits. Default hash used by the encrypted
/// repository format (§4.1).
pub struct HmacSha256Truncated128 {
    secret: Vec<u8>,
}

impl HashAlgorithm for HmacSha256Truncated128 {
    fn name(&self) -> &'static str {
        "HMAC-SHA256-128"
    }

    fn output_len(&self) -> usize {
        16
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes()[..16].to_vec()
    }
}

pub(crate) fn build(name: &str, hmac_secret: &[u8]) -> CoreResult<Box<dyn HashAlgorithm>> {
    match name {
        "HMAC-SHA256" => Ok(Box::new(HmacSha256Full {
            secret: hmac_secret.to_vec(),
        })),
        "HMAC-SHA256-128" => Ok(Box::new(HmacSha256Truncated128 {
            secret: hmac_secret.to_vec(),
        })),
        other => Err(unknown_hash(other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_output() {
        let h = build("HMAC-SHA256-128", b"secret").unwrap();
        assert_eq!(h.compute(b"hello"), h.compute(b"hello"));
    }

    #[test]
    fn different_secret_different_output() {
        let a = build("HMAC-SHA256", b"one").unwrap();
        let b = build("HMAC-SHA256", b"two").unwrap();
        assert_ne!(a.compute(b"hello"), b.compute(b"hello"));
    }

    #[test]
    fn truncated_is_prefix_of_full_when_secret_matches() {
        let full = build("HMAC-SHA256", b"secret").unwrap();
        let truncated = build("HMAC-SHA256-128", b"secret").unwrap();
        assert_eq!(&full.compute(b"data")[..16], &truncated.compute(b"data")[..]);
    }

    #[test]
    fn unknown_name_rejected() {
        assert!(build("NOT-A-HASH", b"secret").is_err());
    }
}
