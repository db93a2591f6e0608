use aes::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};

use crate::crypto::{unknown_encryption, EncryptionAlgorithm, MIN_MASTER_KEY_LEN};
use crate::error::{CoreResult, CryptoErrorKind};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Unencrypted passthrough. Used by the `NONE` scheme named in the end-to-end test
/// scenarios (§8) and by repositories that only want content hashing, not confidentiality.
pub struct NoEncryption;

impl EncryptionAlgorithm for NoEncryption {
    fn name(&self) -> &'static str {
        "NONE"
    }

    fn min_iv_len(&self) -> usize {
        0
    }

    fn is_authenticated(&self) -> bool {
        false
    }

    fn encrypt(&self, plaintext: &[u8], _iv: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _iv: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// `ENCRYPTED_HMAC_SHA256_AES256_SIV`: AES-256-CTR with a synthetic IV (the first 16 bytes
/// of the caller-supplied iv, which is itself a content hash). The same routine serves both
/// directions since CTR-mode keystream application is an involution (§4.1).
pub struct Aes256CtrSyntheticIv {
    key: Box<[u8; 32]>,
}

impl EncryptionAlgorithm for Aes256CtrSyntheticIv {
    fn name(&self) -> &'static str {
        "ENCRYPTED_HMAC_SHA256_AES256_SIV"
    }

    fn min_iv_len(&self) -> usize {
        16
    }

    fn is_authenticated(&self) -> bool {
        false
    }

    fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>> {
        self.apply_keystream(plaintext, iv)
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>> {
        self.apply_keystream(ciphertext, iv)
    }
}

impl Aes256CtrSyntheticIv {
    fn apply_keystream(&self, data: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>> {
        if iv.len() < self.min_iv_len() {
            return Err(CryptoErrorKind::HashTooShortForEncryption {
                hash_len: iv.len(),
                iv_len: self.min_iv_len(),
            }
            .into());
        }
        let mut buf = data.to_vec();
        let key = GenericArray::from_slice(self.key.as_ref());
        let nonce = GenericArray::from_slice(&iv[..16]);
        let mut cipher = Aes256Ctr::new(key, nonce);
        cipher.apply_keystream(&mut buf);
        Ok(buf)
    }
}

pub(crate) fn build(name: &str, master_key: &[u8]) -> CoreResult<Box<dyn EncryptionAlgorithm>> {
    match name {
        "NONE" => Ok(Box::new(NoEncryption)),
        "ENCRYPTED_HMAC_SHA256_AES256_SIV" => {
            if master_key.len() < MIN_MASTER_KEY_LEN {
                return Err(CryptoErrorKind::MasterKeyTooShort {
                    needed: MIN_MASTER_KEY_LEN,
                    got: master_key.len(),
                }
                .into());
            }
            let mut key = Box::new([0u8; 32]);
            key.copy_from_slice(&master_key[..32]);
            Ok(Box::new(Aes256CtrSyntheticIv { key }))
        }
        other => Err(unknown_encryption(other).into()),
    }
}
