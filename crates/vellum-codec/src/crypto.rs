// Message body sealing (AES-256-GCM).

use crate::keys::{KeyMaterial, KeyProvider};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use vellum_models::message::{SealedPayload, IV_LEN};
use vellum_models::{InvalidArgument, TenantId};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown or retired key '{0}'")]
    UnknownKey(String),
    #[error("no active key for tenant {0}")]
    NoActiveKey(TenantId),
    #[error("invalid key id '{0}'")]
    InvalidKeyId(String),
    #[error("key material must be 32 bytes (got {0})")]
    InvalidKeyMaterial(usize),
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (authentication error)")]
    DecryptionFailed,
    #[error(transparent)]
    Malformed(#[from] InvalidArgument),
}

/// Seals and opens message bodies.
///
/// Every `seal` draws a fresh random 96-bit IV; callers can never supply
/// one. The key id is bound as associated data, so a payload relabelled
/// with another key id fails to open even if both keys were equal.
#[derive(Clone)]
pub struct CryptoCodec {
    keys: Arc<dyn KeyProvider>,
}

impl CryptoCodec {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn key_provider(&self) -> &Arc<dyn KeyProvider> {
        &self.keys
    }

    /// Seal with an explicit key id.
    pub fn seal(&self, plaintext: &[u8], key_id: &str) -> Result<SealedPayload, CryptoError> {
        let key = self
            .keys
            .resolve(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;
        let cipher = cipher_for(&key)?;

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), key_id.as_bytes(), &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(SealedPayload::new(buffer, &iv, tag.as_slice(), key_id)?)
    }

    /// Seal with the tenant's currently active key.
    pub fn seal_for_tenant(
        &self,
        tenant_id: TenantId,
        plaintext: &[u8],
    ) -> Result<SealedPayload, CryptoError> {
        let key_id = self
            .keys
            .active_key_id(tenant_id)
            .ok_or(CryptoError::NoActiveKey(tenant_id))?;
        self.seal(plaintext, &key_id)
    }

    pub fn open(&self, payload: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .keys
            .resolve(payload.key_id())
            .ok_or_else(|| CryptoError::UnknownKey(payload.key_id().to_string()))?;
        let cipher = cipher_for(&key)?;

        let mut buffer = payload.ciphertext().to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(payload.iv()),
                payload.key_id().as_bytes(),
                &mut buffer,
                Tag::from_slice(payload.tag()),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buffer)
    }
}

fn cipher_for(key: &KeyMaterial) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::InvalidKeyMaterial(key.as_bytes().len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Keyring, KEY_SIZE};

    fn codec_with(key_id: &str, key: [u8; KEY_SIZE]) -> (CryptoCodec, Arc<Keyring>) {
        let ring = Arc::new(Keyring::new());
        ring.rotate(1, key_id, KeyMaterial::new(key)).unwrap();
        (CryptoCodec::new(ring.clone()), ring)
    }

    fn flip_bit(bytes: &[u8], bit: usize) -> Vec<u8> {
        let mut out = bytes.to_vec();
        out[bit / 8] ^= 1 << (bit % 8);
        out
    }

    #[test]
    fn seal_open_round_trip() {
        let (codec, _) = codec_with("k1", [0x11; KEY_SIZE]);
        let sealed = codec.seal(b"hello", "k1").unwrap();
        assert_eq!(sealed.ciphertext().len(), 5);
        assert_eq!(sealed.key_id(), "k1");
        assert_eq!(codec.open(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let (codec, _) = codec_with("k1", [0x11; KEY_SIZE]);
        let sealed = codec.seal(b"", "k1").unwrap();
        assert!(sealed.ciphertext().is_empty());
        assert!(codec.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn every_seal_uses_a_fresh_iv() {
        let (codec, _) = codec_with("k1", [0x11; KEY_SIZE]);
        let a = codec.seal(b"same", "k1").unwrap();
        let b = codec.seal(b"same", "k1").unwrap();
        assert_ne!(a.iv(), b.iv());
        assert_ne!(a.ciphertext(), b.ciphertext());
    }

    #[test]
    fn any_flipped_ciphertext_bit_fails() {
        let (codec, _) = codec_with("k1", [0x22; KEY_SIZE]);
        let sealed = codec.seal(b"tamper me", "k1").unwrap();
        for bit in 0..sealed.ciphertext().len() * 8 {
            let forged = SealedPayload::new(
                flip_bit(sealed.ciphertext(), bit),
                sealed.iv(),
                sealed.tag(),
                sealed.key_id(),
            )
            .unwrap();
            assert!(matches!(codec.open(&forged), Err(CryptoError::DecryptionFailed)));
        }
    }

    #[test]
    fn any_flipped_tag_bit_fails() {
        let (codec, _) = codec_with("k1", [0x22; KEY_SIZE]);
        let sealed = codec.seal(b"tamper me", "k1").unwrap();
        for bit in 0..sealed.tag().len() * 8 {
            let forged = SealedPayload::new(
                sealed.ciphertext().to_vec(),
                sealed.iv(),
                &flip_bit(sealed.tag(), bit),
                sealed.key_id(),
            )
            .unwrap();
            assert!(codec.open(&forged).is_err());
        }
    }

    #[test]
    fn wrong_key_fails() {
        let (codec, ring) = codec_with("k1", [0x01; KEY_SIZE]);
        let sealed = codec.seal(b"secret", "k1").unwrap();
        ring.insert("k1", KeyMaterial::new([0x02; KEY_SIZE])).unwrap();
        assert!(matches!(codec.open(&sealed), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn relabelled_key_id_fails() {
        let (codec, ring) = codec_with("k1", [0x05; KEY_SIZE]);
        ring.insert("k2", KeyMaterial::new([0x05; KEY_SIZE])).unwrap();
        let sealed = codec.seal(b"secret", "k1").unwrap();
        let relabelled = SealedPayload::new(
            sealed.ciphertext().to_vec(),
            sealed.iv(),
            sealed.tag(),
            "k2",
        )
        .unwrap();
        assert!(codec.open(&relabelled).is_err());
    }

    #[test]
    fn retired_key_cannot_open_history() {
        let (codec, ring) = codec_with("k1", [0x03; KEY_SIZE]);
        let sealed = codec.seal(b"old", "k1").unwrap();
        ring.retire("k1");
        assert!(matches!(codec.open(&sealed), Err(CryptoError::UnknownKey(_))));
    }

    #[test]
    fn rotated_key_still_opens_history() {
        let (codec, ring) = codec_with("k1", [0x03; KEY_SIZE]);
        let old = codec.seal_for_tenant(1, b"old").unwrap();
        ring.rotate(1, "k2", KeyMaterial::new([0x04; KEY_SIZE])).unwrap();
        let new = codec.seal_for_tenant(1, b"new").unwrap();
        assert_eq!(new.key_id(), "k2");
        assert_eq!(codec.open(&old).unwrap(), b"old");
        assert_eq!(codec.open(&new).unwrap(), b"new");
    }

    #[test]
    fn unknown_tenant_has_no_key() {
        let (codec, _) = codec_with("k1", [0x03; KEY_SIZE]);
        assert!(matches!(
            codec.seal_for_tenant(99, b"x"),
            Err(CryptoError::NoActiveKey(99))
        ));
    }
}
