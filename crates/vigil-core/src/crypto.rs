//! Sealing primitives for the secrets namespace.
//!
//! ChaCha20-Poly1305 AEAD via `ring`; key material is zeroed on drop. Sealed
//! values are laid out as `[nonce (12) || ciphertext || tag (16)]`.

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to draw system entropy")]
    Entropy,
    #[error("seal failed")]
    Seal,
    #[error("open failed (wrong key or tampered data)")]
    Open,
    #[error("malformed sealed value: {0}")]
    Malformed(String),
}

impl From<Unspecified> for CryptoError {
    fn from(_: Unspecified) -> Self {
        CryptoError::Seal
    }
}

/// 256-bit sealing key, zeroed from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKeyMaterial {
    bytes: [u8; KEY_LEN],
}

impl SealingKeyMaterial {
    /// Draw a fresh random key from system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| CryptoError::Entropy)?;
        Ok(Self { bytes })
    }

    /// Wrap existing key material. Must be exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::Malformed(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut material = [0u8; KEY_LEN];
        material.copy_from_slice(bytes);
        Ok(Self { bytes: material })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// ring's bound keys consume nonces through a sequence; we only ever need
/// one nonce per seal/open call.
struct SingleNonce(Option<Nonce>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.0.take().ok_or(Unspecified)
    }
}

/// Seal `plaintext` under `key` with a random nonce.
pub fn seal(key: &SealingKeyMaterial, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::Entropy)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Seal)?;
    let mut sealing = SealingKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Seal)?;

    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Open a value produced by [`seal`]. Fails on a wrong key or any tampering.
pub fn open(key: &SealingKeyMaterial, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Malformed(format!(
            "sealed value too short: {} bytes",
            sealed.len()
        )));
    }

    let nonce_bytes: [u8; NONCE_LEN] = sealed[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::Malformed("nonce extraction failed".into()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Open)?;
    let mut opening = OpeningKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = sealed[NONCE_LEN..].to_vec();
    let plaintext = opening
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Open)?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = SealingKeyMaterial::generate().unwrap();
        let sealed = seal(&key, b"service-label-a1b2c3").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"service-label-a1b2c3");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = SealingKeyMaterial::generate().unwrap();
        let other = SealingKeyMaterial::generate().unwrap();
        let sealed = seal(&key, b"secret").unwrap();
        assert!(matches!(open(&other, &sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn tampering_is_rejected() {
        let key = SealingKeyMaterial::generate().unwrap();
        let mut sealed = seal(&key, b"secret").unwrap();
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0xff;
        assert!(matches!(open(&key, &sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn random_nonces_give_distinct_ciphertexts() {
        let key = SealingKeyMaterial::generate().unwrap();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), NONCE_LEN + 4 + TAG_LEN);
    }

    #[test]
    fn truncated_input_is_malformed() {
        let key = SealingKeyMaterial::generate().unwrap();
        assert!(matches!(
            open(&key, &[0u8; 8]),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(SealingKeyMaterial::from_bytes(&[1u8; 16]).is_err());
        assert!(SealingKeyMaterial::from_bytes(&[1u8; 32]).is_ok());
    }
}
