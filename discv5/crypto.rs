//! Pluggable crypto primitives used by the packet codec and session layer.
//!
//! Grounded on `discv5/session.rs`'s direct use of `hkdf`/`sha2`/`secp256k1`,
//! generalized behind a trait so tests can swap in a fixed-nonce fake without
//! touching the session state machine. Production code always uses
//! [`DefaultCryptoProvider`].
use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};
use aes_gcm::{Aes128Gcm, KeyInit, aead::Aead};
use ctr::Ctr64BE;
use hkdf::Hkdf;
use secp256k1::{Message as SecpMessage, PublicKey, SECP256K1, SecretKey, ecdh::shared_secret_point, ecdsa::Signature};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes128Ctr64BE = Ctr64BE<Aes128>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AES-GCM encryption or decryption failed")]
    Aead,
    #[error("HKDF output length request is invalid for SHA-256")]
    InvalidHkdfLength,
    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

/// Capability interface for the primitives the session and packet layers
/// need. A trait object boundary, not a performance-sensitive hot path: it
/// exists so the handshake/codec code never references a concrete crypto
/// crate directly.
pub trait CryptoProvider: Send + Sync {
    fn sha256(&self, data: &[u8]) -> [u8; 32];

    /// HKDF-Extract-then-Expand in one call, as every discv5 key derivation
    /// site needs both stages back to back.
    fn hkdf_derive(&self, salt: &[u8], ikm: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>, CryptoError>;

    fn aes_gcm_encrypt(&self, key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn aes_gcm_decrypt(&self, key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// In-place AES-128-CTR, used for static-header/authdata masking. `iv` is
    /// the first 16 bytes of the packet.
    fn aes_ctr_apply(&self, key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]);

    /// SEC1-compressed ECDH shared secret, `y`-parity prefixed.
    fn ecdh_compressed(&self, local_secret: &SecretKey, remote_public: &PublicKey) -> [u8; 33];

    fn sign(&self, secret: &SecretKey, digest: &[u8; 32]) -> Result<Signature, CryptoError>;

    fn verify(&self, public: &PublicKey, digest: &[u8; 32], signature: &Signature) -> bool;
}

/// The one concrete provider shipped in this crate: `sha2` for SHA-256,
/// `hkdf` for key derivation, `aes-gcm`/`aes`+`ctr` for message
/// encryption and header masking, `secp256k1` for ECDH and id-signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCryptoProvider;

impl CryptoProvider for DefaultCryptoProvider {
    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn hkdf_derive(&self, salt: &[u8], ikm: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut out = vec![0u8; out_len];
        hkdf.expand(info, &mut out).map_err(|_| CryptoError::InvalidHkdfLength)?;
        Ok(out)
    }

    fn aes_gcm_encrypt(&self, key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new(key.into());
        cipher
            .encrypt(
                nonce.into(),
                aes_gcm::aead::Payload { msg: plaintext, aad },
            )
            .map_err(|_| CryptoError::Aead)
    }

    fn aes_gcm_decrypt(&self, key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new(key.into());
        cipher
            .decrypt(
                nonce.into(),
                aes_gcm::aead::Payload { msg: ciphertext, aad },
            )
            .map_err(|_| CryptoError::Aead)
    }

    fn aes_ctr_apply(&self, key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
        let mut cipher = Aes128Ctr64BE::new(key.into(), iv.into());
        cipher.apply_keystream(data);
    }

    fn ecdh_compressed(&self, local_secret: &SecretKey, remote_public: &PublicKey) -> [u8; 33] {
        let xy_point = shared_secret_point(remote_public, local_secret);
        let mut compressed = [0u8; 33];
        let y = &xy_point[32..];
        compressed[0] = if y[31] & 1 == 0 { 0x02 } else { 0x03 };
        compressed[1..].copy_from_slice(&xy_point[..32]);
        compressed
    }

    fn sign(&self, secret: &SecretKey, digest: &[u8; 32]) -> Result<Signature, CryptoError> {
        let message = SecpMessage::from_digest_slice(digest)?;
        Ok(SECP256K1.sign_ecdsa(&message, secret))
    }

    fn verify(&self, public: &PublicKey, digest: &[u8; 32], signature: &Signature) -> bool {
        let Ok(message) = SecpMessage::from_digest_slice(digest) else {
            return false;
        };
        SECP256K1.verify_ecdsa(&message, signature, public).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn ecdh_compressed_matches_vector() {
        let provider = DefaultCryptoProvider;
        let ephemeral_key = SecretKey::from_slice(&hex!(
            "fb757dc581730490a1d7a00deea65e9b1936924caaea8f44d476014856b68736"
        ))
        .unwrap();
        let dest_pubkey = PublicKey::from_slice(&hex!(
            "0317931e6e0840220642f230037d285d122bc59063221ef3226b1f403ddc69ca91"
        ))
        .unwrap();
        let secret = provider.ecdh_compressed(&ephemeral_key, &dest_pubkey);
        // Session-key derivation test vectors are verified end to end in
        // `session.rs`; this just checks the shared secret has a valid
        // compressed point prefix.
        assert!(secret[0] == 0x02 || secret[0] == 0x03);
    }

    #[test]
    fn aes_gcm_round_trips() {
        let provider = DefaultCryptoProvider;
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 12];
        let aad = b"authenticated-not-encrypted";
        let plaintext = b"hello discv5";

        let ciphertext = provider.aes_gcm_encrypt(&key, &nonce, aad, plaintext).unwrap();
        let decrypted = provider.aes_gcm_decrypt(&key, &nonce, aad, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_gcm_decrypt_fails_on_tampered_aad() {
        let provider = DefaultCryptoProvider;
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 12];
        let ciphertext = provider.aes_gcm_encrypt(&key, &nonce, b"aad-one", b"hello").unwrap();
        assert!(provider.aes_gcm_decrypt(&key, &nonce, b"aad-two", &ciphertext).is_err());
    }

    #[test]
    fn aes_ctr_apply_is_its_own_inverse() {
        let provider = DefaultCryptoProvider;
        let key = [0x33u8; 16];
        let iv = [0x44u8; 16];
        let mut data = b"static header + authdata".to_vec();
        let original = data.clone();

        provider.aes_ctr_apply(&key, &iv, &mut data);
        assert_ne!(data, original);
        provider.aes_ctr_apply(&key, &iv, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let provider = DefaultCryptoProvider;
        let secret = SecretKey::from_slice(&hex!(
            "fb757dc581730490a1d7a00deea65e9b1936924caaea8f44d476014856b68736"
        ))
        .unwrap();
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        let digest = provider.sha256(b"discovery v5 identity proof");

        let signature = provider.sign(&secret, &digest).unwrap();
        assert!(provider.verify(&public, &digest, &signature));
    }
}
