//! Cryptographic primitives
//!
//! This module provides the stateless crypto operations the rest of the
//! stack builds on:
//! - P-256 key generation and ECDH key agreement
//! - HKDF-SHA256 derivation of per-contact AES keys
//! - AES-256-GCM authenticated encryption
//! - scrypt-based password wrapping of long-lived secrets

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of a derived symmetric key (AES-256)
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length, prepended to every ciphertext
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

/// Salt length for password wrapping, prepended to the wrapped payload
const SALT_LEN: usize = 16;

/// Fixed HKDF context label for shared-key derivation
const HKDF_CONTEXT: &[u8] = b"aes-key";

/// A P-256 key pair for key agreement
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a new P-256 key pair
    ///
    /// Fails only if the OS entropy source fails, which `OsRng` treats as
    /// unrecoverable, so this is infallible in practice.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Raw private scalar bytes (32 bytes)
    pub fn private_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// Public key in uncompressed SEC1 encoding (65 bytes)
    pub fn public_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }
}

/// Derive the per-contact symmetric key from a local private key and a
/// remote public key
///
/// Performs P-256 ECDH and expands the raw shared secret through
/// HKDF-SHA256 into a 256-bit AES key. Both sides of a pairing derive the
/// identical key because ECDH is commutative.
pub fn derive_shared_key(local_priv: &[u8], remote_pub: &[u8]) -> Result<Vec<u8>> {
    let secret = SecretKey::from_slice(local_priv)
        .map_err(|_| Error::Crypto("invalid private key".to_string()))?;

    // Rejects malformed and off-curve points
    let remote = PublicKey::from_sec1_bytes(remote_pub)
        .map_err(|_| Error::Crypto("invalid remote public key".to_string()))?;

    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), remote.as_affine());

    let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
    let mut key = vec![0u8; KEY_LEN];
    hk.expand(HKDF_CONTEXT, &mut key)
        .map_err(|_| Error::Crypto("key derivation failed".to_string()))?;

    Ok(key)
}

/// Encrypt a payload with AES-256-GCM
///
/// A fresh random 12-byte nonce is generated per call and prepended to the
/// returned ciphertext.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Crypto("encryption key must be 32 bytes".to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an AES-256-GCM ciphertext produced by [`encrypt`]
///
/// The nonce is read back from the ciphertext prefix; it must be the one
/// `encrypt` prepended, never an implicit value. Truncated input and tag
/// mismatch both fail, and a wrong key is indistinguishable from tampered
/// data.
pub fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Crypto("ciphertext too short".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Crypto("decryption key must be 32 bytes".to_string()))?;

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::Crypto("decryption failed".to_string()))
}

/// Derive a wrapping key from a password and salt via scrypt
///
/// Work factor: N=2^15, r=8, p=1. Deliberately expensive; callers cache the
/// unwrapped result in the [`crate::secrets::SecretStore`] instead of
/// re-deriving per message.
fn stretch_password(password: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let params = scrypt::Params::new(15, 8, 1, KEY_LEN)
        .map_err(|_| Error::Crypto("invalid scrypt parameters".to_string()))?;

    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password, salt, &params, &mut key)
        .map_err(|_| Error::Crypto("key stretching failed".to_string()))?;

    Ok(key)
}

/// Encrypt a payload under a key stretched from `password`
///
/// Returns `salt || ciphertext` where the salt is a fresh random 16 bytes.
pub fn wrap_with_password(password: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let key = stretch_password(password, &salt)?;
    let ciphertext = encrypt(&key, payload)?;

    let mut out = Vec::with_capacity(SALT_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`wrap_with_password`]
///
/// Splits the leading 16-byte salt, re-derives the key, and decrypts. A
/// wrong password surfaces as a decryption failure.
pub fn unwrap_with_password(password: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < SALT_LEN {
        return Err(Error::Crypto("wrapped payload too short".to_string()));
    }

    let (salt, ciphertext) = wrapped.split_at(SALT_LEN);
    let key = stretch_password(password, salt)?;
    decrypt(&key, ciphertext)
}

/// Hex-encoded SHA-256 digest, used for pairing code comparison on the wire
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [7u8; KEY_LEN];
        let plaintext = b"Hello, Lanchat!";

        let ciphertext = encrypt(&key, plaintext).expect("encrypt failed");
        let decrypted = decrypt(&key, &ciphertext).expect("decrypt failed");

        assert_eq!(decrypted, plaintext);
        // Nonce prefix plus tag means ciphertext is strictly longer
        assert!(ciphertext.len() > plaintext.len());
    }

    #[test]
    fn test_encrypt_uses_fresh_nonce() {
        let key = [7u8; KEY_LEN];
        let a = encrypt(&key, b"same input").unwrap();
        let b = encrypt(&key, b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let ciphertext = encrypt(&[1u8; KEY_LEN], b"secret").unwrap();
        let err = decrypt(&[2u8; KEY_LEN], &ciphertext).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_decrypt_truncated_fails() {
        let ciphertext = encrypt(&[1u8; KEY_LEN], b"secret").unwrap();
        assert!(decrypt(&[1u8; KEY_LEN], &ciphertext[..10]).is_err());
        assert!(decrypt(&[1u8; KEY_LEN], &[]).is_err());
    }

    #[test]
    fn test_decrypt_tampered_fails() {
        let key = [1u8; KEY_LEN];
        let mut ciphertext = encrypt(&key, b"secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(matches!(
            decrypt(&key, &ciphertext),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(encrypt(&[0u8; 16], b"x").is_err());
        assert!(decrypt(&[0u8; 16], &[0u8; 64]).is_err());
    }

    #[test]
    fn test_shared_key_symmetry() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let ab = derive_shared_key(&alice.private_bytes(), &bob.public_bytes()).unwrap();
        let ba = derive_shared_key(&bob.private_bytes(), &alice.public_bytes()).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.len(), KEY_LEN);
    }

    #[test]
    fn test_derive_rejects_malformed_public_key() {
        let alice = KeyPair::generate();
        let err = derive_shared_key(&alice.private_bytes(), &[0x04u8; 65]).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));

        // Wrong length entirely
        assert!(derive_shared_key(&alice.private_bytes(), &[1u8; 10]).is_err());
    }

    #[test]
    fn test_password_wrap_roundtrip() {
        let payload = b"long-lived secret material";
        let wrapped = wrap_with_password(b"hunter2hunter2", payload).unwrap();

        // Salt prefix means the wrapped form never contains the payload
        assert_ne!(&wrapped[..], &payload[..]);

        let unwrapped = unwrap_with_password(b"hunter2hunter2", &wrapped).unwrap();
        assert_eq!(unwrapped, payload);
    }

    #[test]
    fn test_password_wrap_wrong_password_fails() {
        let wrapped = wrap_with_password(b"correct password", b"payload").unwrap();
        let err = unwrap_with_password(b"wrong password", &wrapped).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_password_wrap_fresh_salt() {
        let a = wrap_with_password(b"pw", b"payload").unwrap();
        let b = wrap_with_password(b"pw", b"payload").unwrap();
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
    }

    #[test]
    fn test_unwrap_truncated_fails() {
        assert!(unwrap_with_password(b"pw", &[0u8; 8]).is_err());
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_keypair_encodings() {
        let pair = KeyPair::generate();
        assert_eq!(pair.private_bytes().len(), 32);

        let public = pair.public_bytes();
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04); // uncompressed SEC1 marker
    }
}
