use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// AEAD-seal a payload under a session or peer key.
///
/// Every ciphertext carries its own fresh 24-byte nonce as a header, so the
/// wire unit is self-contained: `nonce ‖ ciphertext ‖ tag`. Nonces are
/// never reused or derived from the payload.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut sealed = vec![0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut sealed);

    let cipher = XChaCha20Poly1305::new(key.into());
    let body = cipher
        .encrypt(XNonce::from_slice(&sealed[..NONCE_SIZE]), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    sealed.extend_from_slice(&body);
    Ok(sealed)
}

/// Open a payload produced by [`encrypt`]. The nonce header is stripped
/// before authentication; anything too short to carry one is rejected the
/// same way a bad tag is.
pub fn decrypt(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (header, body) = match sealed.len() {
        len if len >= NONCE_SIZE => sealed.split_at(NONCE_SIZE),
        _ => return Err(CryptoError::DecryptionFailed),
    };

    XChaCha20Poly1305::new(key.into())
        .decrypt(XNonce::from_slice(header), body)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Fixed-length BLAKE3 digest.
pub fn digest(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive a 256-bit key from a password and salt (Argon2id, raw output).
pub fn derive_key(password: &[u8], salt: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    Argon2::default()
        .hash_password_into(password, salt, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

/// Salted password hash for at-rest storage. Memory-hard on purpose.
pub fn hash_password(password: &str, salt: &[u8]) -> Result<Vec<u8>, CryptoError> {
    derive_key(password.as_bytes(), salt).map(|k| k.to_vec())
}

/// Constant-time comparison of a candidate password against a stored hash.
pub fn verify_password(password: &str, salt: &[u8], expected: &[u8]) -> Result<bool, CryptoError> {
    let candidate = hash_password(password, salt)?;
    Ok(candidate.ct_eq(expected).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"ping";

        let ciphertext = encrypt(&key, plaintext).unwrap();
        assert_ne!(&ciphertext[NONCE_SIZE..], plaintext);

        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let key = generate_symmetric_key();
        let other = generate_symmetric_key();
        let ciphertext = encrypt(&key, b"secret").unwrap();
        assert!(decrypt(&other, &ciphertext).is_err());
    }

    #[test]
    fn test_decrypt_tampered_fails() {
        let key = generate_symmetric_key();
        let mut ciphertext = encrypt(&key, b"secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(decrypt(&key, &ciphertext).is_err());
    }

    #[test]
    fn test_decrypt_truncated_fails() {
        let key = generate_symmetric_key();
        assert!(decrypt(&key, &[0u8; NONCE_SIZE - 1]).is_err());
    }

    #[test]
    fn test_nonces_are_fresh_per_ciphertext() {
        let key = generate_symmetric_key();
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = [7u8; 16];
        let a = derive_key(b"password", &salt).unwrap();
        let b = derive_key(b"password", &salt).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_key_varies_with_salt() {
        let a = derive_key(b"password", &[1u8; 16]).unwrap();
        let b = derive_key(b"password", &[2u8; 16]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_password() {
        let salt = random_bytes(16);
        let stored = hash_password("p1", &salt).unwrap();
        assert!(verify_password("p1", &salt, &stored).unwrap());
        assert!(!verify_password("p2", &salt, &stored).unwrap());
    }
}
