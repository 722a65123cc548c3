use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::constants::{PUBLIC_BUNDLE_SIZE, SIGNATURE_SIZE};
use crate::error::CryptoError;

/// A client identity: an Ed25519 signing half and an X25519 encryption half.
///
/// Both public halves travel together in a [`PublicKeyBundle`] during the
/// handshake, so a peer can verify signatures and seal key material to us
/// with a single 64-byte exchange.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    encryption: crypto_box::SecretKey,
}

/// The public half of a [`KeyPair`]: verify key followed by encrypt key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyBundle {
    pub verify: [u8; 32],
    pub encrypt: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            encryption: crypto_box::SecretKey::generate(&mut OsRng),
        }
    }

    pub fn public_bundle(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            verify: self.signing.verifying_key().to_bytes(),
            encrypt: *self.encryption.public_key().as_bytes(),
        }
    }

    /// Sign a precomputed digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(digest).to_bytes()
    }

    /// Open a sealed box addressed to this identity's encryption key.
    pub fn open_sealed(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encryption
            .unseal(ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl PublicKeyBundle {
    pub fn to_bytes(&self) -> [u8; PUBLIC_BUNDLE_SIZE] {
        let mut out = [0u8; PUBLIC_BUNDLE_SIZE];
        out[..32].copy_from_slice(&self.verify);
        out[32..].copy_from_slice(&self.encrypt);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_BUNDLE_SIZE {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut verify = [0u8; 32];
        let mut encrypt = [0u8; 32];
        verify.copy_from_slice(&bytes[..32]);
        encrypt.copy_from_slice(&bytes[32..]);
        Ok(Self { verify, encrypt })
    }

    /// Seal a plaintext to this bundle's encryption key. Anyone can seal;
    /// only the matching [`KeyPair`] can open.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let public = crypto_box::PublicKey::from(self.encrypt);
        public
            .seal(&mut OsRng, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Verify a signature over a precomputed digest.
    pub fn verify_digest(
        &self,
        digest: &[u8; 32],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let sig_bytes: &[u8; SIGNATURE_SIZE] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureInvalid)?;
        let verifying_key =
            VerifyingKey::from_bytes(&self.verify).map_err(|_| CryptoError::SignatureInvalid)?;
        verifying_key
            .verify(digest, &Signature::from_bytes(sig_bytes))
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::digest;

    #[test]
    fn test_bundle_roundtrip() {
        let pair = KeyPair::generate();
        let bundle = pair.public_bundle();
        let restored = PublicKeyBundle::from_bytes(&bundle.to_bytes()).unwrap();
        assert_eq!(bundle, restored);
    }

    #[test]
    fn test_bundle_rejects_wrong_length() {
        assert!(PublicKeyBundle::from_bytes(&[0u8; 63]).is_err());
        assert!(PublicKeyBundle::from_bytes(&[0u8; 65]).is_err());
    }

    #[test]
    fn test_sign_verify_digest() {
        let pair = KeyPair::generate();
        let bundle = pair.public_bundle();
        let d = digest(b"payload");

        let sig = pair.sign_digest(&d);
        assert!(bundle.verify_digest(&d, &sig).is_ok());

        let other = digest(b"tampered");
        assert!(bundle.verify_digest(&other, &sig).is_err());
    }

    #[test]
    fn test_verify_rejects_foreign_signature() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let d = digest(b"payload");

        let sig = mallory.sign_digest(&d);
        assert!(alice.public_bundle().verify_digest(&d, &sig).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let pair = KeyPair::generate();
        let sealed = pair.public_bundle().seal(b"session key material").unwrap();
        assert_eq!(pair.open_sealed(&sealed).unwrap(), b"session key material");
    }

    #[test]
    fn test_seal_open_wrong_recipient_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let sealed = alice.public_bundle().seal(b"for alice only").unwrap();
        assert!(bob.open_sealed(&sealed).is_err());
    }
}
