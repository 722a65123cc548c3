use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown packet kind {0:#06x}")]
    UnknownPacketKind(u32),

    #[error("Packet payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("Ciphertext of {0} bytes exceeds the envelope limit")]
    CiphertextTooLarge(usize),

    #[error("Malformed payload: {0}")]
    MalformedPayload(&'static str),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
