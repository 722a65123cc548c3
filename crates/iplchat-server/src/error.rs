use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] iplchat_shared::error::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] iplchat_shared::error::CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] iplchat_store::error::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
