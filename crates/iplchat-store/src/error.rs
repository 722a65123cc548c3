use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Record already exists")]
    AlreadyExists,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("No such snapshot: {0}")]
    SnapshotMissing(String),

    #[error("No snapshot load to revert")]
    NothingToRevert,

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] iplchat_shared::error::CryptoError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
