use thiserror::Error;

use iplchat_shared::packet::PacketKind;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] iplchat_shared::error::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] iplchat_shared::error::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server rejected the request with {0:?}")]
    Rejected(PacketKind),

    #[error("Expected {expected:?}, server sent {got:?}")]
    UnexpectedPacket {
        expected: PacketKind,
        got: PacketKind,
    },

    #[error("No session key established yet")]
    NoSession,

    #[error("Keychain is locked")]
    KeychainLocked,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("No peer key for {0}")]
    UnknownPeer(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
