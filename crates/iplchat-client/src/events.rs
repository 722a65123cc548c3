//! The typed event surface a front-end subscribes to. Events flow over a
//! plain mpsc channel so any UI toolkit (or a test) can drain them.

use iplchat_shared::message::Message;
use iplchat_shared::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// An inbound envelope arrived on the notification endpoint. When the
    /// sender's peer key is in the keychain the ciphertext is already
    /// decrypted into `plaintext`.
    Message {
        message: Message,
        plaintext: Option<Vec<u8>>,
    },

    /// A peer completed a key exchange with us; the new key is in the
    /// keychain under this uuid.
    PeerHandshake { peer: UserId },

    /// The notification listener's view of the connection changed.
    ConnectionState(ConnectionState),
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<ClientEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ClientEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
