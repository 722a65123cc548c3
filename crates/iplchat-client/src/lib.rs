//! Client core for iplchat: the broker connection, the password-encrypted
//! peer keychain and the notification listener.
//!
//! Front-ends compose these three explicitly at login time and subscribe to
//! [`events::ClientEvent`]s; nothing in here is a process-wide global.

pub mod connection;
pub mod error;
pub mod events;
pub mod keychain;
pub mod listener;

pub use connection::Connection;
pub use events::ClientEvent;
pub use keychain::Keychain;
pub use listener::NotificationListener;
