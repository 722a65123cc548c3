//! The iplchat broker. Exposed as a library so integration tests can drive
//! a real broker over loopback; the binary in `main.rs` wires the same
//! pieces to the configured port, timers and admin console.

pub mod broker;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod session;
