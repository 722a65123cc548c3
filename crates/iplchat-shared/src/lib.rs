//! Shared protocol layer for iplchat: identifier types, crypto primitives,
//! the framed packet codec and the signed message envelope.
//!
//! Everything in this crate is transport- and storage-agnostic; the server
//! and client crates both build on it.

pub mod codec;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod message;
pub mod packet;
pub mod types;
pub mod wire;
