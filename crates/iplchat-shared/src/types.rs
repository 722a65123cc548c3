use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

// User identity on the wire: canonical 36-character UUID text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Parse from raw wire bytes (UTF-8 canonical text form).
    pub fn from_wire(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::MalformedPayload("identifier is not UTF-8"))?;
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::MalformedPayload("identifier is not UTF-8"))?;
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Direct-message convention: a user's personal channel carries the user's uuid.
impl From<UserId> for ChannelId {
    fn from(user: UserId) -> Self {
        Self(user.0)
    }
}

impl From<ChannelId> for UserId {
    fn from(channel: ChannelId) -> Self {
        Self(channel.0)
    }
}
