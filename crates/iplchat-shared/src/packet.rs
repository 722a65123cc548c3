use crate::constants::MAX_PACKET_PAYLOAD;
use crate::error::ProtocolError;

/// Every unit on the wire: a typed tag and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PACKET_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { kind, payload })
    }

    /// A packet with an empty payload (responses, acks, errors).
    pub fn empty(kind: PacketKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }
}

/// The closed packet-type space. Tags are stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketKind {
    HandshakeRequest = 0x01,
    HandshakeResponse = 0x02,
    LoginRequest = 0x03,
    LoginResponse = 0x04,
    LoginError = 0x05,
    RegisterRequest = 0x06,
    RegisterResponse = 0x07,
    RegisterError = 0x08,
    LogoutRequest = 0x09,
    LogoutResponse = 0x0a,
    NotificationPort = 0x0b,
    NotificationPortResponse = 0x0c,
    ChannelFetchRequest = 0x0d,
    ChannelFetchResponse = 0x0e,
    JoinChannelRequest = 0x0f,
    JoinChannelSuccess = 0x10,
    JoinChannelError = 0x11,
    UserSearchRequest = 0x12,
    UserSearchResponse = 0x13,
    UsernameRequest = 0x14,
    UsernameResponse = 0x15,
    ClientToClientHandshake = 0x16,
    ClientPublicKey = 0x17,
    ClientToClientHandshake2 = 0x18,
    HandshakeNotification = 0x19,
    MessageRequest = 0x1a,
    MessageNotification = 0x1b,
    MessageSuccess = 0x1c,
    MessageError = 0x1d,
    // Reserved for queued-message delivery on reconnect. Accepted by the
    // codec, rejected by the broker.
    MessageSyncRequest = 0x1e,
    MessageSyncResponse = 0x1f,
    MessageSync = 0x20,
}

impl PacketKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x01 => Some(Self::HandshakeRequest),
            0x02 => Some(Self::HandshakeResponse),
            0x03 => Some(Self::LoginRequest),
            0x04 => Some(Self::LoginResponse),
            0x05 => Some(Self::LoginError),
            0x06 => Some(Self::RegisterRequest),
            0x07 => Some(Self::RegisterResponse),
            0x08 => Some(Self::RegisterError),
            0x09 => Some(Self::LogoutRequest),
            0x0a => Some(Self::LogoutResponse),
            0x0b => Some(Self::NotificationPort),
            0x0c => Some(Self::NotificationPortResponse),
            0x0d => Some(Self::ChannelFetchRequest),
            0x0e => Some(Self::ChannelFetchResponse),
            0x0f => Some(Self::JoinChannelRequest),
            0x10 => Some(Self::JoinChannelSuccess),
            0x11 => Some(Self::JoinChannelError),
            0x12 => Some(Self::UserSearchRequest),
            0x13 => Some(Self::UserSearchResponse),
            0x14 => Some(Self::UsernameRequest),
            0x15 => Some(Self::UsernameResponse),
            0x16 => Some(Self::ClientToClientHandshake),
            0x17 => Some(Self::ClientPublicKey),
            0x18 => Some(Self::ClientToClientHandshake2),
            0x19 => Some(Self::HandshakeNotification),
            0x1a => Some(Self::MessageRequest),
            0x1b => Some(Self::MessageNotification),
            0x1c => Some(Self::MessageSuccess),
            0x1d => Some(Self::MessageError),
            0x1e => Some(Self::MessageSyncRequest),
            0x1f => Some(Self::MessageSyncResponse),
            0x20 => Some(Self::MessageSync),
            _ => None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_roundtrip() {
        for tag in 0x01..=0x20u32 {
            let kind = PacketKind::from_u32(tag).unwrap();
            assert_eq!(kind as u32, tag);
        }
        assert_eq!(PacketKind::from_u32(0), None);
        assert_eq!(PacketKind::from_u32(0x21), None);
    }

    #[test]
    fn test_packet_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PACKET_PAYLOAD + 1];
        assert!(Packet::new(PacketKind::MessageRequest, payload).is_err());

        let payload = vec![0u8; MAX_PACKET_PAYLOAD];
        assert!(Packet::new(PacketKind::MessageRequest, payload).is_ok());
    }
}
