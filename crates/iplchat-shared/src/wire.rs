//! Payload codecs for the request/response bodies that are not full
//! [`Message`](crate::message::Message) envelopes: credentials, directory
//! listings and the two-phase peer handshake.

use crate::error::ProtocolError;

/// `u8 ulen ‖ u8 plen ‖ username ‖ password` — the plaintext that is AEAD
/// encrypted under the session key for LOGIN/REGISTER.
pub fn encode_credentials(username: &str, password: &str) -> Result<Vec<u8>, ProtocolError> {
    if username.len() > u8::MAX as usize {
        return Err(ProtocolError::MalformedPayload("username too long"));
    }
    if password.len() > u8::MAX as usize {
        return Err(ProtocolError::MalformedPayload("password too long"));
    }
    let mut out = Vec::with_capacity(2 + username.len() + password.len());
    out.push(username.len() as u8);
    out.push(password.len() as u8);
    out.extend_from_slice(username.as_bytes());
    out.extend_from_slice(password.as_bytes());
    Ok(out)
}

pub fn decode_credentials(payload: &[u8]) -> Result<(String, String), ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::MalformedPayload("credentials header"));
    }
    let ulen = payload[0] as usize;
    let plen = payload[1] as usize;
    if payload.len() != 2 + ulen + plen {
        return Err(ProtocolError::MalformedPayload("credentials length"));
    }
    let username = std::str::from_utf8(&payload[2..2 + ulen])
        .map_err(|_| ProtocolError::MalformedPayload("username is not UTF-8"))?;
    let password = std::str::from_utf8(&payload[2 + ulen..])
        .map_err(|_| ProtocolError::MalformedPayload("password is not UTF-8"))?;
    Ok((username.to_owned(), password.to_owned()))
}

/// One row of an encoded user or channel listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub uuid: String,
}

/// `i32 count ‖ [i32 name_len ‖ i32 uuid_len ‖ name ‖ uuid] * count`
pub fn encode_directory(entries: &[DirectoryEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as i32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&(entry.name.len() as i32).to_le_bytes());
        out.extend_from_slice(&(entry.uuid.len() as i32).to_le_bytes());
        out.extend_from_slice(entry.name.as_bytes());
        out.extend_from_slice(entry.uuid.as_bytes());
    }
    out
}

pub fn decode_directory(payload: &[u8]) -> Result<Vec<DirectoryEntry>, ProtocolError> {
    let mut pos = 0usize;
    let count = read_i32(payload, &mut pos)?;
    if count < 0 {
        return Err(ProtocolError::MalformedPayload("negative entry count"));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = read_i32(payload, &mut pos)? as usize;
        let uuid_len = read_i32(payload, &mut pos)? as usize;
        let name = read_str(payload, &mut pos, name_len)?;
        let uuid = read_str(payload, &mut pos, uuid_len)?;
        entries.push(DirectoryEntry { name, uuid });
    }

    if pos != payload.len() {
        return Err(ProtocolError::MalformedPayload("trailing bytes"));
    }
    Ok(entries)
}

/// `u32 ulen ‖ u32 klen ‖ uuid ‖ sealed key` — CLIENT_TO_CLIENT_HANDSHAKE2
/// and HANDSHAKE_NOTIFICATION share this layout; only the leading uuid
/// differs (target outbound, sender on the push).
pub fn encode_peer_handshake(uuid: &str, sealed_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + uuid.len() + sealed_key.len());
    out.extend_from_slice(&(uuid.len() as u32).to_le_bytes());
    out.extend_from_slice(&(sealed_key.len() as u32).to_le_bytes());
    out.extend_from_slice(uuid.as_bytes());
    out.extend_from_slice(sealed_key);
    out
}

pub fn decode_peer_handshake(payload: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    if payload.len() < 8 {
        return Err(ProtocolError::MalformedPayload("peer handshake header"));
    }
    let ulen = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let klen = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
    if payload.len() != 8 + ulen + klen {
        return Err(ProtocolError::MalformedPayload("peer handshake length"));
    }
    let uuid = std::str::from_utf8(&payload[8..8 + ulen])
        .map_err(|_| ProtocolError::MalformedPayload("uuid is not UTF-8"))?;
    Ok((uuid.to_owned(), payload[8 + ulen..].to_vec()))
}

/// NOTIFICATION_PORT carries a little-endian i32 port.
pub fn encode_port(port: u16) -> Vec<u8> {
    (port as i32).to_le_bytes().to_vec()
}

pub fn decode_port(payload: &[u8]) -> Result<u16, ProtocolError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| ProtocolError::MalformedPayload("port payload length"))?;
    let port = i32::from_le_bytes(bytes);
    u16::try_from(port).map_err(|_| ProtocolError::MalformedPayload("port out of range"))
}

fn read_i32(payload: &[u8], pos: &mut usize) -> Result<i32, ProtocolError> {
    let end = *pos + 4;
    if end > payload.len() {
        return Err(ProtocolError::MalformedPayload("truncated length prefix"));
    }
    let value = i32::from_le_bytes(payload[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(value)
}

fn read_str(payload: &[u8], pos: &mut usize, len: usize) -> Result<String, ProtocolError> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= payload.len())
        .ok_or(ProtocolError::MalformedPayload("truncated field"))?;
    let s = std::str::from_utf8(&payload[*pos..end])
        .map_err(|_| ProtocolError::MalformedPayload("field is not UTF-8"))?;
    *pos = end;
    Ok(s.to_owned())
}
