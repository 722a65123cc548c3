use crate::constants::MAX_CIPHERTEXT_LEN;
use crate::crypto::digest;
use crate::error::{CryptoError, ProtocolError};
use crate::identity::{KeyPair, PublicKeyBundle};
use crate::types::{ChannelId, UserId};

/// Payload class carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    Text = 0,
    File = 1,
}

impl MessageKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Text),
            1 => Some(Self::File),
            _ => None,
        }
    }
}

/// The end-to-end envelope relayed by the broker. The broker validates the
/// signature but never holds the plaintext: `ciphertext` is encrypted under
/// a peer key the broker does not know.
///
/// Wire form, all length prefixes four-byte little-endian:
/// `len ‖ sender ‖ len ‖ channel ‖ len ‖ ciphertext ‖ len ‖ signature ‖ kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: UserId,
    pub channel: ChannelId,
    pub ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
    pub kind: MessageKind,
}

impl Message {
    /// Build and sign an envelope. Rejects ciphertexts over the 500-byte
    /// limit before anything touches the wire.
    pub fn signed(
        sender: UserId,
        channel: ChannelId,
        ciphertext: Vec<u8>,
        kind: MessageKind,
        keypair: &KeyPair,
    ) -> Result<Self, ProtocolError> {
        if ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(ProtocolError::CiphertextTooLarge(ciphertext.len()));
        }
        let signature = keypair.sign_digest(&digest(&ciphertext)).to_vec();
        Ok(Self {
            sender,
            channel,
            ciphertext,
            signature,
            kind,
        })
    }

    /// Verify the signature over the ciphertext digest against the sender's
    /// public bundle.
    pub fn verify(&self, sender_bundle: &PublicKeyBundle) -> Result<(), CryptoError> {
        sender_bundle.verify_digest(&digest(&self.ciphertext), &self.signature)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let sender = self.sender.to_string();
        let channel = self.channel.to_string();

        let mut out = Vec::with_capacity(
            16 + sender.len() + channel.len() + self.ciphertext.len() + self.signature.len() + 4,
        );
        write_field(&mut out, sender.as_bytes());
        write_field(&mut out, channel.as_bytes());
        write_field(&mut out, &self.ciphertext);
        write_field(&mut out, &self.signature);
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor { bytes, pos: 0 };

        let sender = UserId::from_wire(cursor.field()?)?;
        let channel = ChannelId::from_wire(cursor.field()?)?;
        let ciphertext = cursor.field()?.to_vec();
        if ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(ProtocolError::CiphertextTooLarge(ciphertext.len()));
        }
        let signature = cursor.field()?.to_vec();
        let kind_tag = cursor.u32()?;
        let kind = MessageKind::from_u32(kind_tag)
            .ok_or(ProtocolError::MalformedPayload("unknown message kind"))?;

        if cursor.pos != bytes.len() {
            return Err(ProtocolError::MalformedPayload("trailing bytes"));
        }

        Ok(Self {
            sender,
            channel,
            ciphertext,
            signature,
            kind,
        })
    }
}

fn write_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_le_bytes());
    out.extend_from_slice(field);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let end = self.pos + 4;
        if end > self.bytes.len() {
            return Err(ProtocolError::MalformedPayload("truncated length prefix"));
        }
        let value = u32::from_le_bytes(self.bytes[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(value)
    }

    fn field(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u32()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(ProtocolError::MalformedPayload("truncated field"))?;
        let field = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn sample(ciphertext: Vec<u8>) -> (Message, KeyPair) {
        let keypair = KeyPair::generate();
        let msg = Message::signed(
            UserId::new(),
            ChannelId::new(),
            ciphertext,
            MessageKind::Text,
            &keypair,
        )
        .unwrap();
        (msg, keypair)
    }

    #[test]
    fn test_serialize_roundtrip_is_identity() {
        let (msg, _) = sample(b"opaque ciphertext bytes".to_vec());
        let restored = Message::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(restored, msg);
    }

    #[test]
    fn test_ciphertext_boundary() {
        let keypair = KeyPair::generate();
        let at_limit = Message::signed(
            UserId::new(),
            ChannelId::new(),
            vec![0u8; MAX_CIPHERTEXT_LEN],
            MessageKind::Text,
            &keypair,
        );
        assert!(at_limit.is_ok());

        let over = Message::signed(
            UserId::new(),
            ChannelId::new(),
            vec![0u8; MAX_CIPHERTEXT_LEN + 1],
            MessageKind::File,
            &keypair,
        );
        assert!(matches!(over, Err(ProtocolError::CiphertextTooLarge(_))));
    }

    #[test]
    fn test_signature_verifies_under_sender_bundle() {
        let (msg, keypair) = sample(b"hi".to_vec());
        assert!(msg.verify(&keypair.public_bundle()).is_ok());
        assert!(msg.verify(&KeyPair::generate().public_bundle()).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails_verification() {
        let (mut msg, keypair) = sample(b"hi".to_vec());
        msg.ciphertext[0] ^= 0x01;
        assert!(msg.verify(&keypair.public_bundle()).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_truncation() {
        let (msg, _) = sample(b"hello".to_vec());
        let bytes = msg.to_bytes();
        for cut in [0, 3, 10, bytes.len() - 1] {
            assert!(Message::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_from_bytes_rejects_trailing_garbage() {
        let (msg, _) = sample(b"hello".to_vec());
        let mut bytes = msg.to_bytes();
        bytes.push(0);
        assert!(Message::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_peer_encrypted_payload_fits_envelope() {
        // An AEAD ciphertext of a short chat line stays well inside the
        // 500-byte bound: 24-byte nonce + plaintext + 16-byte tag.
        let key = crypto::generate_symmetric_key();
        let ciphertext = crypto::encrypt(&key, b"hi").unwrap();
        let (msg, _) = sample(ciphertext);
        assert!(msg.to_bytes().len() <= crate::constants::MAX_PACKET_PAYLOAD);
    }
}
