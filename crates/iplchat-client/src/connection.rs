//! Framed TCP connection to the broker, exposing the full request surface:
//! handshake, authentication, catalogue queries, the two-phase peer key
//! exchange and signed message send.
//!
//! Requests are strictly sequential on the main stream; everything
//! asynchronous arrives on the [`NotificationListener`] instead.
//!
//! [`NotificationListener`]: crate::listener::NotificationListener

use std::sync::{Arc, Mutex};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

use iplchat_shared::codec::{read_packet, write_packet};
use iplchat_shared::crypto::{self, SymmetricKey};
use iplchat_shared::identity::{KeyPair, PublicKeyBundle};
use iplchat_shared::message::{Message, MessageKind};
use iplchat_shared::packet::{Packet, PacketKind};
use iplchat_shared::types::{ChannelId, UserId};
use iplchat_shared::wire::{self, DirectoryEntry};

use crate::error::{ClientError, Result};
use crate::keychain::Keychain;

pub struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    keypair: KeyPair,
    session_key: Option<SymmetricKey>,
    user: Option<UserId>,
    username: Option<String>,
}

impl Connection {
    pub async fn connect(addr: impl ToSocketAddrs, keypair: KeyPair) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            keypair,
            session_key: None,
            user: None,
            username: None,
        })
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Send our public key bundle; the broker answers with a fresh session
    /// key sealed to it. All later request payloads are AEAD under that key.
    pub async fn handshake(&mut self) -> Result<()> {
        let bundle = self.keypair.public_bundle();
        let reply = self
            .roundtrip(Packet::new(
                PacketKind::HandshakeRequest,
                bundle.to_bytes().to_vec(),
            )?)
            .await?;
        let reply = expect(reply, PacketKind::HandshakeResponse, None)?;

        let key_bytes = self.keypair.open_sealed(&reply.payload)?;
        let key: SymmetricKey = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| iplchat_shared::error::CryptoError::InvalidKeyLength)?;
        self.session_key = Some(key);
        debug!("session key established");
        Ok(())
    }

    pub async fn register(&mut self, username: &str, password: &str) -> Result<UserId> {
        self.authenticate(PacketKind::RegisterRequest, username, password)
            .await
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<UserId> {
        self.authenticate(PacketKind::LoginRequest, username, password)
            .await
    }

    async fn authenticate(
        &mut self,
        kind: PacketKind,
        username: &str,
        password: &str,
    ) -> Result<UserId> {
        let key = self.session_key()?;
        let body = crypto::encrypt(&key, &wire::encode_credentials(username, password)?)?;

        let (expected, rejected) = match kind {
            PacketKind::RegisterRequest => {
                (PacketKind::RegisterResponse, PacketKind::RegisterError)
            }
            _ => (PacketKind::LoginResponse, PacketKind::LoginError),
        };
        let reply = self.roundtrip(Packet::new(kind, body)?).await?;
        let reply = expect(reply, expected, Some(rejected))?;

        let uuid = UserId::from_wire(&crypto::decrypt(&key, &reply.payload)?)?;
        self.user = Some(uuid);
        self.username = Some(username.to_owned());
        debug!(user = username, %uuid, "authenticated");
        Ok(uuid)
    }

    pub async fn logout(&mut self) -> Result<()> {
        let reply = self
            .roundtrip(Packet::empty(PacketKind::LogoutRequest))
            .await?;
        expect(reply, PacketKind::LogoutResponse, None)?;
        self.user = None;
        self.username = None;
        self.session_key = None;
        Ok(())
    }

    /// Tell the broker which local port the notification listener holds.
    pub async fn register_notification_port(&mut self, port: u16) -> Result<()> {
        let reply = self
            .roundtrip(Packet::new(
                PacketKind::NotificationPort,
                wire::encode_port(port),
            )?)
            .await?;
        expect(reply, PacketKind::NotificationPortResponse, None)?;
        Ok(())
    }

    /// The caller's subscription list as `(name, uuid)` entries.
    pub async fn fetch_channels(&mut self) -> Result<Vec<DirectoryEntry>> {
        let key = self.session_key()?;
        let reply = self
            .roundtrip(Packet::empty(PacketKind::ChannelFetchRequest))
            .await?;
        let reply = expect(reply, PacketKind::ChannelFetchResponse, None)?;
        Ok(wire::decode_directory(&crypto::decrypt(&key, &reply.payload)?)?)
    }

    pub async fn join_channel(&mut self, channel: ChannelId) -> Result<()> {
        let key = self.session_key()?;
        let body = crypto::encrypt(&key, channel.to_string().as_bytes())?;
        let reply = self
            .roundtrip(Packet::new(PacketKind::JoinChannelRequest, body)?)
            .await?;
        expect(
            reply,
            PacketKind::JoinChannelSuccess,
            Some(PacketKind::JoinChannelError),
        )?;
        Ok(())
    }

    pub async fn search_users(&mut self, pattern: &str) -> Result<Vec<DirectoryEntry>> {
        let key = self.session_key()?;
        let body = crypto::encrypt(&key, pattern.as_bytes())?;
        let reply = self
            .roundtrip(Packet::new(PacketKind::UserSearchRequest, body)?)
            .await?;
        let reply = expect(reply, PacketKind::UserSearchResponse, None)?;
        Ok(wire::decode_directory(&crypto::decrypt(&key, &reply.payload)?)?)
    }

    pub async fn lookup_username(&mut self, uuid: UserId) -> Result<String> {
        let key = self.session_key()?;
        let body = crypto::encrypt(&key, uuid.to_string().as_bytes())?;
        let reply = self
            .roundtrip(Packet::new(PacketKind::UsernameRequest, body)?)
            .await?;
        let reply = expect(reply, PacketKind::UsernameResponse, None)?;
        String::from_utf8(crypto::decrypt(&key, &reply.payload)?)
            .map_err(|_| iplchat_shared::error::ProtocolError::MalformedPayload("username").into())
    }

    /// Two-phase peer key exchange. Phase 1 fetches the target's public
    /// key; phase 2 generates a fresh peer key, seals it to the target and
    /// ships it via the broker. The key is recorded in the keychain under
    /// the target's uuid before this returns; the target's listener records
    /// the mirror entry. The broker never sees the key.
    pub async fn peer_handshake(
        &mut self,
        target: UserId,
        keychain: &Arc<Mutex<Keychain>>,
    ) -> Result<SymmetricKey> {
        // Phase 1: the target's public key bundle, from its live session.
        let reply = self
            .roundtrip(Packet::new(
                PacketKind::ClientToClientHandshake,
                target.to_string().into_bytes(),
            )?)
            .await?;
        let reply = expect(reply, PacketKind::ClientPublicKey, None)?;
        let target_bundle = PublicKeyBundle::from_bytes(&reply.payload)?;

        // Phase 2: fresh peer key, sealed so only the target can open it.
        let peer_key = crypto::generate_symmetric_key();
        let sealed = target_bundle.seal(&peer_key)?;
        let body = wire::encode_peer_handshake(&target.to_string(), &sealed);
        let reply = self
            .roundtrip(Packet::new(PacketKind::ClientToClientHandshake2, body)?)
            .await?;
        expect(reply, PacketKind::HandshakeNotification, None)?;

        {
            let mut chain = keychain.lock().expect("keychain lock poisoned");
            chain.add(target, peer_key);
            if let Err(e) = chain.save() {
                warn!(error = %e, "failed to persist keychain after peer handshake");
            }
        }
        debug!(%target, "peer key established");
        Ok(peer_key)
    }

    /// Encrypt a plaintext under the peer key for `channel`'s owner, sign
    /// the envelope and send it. The broker relays it to the recipient's
    /// notification endpoint.
    pub async fn send_message(
        &mut self,
        channel: ChannelId,
        plaintext: &[u8],
        kind: MessageKind,
        keychain: &Arc<Mutex<Keychain>>,
    ) -> Result<()> {
        let sender = self.user.ok_or(ClientError::NotAuthenticated)?;

        let peer_key = {
            let chain = keychain.lock().expect("keychain lock poisoned");
            chain
                .get(&UserId::from(channel))
                .copied()
                .ok_or_else(|| ClientError::UnknownPeer(channel.to_string()))?
        };
        let ciphertext = crypto::encrypt(&peer_key, plaintext)?;
        let message = Message::signed(sender, channel, ciphertext, kind, &self.keypair)?;

        let reply = self
            .roundtrip(Packet::new(PacketKind::MessageRequest, message.to_bytes())?)
            .await?;
        expect(
            reply,
            PacketKind::MessageSuccess,
            Some(PacketKind::MessageError),
        )?;
        Ok(())
    }

    /// Send a pre-built envelope without touching the keychain. Used by
    /// tests exercising broker validation with deliberately bad envelopes.
    pub async fn send_raw_message(&mut self, message: &Message) -> Result<()> {
        let reply = self
            .roundtrip(Packet::new(PacketKind::MessageRequest, message.to_bytes())?)
            .await?;
        expect(
            reply,
            PacketKind::MessageSuccess,
            Some(PacketKind::MessageError),
        )?;
        Ok(())
    }

    fn session_key(&self) -> Result<SymmetricKey> {
        self.session_key.ok_or(ClientError::NoSession)
    }

    async fn roundtrip(&mut self, packet: Packet) -> Result<Packet> {
        write_packet(&mut self.writer, &packet).await?;
        Ok(read_packet(&mut self.reader).await?)
    }
}

fn expect(reply: Packet, expected: PacketKind, rejected: Option<PacketKind>) -> Result<Packet> {
    if reply.kind == expected {
        Ok(reply)
    } else if Some(reply.kind) == rejected {
        Err(ClientError::Rejected(reply.kind))
    } else {
        Err(ClientError::UnexpectedPacket {
            expected,
            got: reply.kind,
        })
    }
}
