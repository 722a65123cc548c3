//! Request dispatcher. Each accepted connection is served to completion by
//! one task: packets are reassembled, preconditions enforced, session and
//! durable state mutated, and responses emitted directly or pushed through
//! the notifier.
//!
//! Failure policy: a request with a paired error packet answers with it; a
//! request without one is logged at WARN and dropped. Clients only ever see
//! the paired error, never which precondition failed.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use iplchat_shared::codec::{read_packet, write_packet};
use iplchat_shared::constants::USER_SEARCH_DEPTH;
use iplchat_shared::crypto::{self, SymmetricKey};
use iplchat_shared::identity::PublicKeyBundle;
use iplchat_shared::message::Message;
use iplchat_shared::packet::{Packet, PacketKind};
use iplchat_shared::types::{ChannelId, UserId};
use iplchat_shared::wire::{self, DirectoryEntry};
use iplchat_store::error::StoreError;
use iplchat_store::models::MessageRow;
use iplchat_store::Store;

use crate::error::Result;
use crate::notifier;
use crate::session::{RateLimitPolicy, Session, SessionRegistry};

pub struct Broker {
    store: Arc<Store>,
    registry: Arc<SessionRegistry>,
    rate_limit: RateLimitPolicy,
}

impl Broker {
    pub fn new(store: Arc<Store>, registry: Arc<SessionRegistry>, rate_limit: RateLimitPolicy) -> Self {
        Self {
            store,
            registry,
            rate_limit,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serve one accepted connection until it closes. An unknown packet
    /// kind only loses that packet; framing errors desynchronize the
    /// stream and end the session.
    pub async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr.ip(),
            Err(e) => {
                warn!(error = %e, "connection lost before first packet");
                return;
            }
        };
        let stream_id = self.registry.allocate_stream_id();
        debug!(stream_id, %addr, "connection accepted");

        let (mut reader, mut writer) = stream.into_split();
        loop {
            let packet = match read_packet(&mut reader).await {
                Ok(packet) => packet,
                Err(iplchat_shared::error::ProtocolError::UnknownPacketKind(tag)) => {
                    // The frame was consumed whole, so only this packet is
                    // lost; the stream stays usable.
                    warn!(stream_id, tag, "unknown packet kind, dropping");
                    continue;
                }
                Err(e) => {
                    debug!(stream_id, error = %e, "connection closed");
                    break;
                }
            };

            match self.handle_packet(stream_id, addr, packet).await {
                Ok(Some(reply)) => {
                    if let Err(e) = write_packet(&mut writer, &reply).await {
                        warn!(stream_id, error = %e, "failed to write response");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(stream_id, error = %e, "request failed");
                }
            }
        }

        self.cleanup(stream_id);
    }

    /// Disconnect teardown: drop the session record and deauthenticate.
    fn cleanup(&self, stream_id: u64) {
        if let Some(session) = self.registry.remove(stream_id) {
            if let Some(uuid) = session.user_uuid {
                if let Err(e) = self.store.deauthenticate(uuid) {
                    warn!(stream_id, error = %e, "failed to deauthenticate on disconnect");
                }
            }
            info!(stream_id, user = ?session.username, "session closed");
        }
    }

    /// Dispatch one reassembled packet. Returns the direct response, if any.
    pub async fn handle_packet(
        &self,
        stream_id: u64,
        addr: IpAddr,
        packet: Packet,
    ) -> Result<Option<Packet>> {
        match packet.kind {
            PacketKind::HandshakeRequest => self.handshake(stream_id, addr, &packet.payload),
            PacketKind::LoginRequest => self.login(stream_id, &packet.payload),
            PacketKind::RegisterRequest => self.register(stream_id, &packet.payload),
            PacketKind::LogoutRequest => self.logout(stream_id),
            PacketKind::NotificationPort => self.notification_port(stream_id, &packet.payload),
            PacketKind::ChannelFetchRequest => self.channel_fetch(stream_id),
            PacketKind::JoinChannelRequest => self.join_channel(stream_id, &packet.payload),
            PacketKind::UserSearchRequest => self.user_search(stream_id, &packet.payload),
            PacketKind::UsernameRequest => self.username_lookup(stream_id, &packet.payload),
            PacketKind::ClientToClientHandshake => self.peer_key_phase1(stream_id, &packet.payload),
            PacketKind::ClientToClientHandshake2 => {
                self.peer_key_phase2(stream_id, &packet.payload).await
            }
            PacketKind::MessageRequest => self.relay_message(stream_id, &packet.payload).await,
            PacketKind::MessageSyncRequest
            | PacketKind::MessageSyncResponse
            | PacketKind::MessageSync => {
                warn!(stream_id, kind = ?packet.kind, "reserved packet kind, dropping");
                Ok(None)
            }
            other => {
                warn!(stream_id, kind = ?other, "unexpected packet kind, dropping");
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Session establishment
    // ------------------------------------------------------------------

    fn handshake(
        &self,
        stream_id: u64,
        addr: IpAddr,
        payload: &[u8],
    ) -> Result<Option<Packet>> {
        if self.registry.contains(stream_id) {
            warn!(stream_id, "repeated handshake on live session, dropping");
            return Ok(None);
        }
        let bundle = match PublicKeyBundle::from_bytes(payload) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(stream_id, error = %e, "malformed handshake public key");
                return Ok(None);
            }
        };

        let session_key = crypto::generate_symmetric_key();
        let sealed = bundle.seal(&session_key)?;

        let mut session = Session::new(stream_id, addr);
        session.session_key = Some(session_key);
        session.peer_public_key = Some(bundle);
        self.registry.insert(session);

        debug!(stream_id, "session key established");
        Ok(Some(Packet::new(PacketKind::HandshakeResponse, sealed)?))
    }

    fn login(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        let Some(key) = self.session_key(stream_id) else {
            warn!(stream_id, "login before handshake, dropping");
            return Ok(None);
        };
        if self.auth_info(stream_id).is_some() {
            warn!(stream_id, "login on already-authenticated session");
            return Ok(Some(Packet::empty(PacketKind::LoginError)));
        }

        let throttled = self
            .registry
            .with_session(stream_id, |s| {
                let throttled = self.rate_limit.throttled(s.login_attempts, s.last_login_time);
                s.login_attempts += 1;
                s.last_login_time = Some(Instant::now());
                throttled
            })
            .unwrap_or(true);
        if throttled {
            warn!(stream_id, "login attempt throttled");
            return Ok(Some(Packet::empty(PacketKind::LoginError)));
        }

        let (username, password) = match crypto::decrypt(&key, payload)
            .map_err(|_| ())
            .and_then(|plain| wire::decode_credentials(&plain).map_err(|_| ()))
        {
            Ok(credentials) => credentials,
            Err(()) => {
                warn!(stream_id, "undecryptable or malformed login payload");
                return Ok(Some(Packet::empty(PacketKind::LoginError)));
            }
        };

        match self.store.login(&username, &password) {
            Ok(uuid) => {
                self.authenticate_session(stream_id, uuid, &username)?;
                info!(stream_id, user = %username, "login");
                let body = crypto::encrypt(&key, uuid.to_string().as_bytes())?;
                Ok(Some(Packet::new(PacketKind::LoginResponse, body)?))
            }
            Err(StoreError::NotFound | StoreError::InvalidPassword) => {
                // Same answer for unknown user and wrong password.
                info!(stream_id, user = %username, "rejected login");
                Ok(Some(Packet::empty(PacketKind::LoginError)))
            }
            Err(e) => {
                warn!(stream_id, error = %e, "login failed in store");
                Ok(Some(Packet::empty(PacketKind::LoginError)))
            }
        }
    }

    fn register(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        let Some(key) = self.session_key(stream_id) else {
            warn!(stream_id, "register before handshake, dropping");
            return Ok(None);
        };
        if self.auth_info(stream_id).is_some() {
            warn!(stream_id, "register on already-authenticated session");
            return Ok(Some(Packet::empty(PacketKind::RegisterError)));
        }

        let throttled = self
            .registry
            .with_session(stream_id, |s| {
                let throttled = self
                    .rate_limit
                    .throttled(s.register_attempts, s.last_register_time);
                s.register_attempts += 1;
                s.last_register_time = Some(Instant::now());
                throttled
            })
            .unwrap_or(true);
        if throttled {
            warn!(stream_id, "register attempt throttled");
            return Ok(Some(Packet::empty(PacketKind::RegisterError)));
        }

        let (username, password) = match crypto::decrypt(&key, payload)
            .map_err(|_| ())
            .and_then(|plain| wire::decode_credentials(&plain).map_err(|_| ()))
        {
            Ok(credentials) => credentials,
            Err(()) => {
                warn!(stream_id, "undecryptable or malformed register payload");
                return Ok(Some(Packet::empty(PacketKind::RegisterError)));
            }
        };

        let uuid = UserId::new();
        match self.store.register_client(uuid, &username, &password) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => {
                info!(stream_id, user = %username, "rejected duplicate registration");
                return Ok(Some(Packet::empty(PacketKind::RegisterError)));
            }
            Err(e) => {
                warn!(stream_id, error = %e, "registration failed in store");
                return Ok(Some(Packet::empty(PacketKind::RegisterError)));
            }
        }

        // Direct-message convention: every user owns a channel with their
        // own uuid and name, and subscribes to it.
        let own_channel = ChannelId::from(uuid);
        self.store.create_channel_if_absent(&username, own_channel)?;
        self.store.join_channel(uuid, own_channel)?;
        self.store.mark_authenticated(uuid)?;
        self.authenticate_session(stream_id, uuid, &username)?;

        info!(stream_id, user = %username, %uuid, "registered");
        let body = crypto::encrypt(&key, uuid.to_string().as_bytes())?;
        Ok(Some(Packet::new(PacketKind::RegisterResponse, body)?))
    }

    fn authenticate_session(&self, stream_id: u64, uuid: UserId, username: &str) -> Result<()> {
        let subscriptions: HashSet<ChannelId> = self
            .store
            .subscribed_channels(uuid)?
            .into_iter()
            .map(|c| c.uuid)
            .collect();
        self.registry.with_session(stream_id, |s| {
            s.user_uuid = Some(uuid);
            s.username = Some(username.to_owned());
            s.subscriptions = subscriptions;
        });
        Ok(())
    }

    fn logout(&self, stream_id: u64) -> Result<Option<Packet>> {
        let Some(session) = self.registry.remove(stream_id) else {
            warn!(stream_id, "logout without session, dropping");
            return Ok(None);
        };
        if let Some(uuid) = session.user_uuid {
            self.store.deauthenticate(uuid)?;
        }
        info!(stream_id, user = ?session.username, "logout");
        Ok(Some(Packet::empty(PacketKind::LogoutResponse)))
    }

    // ------------------------------------------------------------------
    // Authenticated catalogue requests
    // ------------------------------------------------------------------

    fn notification_port(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        if self.auth_info(stream_id).is_none() {
            warn!(stream_id, "notification port before authentication, dropping");
            return Ok(None);
        }
        let port = match wire::decode_port(payload) {
            Ok(port) => port,
            Err(e) => {
                warn!(stream_id, error = %e, "malformed notification port payload");
                return Ok(None);
            }
        };
        self.registry
            .with_session(stream_id, |s| s.notification_port = Some(port));
        debug!(stream_id, port, "notification endpoint registered");
        Ok(Some(Packet::empty(PacketKind::NotificationPortResponse)))
    }

    fn channel_fetch(&self, stream_id: u64) -> Result<Option<Packet>> {
        let Some((uuid, _, key)) = self.keyed_auth(stream_id) else {
            warn!(stream_id, "channel fetch before authentication, dropping");
            return Ok(None);
        };

        let entries: Vec<DirectoryEntry> = self
            .store
            .subscribed_channels(uuid)?
            .into_iter()
            .map(|c| DirectoryEntry {
                name: c.name,
                uuid: c.uuid.to_string(),
            })
            .collect();
        let body = crypto::encrypt(&key, &wire::encode_directory(&entries))?;
        Ok(Some(Packet::new(PacketKind::ChannelFetchResponse, body)?))
    }

    fn join_channel(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        let Some((uuid, _, key)) = self.keyed_auth(stream_id) else {
            warn!(stream_id, "join before authentication, dropping");
            return Ok(None);
        };

        let channel = match crypto::decrypt(&key, payload)
            .map_err(|_| ())
            .and_then(|plain| ChannelId::from_wire(&plain).map_err(|_| ()))
        {
            Ok(channel) => channel,
            Err(()) => {
                warn!(stream_id, "malformed join payload");
                return Ok(Some(Packet::empty(PacketKind::JoinChannelError)));
            }
        };

        match self.store.join_channel(uuid, channel) {
            Ok(()) => {
                self.registry.with_session(stream_id, |s| {
                    s.subscriptions.insert(channel);
                });
                debug!(stream_id, %channel, "joined channel");
                Ok(Some(Packet::empty(PacketKind::JoinChannelSuccess)))
            }
            Err(StoreError::NotFound) => {
                debug!(stream_id, %channel, "join of unknown channel");
                Ok(Some(Packet::empty(PacketKind::JoinChannelError)))
            }
            Err(e) => {
                warn!(stream_id, error = %e, "join failed in store");
                Ok(Some(Packet::empty(PacketKind::JoinChannelError)))
            }
        }
    }

    fn user_search(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        let Some((_, username, key)) = self.keyed_auth(stream_id) else {
            warn!(stream_id, "search before authentication, dropping");
            return Ok(None);
        };

        let pattern = match crypto::decrypt(&key, payload)
            .ok()
            .and_then(|plain| String::from_utf8(plain).ok())
        {
            Some(pattern) => pattern,
            None => {
                warn!(stream_id, "malformed search payload, dropping");
                return Ok(None);
            }
        };

        let entries: Vec<DirectoryEntry> = self
            .store
            .search_users(&username, &pattern, USER_SEARCH_DEPTH)?
            .into_iter()
            .map(|(name, uuid)| DirectoryEntry {
                name,
                uuid: uuid.to_string(),
            })
            .collect();
        let body = crypto::encrypt(&key, &wire::encode_directory(&entries))?;
        Ok(Some(Packet::new(PacketKind::UserSearchResponse, body)?))
    }

    fn username_lookup(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        let Some((_, _, key)) = self.keyed_auth(stream_id) else {
            warn!(stream_id, "username lookup before authentication, dropping");
            return Ok(None);
        };

        let target = match crypto::decrypt(&key, payload)
            .map_err(|_| ())
            .and_then(|plain| UserId::from_wire(&plain).map_err(|_| ()))
        {
            Ok(target) => target,
            Err(()) => {
                warn!(stream_id, "malformed username lookup payload, dropping");
                return Ok(None);
            }
        };

        match self.store.get_username(target) {
            Ok(name) => {
                let body = crypto::encrypt(&key, name.as_bytes())?;
                Ok(Some(Packet::new(PacketKind::UsernameResponse, body)?))
            }
            Err(StoreError::NotFound) => {
                warn!(stream_id, %target, "username lookup for unknown user, dropping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Two-phase peer key exchange
    // ------------------------------------------------------------------

    fn peer_key_phase1(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        if self.auth_info(stream_id).is_none() {
            warn!(stream_id, "peer handshake before authentication, dropping");
            return Ok(None);
        }
        let target = match UserId::from_wire(payload) {
            Ok(target) => target,
            Err(e) => {
                warn!(stream_id, error = %e, "malformed peer handshake target");
                return Ok(None);
            }
        };

        let bundle = self
            .registry
            .find_by_uuid(target)
            .and_then(|id| self.registry.get(id))
            .and_then(|s| s.peer_public_key);
        match bundle {
            Some(bundle) => Ok(Some(Packet::new(
                PacketKind::ClientPublicKey,
                bundle.to_bytes().to_vec(),
            )?)),
            None => {
                warn!(stream_id, %target, "peer handshake target offline, dropping");
                Ok(None)
            }
        }
    }

    async fn peer_key_phase2(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        let Some((sender, _)) = self.auth_info(stream_id) else {
            warn!(stream_id, "peer handshake before authentication, dropping");
            return Ok(None);
        };
        let (target_str, sealed_key) = match wire::decode_peer_handshake(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(stream_id, error = %e, "malformed peer handshake payload");
                return Ok(None);
            }
        };
        let target = match UserId::parse_str(&target_str) {
            Ok(target) => target,
            Err(e) => {
                warn!(stream_id, error = %e, "malformed peer handshake target uuid");
                return Ok(None);
            }
        };

        // The recipient learns the originator: the leading uuid is replaced
        // with the sender's before the packet leaves the broker.
        let substituted = wire::encode_peer_handshake(&sender.to_string(), &sealed_key);

        let endpoint = self
            .registry
            .find_by_uuid(target)
            .and_then(|id| self.registry.get(id))
            .and_then(|s| s.notification_endpoint());
        match endpoint {
            Some((addr, port)) => {
                let push_packet =
                    Packet::new(PacketKind::HandshakeNotification, substituted.clone())?;
                notifier::push(addr, port, push_packet).await;
            }
            None => {
                warn!(stream_id, %target, "peer handshake target unreachable");
            }
        }

        // Echo with the same substitution back to the initiator.
        Ok(Some(Packet::new(
            PacketKind::HandshakeNotification,
            substituted,
        )?))
    }

    // ------------------------------------------------------------------
    // Message relay
    // ------------------------------------------------------------------

    async fn relay_message(&self, stream_id: u64, payload: &[u8]) -> Result<Option<Packet>> {
        let Some((sender, _)) = self.auth_info(stream_id) else {
            warn!(stream_id, "message before authentication, dropping");
            return Ok(None);
        };
        let error = || Ok(Some(Packet::empty(PacketKind::MessageError)));

        let msg = match Message::from_bytes(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(stream_id, error = %e, "malformed message envelope");
                return error();
            }
        };
        if msg.sender != sender {
            warn!(stream_id, claimed = %msg.sender, actual = %sender, "sender spoof rejected");
            return error();
        }

        let channel = match self.store.get_channel(msg.channel) {
            Ok(channel) => channel,
            Err(StoreError::NotFound) => {
                warn!(stream_id, channel = %msg.channel, "message to unknown channel");
                return error();
            }
            Err(e) => return Err(e.into()),
        };
        if !channel.subscribers.contains(&sender) {
            warn!(stream_id, channel = %msg.channel, "message from non-subscriber");
            return error();
        }

        let bundle = self
            .registry
            .get(stream_id)
            .and_then(|s| s.peer_public_key);
        let Some(bundle) = bundle else {
            warn!(stream_id, "message on session without public key");
            return error();
        };
        if msg.verify(&bundle).is_err() {
            warn!(stream_id, "message signature rejected");
            return error();
        }

        // Direct-message convention: deliver to the session whose user uuid
        // equals the envelope's channel uuid.
        let recipient = UserId::from(msg.channel);
        let endpoint = self
            .registry
            .find_by_uuid(recipient)
            .and_then(|id| self.registry.get(id))
            .and_then(|s| s.notification_endpoint());
        let Some((addr, port)) = endpoint else {
            debug!(stream_id, %recipient, "message target not connected");
            return error();
        };

        notifier::push(
            addr,
            port,
            Packet::new(PacketKind::MessageNotification, payload.to_vec())?,
        )
        .await;

        self.store.enqueue_message(MessageRow {
            kind: msg.kind,
            sender,
            channel: msg.channel,
            content: msg.ciphertext,
            timestamp: Utc::now(),
            file: None,
        })?;

        debug!(stream_id, %recipient, "message relayed");
        Ok(Some(Packet::empty(PacketKind::MessageSuccess)))
    }

    // ------------------------------------------------------------------
    // Session snapshots
    // ------------------------------------------------------------------

    fn session_key(&self, stream_id: u64) -> Option<SymmetricKey> {
        self.registry
            .with_session(stream_id, |s| s.session_key)
            .flatten()
    }

    fn auth_info(&self, stream_id: u64) -> Option<(UserId, String)> {
        self.registry
            .with_session(stream_id, |s| {
                s.user_uuid.zip(s.username.clone())
            })
            .flatten()
    }

    /// Authenticated session with an established key: user uuid, username
    /// and session key in one registry pass.
    fn keyed_auth(&self, stream_id: u64) -> Option<(UserId, String, SymmetricKey)> {
        self.registry
            .with_session(stream_id, |s| {
                match (s.user_uuid, s.username.clone(), s.session_key) {
                    (Some(uuid), Some(name), Some(key)) => Some((uuid, name, key)),
                    _ => None,
                }
            })
            .flatten()
    }
}
