//! Notification listener: the endpoint the broker pushes out-of-band
//! packets to. Each push is a one-shot inbound connection carrying one
//! framed packet; the listener reconstructs it and emits a typed event.

use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tracing::{debug, warn};

use iplchat_shared::codec::read_packet;
use iplchat_shared::crypto;
use iplchat_shared::identity::KeyPair;
use iplchat_shared::message::Message;
use iplchat_shared::packet::{Packet, PacketKind};
use iplchat_shared::types::UserId;
use iplchat_shared::wire;

use crate::error::Result;
use crate::events::{ClientEvent, EventSender};
use crate::keychain::Keychain;

pub struct NotificationListener {
    listener: TcpListener,
    port: u16,
}

impl NotificationListener {
    /// Bind an ephemeral local port; the port is what gets registered with
    /// the broker via NOTIFICATION_PORT.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(port, "notification listener bound");
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept pushes until the task is dropped. Peer handshake pushes are
    /// resolved against the keychain (unseal, record, save); message pushes
    /// are decrypted when the sender's peer key is known.
    pub async fn run(
        self,
        keypair: KeyPair,
        keychain: Arc<Mutex<Keychain>>,
        events: EventSender,
    ) {
        loop {
            let (mut stream, from) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "notification accept failed");
                    continue;
                }
            };

            let packet = match read_packet(&mut stream).await {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(%from, error = %e, "malformed notification");
                    continue;
                }
            };

            if let Err(e) = handle_push(packet, &keypair, &keychain, &events) {
                warn!(%from, error = %e, "notification handling failed");
            }
        }
    }
}

fn handle_push(
    packet: Packet,
    keypair: &KeyPair,
    keychain: &Arc<Mutex<Keychain>>,
    events: &EventSender,
) -> Result<()> {
    match packet.kind {
        PacketKind::HandshakeNotification => {
            let (peer_str, sealed) = wire::decode_peer_handshake(&packet.payload)?;
            let peer = UserId::parse_str(&peer_str)
                .map_err(iplchat_shared::error::ProtocolError::from)?;

            let key_bytes = keypair.open_sealed(&sealed)?;
            let key: crypto::SymmetricKey = key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| iplchat_shared::error::CryptoError::InvalidKeyLength)?;

            {
                let mut chain = keychain.lock().expect("keychain lock poisoned");
                chain.add(peer, key);
                if let Err(e) = chain.save() {
                    warn!(error = %e, "failed to persist keychain after handshake");
                }
            }
            debug!(%peer, "peer key recorded");
            let _ = events.send(ClientEvent::PeerHandshake { peer });
        }
        PacketKind::MessageNotification => {
            let message = Message::from_bytes(&packet.payload)?;
            let plaintext = {
                let chain = keychain.lock().expect("keychain lock poisoned");
                chain
                    .get(&message.sender)
                    .and_then(|key| crypto::decrypt(key, &message.ciphertext).ok())
            };
            if plaintext.is_none() {
                debug!(sender = %message.sender, "no peer key for inbound message");
            }
            let _ = events.send(ClientEvent::Message { message, plaintext });
        }
        other => {
            warn!(kind = ?other, "unexpected push kind");
        }
    }
    Ok(())
}
