//! End-to-end broker scenarios over loopback TCP: registration, login,
//! subscription lists, the two-phase peer key exchange and message relay.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;

use iplchat_client::events::{self, ClientEvent, EventReceiver};
use iplchat_client::{Connection, Keychain, NotificationListener};
use iplchat_server::broker::Broker;
use iplchat_server::session::{RateLimitPolicy, SessionRegistry};
use iplchat_shared::identity::KeyPair;
use iplchat_shared::message::{Message, MessageKind};
use iplchat_shared::packet::PacketKind;
use iplchat_shared::types::{ChannelId, UserId};
use iplchat_shared::{crypto, wire};
use iplchat_store::{Store, StoreConfig};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_broker(dir: &Path) -> (SocketAddr, Arc<Broker>) {
    let store = Arc::new(
        Store::open(StoreConfig::new(
            dir.join("iplchat.db"),
            dir.join("snapshots"),
        ))
        .unwrap(),
    );
    let registry = Arc::new(SessionRegistry::new());
    let broker = Arc::new(Broker::new(store, registry, RateLimitPolicy::DISABLED));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_broker = broker.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(accept_broker.clone().serve_connection(stream));
        }
    });

    (addr, broker)
}

/// A connected, registered client with a live notification listener.
struct TestClient {
    connection: Connection,
    keychain: Arc<Mutex<Keychain>>,
    events: EventReceiver,
    uuid: UserId,
}

async fn register_client(
    addr: SocketAddr,
    dir: &Path,
    username: &str,
    password: &str,
) -> TestClient {
    let keypair = KeyPair::generate();
    let mut connection = Connection::connect(addr, keypair.clone()).await.unwrap();
    connection.handshake().await.unwrap();
    let uuid = connection.register(username, password).await.unwrap();

    let mut keychain = Keychain::new(dir, uuid);
    assert!(keychain.load(password).unwrap());
    let keychain = Arc::new(Mutex::new(keychain));

    let listener = NotificationListener::bind().await.unwrap();
    connection
        .register_notification_port(listener.port())
        .await
        .unwrap();

    let (tx, events) = events::channel();
    tokio::spawn(listener.run(keypair, keychain.clone(), tx));

    TestClient {
        connection,
        keychain,
        events,
        uuid,
    }
}

async fn next_event(events: &mut EventReceiver) -> ClientEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_register_then_login() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    // Register alice with p1.
    let mut conn = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    conn.handshake().await.unwrap();
    let registered = conn.register("alice", "p1").await.unwrap();
    conn.logout().await.unwrap();

    // Fresh connection: correct password succeeds and returns the same uuid.
    let mut conn = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    conn.handshake().await.unwrap();
    let logged_in = conn.login("alice", "p1").await.unwrap();
    assert_eq!(logged_in, registered);
    conn.logout().await.unwrap();

    // Wrong password is the paired error, nothing more specific.
    let mut conn = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    conn.handshake().await.unwrap();
    match conn.login("alice", "p2").await {
        Err(iplchat_client::error::ClientError::Rejected(PacketKind::LoginError)) => {}
        other => panic!("expected LoginError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    let mut conn = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    conn.handshake().await.unwrap();
    conn.register("alice", "p1").await.unwrap();

    let mut other = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    other.handshake().await.unwrap();
    match other.register("alice", "p2").await {
        Err(iplchat_client::error::ClientError::Rejected(PacketKind::RegisterError)) => {}
        other => panic!("expected RegisterError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscription_list_contains_own_channel() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    let mut conn = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    conn.handshake().await.unwrap();
    let uuid = conn.register("alice", "p1").await.unwrap();

    let channels = conn.fetch_channels().await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].name, "alice");
    assert_eq!(channels[0].uuid, uuid.to_string());
}

#[tokio::test]
async fn test_user_search_and_username_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    let mut alice = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    alice.handshake().await.unwrap();
    let alice_uuid = alice.register("alice", "p1").await.unwrap();

    let mut bob = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    bob.handshake().await.unwrap();
    bob.register("bob", "p2").await.unwrap();

    let found = bob.search_users("ali").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "alice");
    assert_eq!(found[0].uuid, alice_uuid.to_string());

    // The requester is excluded from their own search.
    let found = bob.search_users("bob").await.unwrap();
    assert!(found.is_empty());

    assert_eq!(bob.lookup_username(alice_uuid).await.unwrap(), "alice");
}

#[tokio::test]
async fn test_peer_key_exchange_yields_identical_keys() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    let mut alice = register_client(addr, dir.path(), "alice", "p1").await;
    let mut bob = register_client(addr, dir.path(), "bob", "p2").await;

    let key = alice
        .connection
        .peer_handshake(bob.uuid, &alice.keychain)
        .await
        .unwrap();

    // Bob's listener receives the push and learns the originator.
    match next_event(&mut bob.events).await {
        ClientEvent::PeerHandshake { peer } => assert_eq!(peer, alice.uuid),
        other => panic!("expected PeerHandshake, got {other:?}"),
    }

    let alice_side = *alice.keychain.lock().unwrap().get(&bob.uuid).unwrap();
    let bob_side = *bob.keychain.lock().unwrap().get(&alice.uuid).unwrap();
    assert_eq!(alice_side, key);
    assert_eq!(bob_side, key);
}

#[tokio::test]
async fn test_message_relay_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, broker) = spawn_broker(dir.path()).await;

    let mut alice = register_client(addr, dir.path(), "alice", "p1").await;
    let mut bob = register_client(addr, dir.path(), "bob", "p2").await;

    alice
        .connection
        .peer_handshake(bob.uuid, &alice.keychain)
        .await
        .unwrap();
    next_event(&mut bob.events).await;

    // Alice subscribes to bob's channel, then sends.
    let bob_channel = ChannelId::from(bob.uuid);
    alice.connection.join_channel(bob_channel).await.unwrap();
    alice
        .connection
        .send_message(bob_channel, b"hi", MessageKind::Text, &alice.keychain)
        .await
        .unwrap();

    match next_event(&mut bob.events).await {
        ClientEvent::Message { message, plaintext } => {
            assert_eq!(message.sender, alice.uuid);
            assert_eq!(message.channel, bob_channel);
            assert_eq!(plaintext.as_deref(), Some(&b"hi"[..]));
        }
        other => panic!("expected Message, got {other:?}"),
    }

    // The envelope was queued for persistence.
    broker.store().flush().unwrap();
    assert_eq!(broker.store().message_count().unwrap(), 1);
}

#[tokio::test]
async fn test_tampered_signature_is_rejected_and_not_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    let mut alice = register_client(addr, dir.path(), "alice", "p1").await;
    let mut bob = register_client(addr, dir.path(), "bob", "p2").await;

    alice
        .connection
        .peer_handshake(bob.uuid, &alice.keychain)
        .await
        .unwrap();
    next_event(&mut bob.events).await;

    let bob_channel = ChannelId::from(bob.uuid);
    alice.connection.join_channel(bob_channel).await.unwrap();

    // Envelope signed by the wrong keypair: structurally valid, signature
    // does not verify under alice's session public key.
    let peer_key = *alice.keychain.lock().unwrap().get(&bob.uuid).unwrap();
    let forged = Message::signed(
        alice.uuid,
        bob_channel,
        crypto::encrypt(&peer_key, b"hi").unwrap(),
        MessageKind::Text,
        &KeyPair::generate(),
    )
    .unwrap();

    match alice.connection.send_raw_message(&forged).await {
        Err(iplchat_client::error::ClientError::Rejected(PacketKind::MessageError)) => {}
        other => panic!("expected MessageError, got {other:?}"),
    }

    // Bob receives nothing.
    let nothing = tokio::time::timeout(Duration::from_millis(500), bob.events.recv()).await;
    assert!(nothing.is_err(), "unexpected event after rejected message");
}

#[tokio::test]
async fn test_message_to_offline_recipient_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    let mut alice = register_client(addr, dir.path(), "alice", "p1").await;
    let mut bob = register_client(addr, dir.path(), "bob", "p2").await;

    alice
        .connection
        .peer_handshake(bob.uuid, &alice.keychain)
        .await
        .unwrap();
    next_event(&mut bob.events).await;
    let bob_channel = ChannelId::from(bob.uuid);
    alice.connection.join_channel(bob_channel).await.unwrap();

    // Bob disconnects; his session record disappears.
    bob.connection.logout().await.unwrap();

    match alice
        .connection
        .send_message(bob_channel, b"hi", MessageKind::Text, &alice.keychain)
        .await
    {
        Err(iplchat_client::error::ClientError::Rejected(PacketKind::MessageError)) => {}
        other => panic!("expected MessageError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_message_from_non_subscriber_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _broker) = spawn_broker(dir.path()).await;

    let mut alice = register_client(addr, dir.path(), "alice", "p1").await;
    let mut bob = register_client(addr, dir.path(), "bob", "p2").await;

    alice
        .connection
        .peer_handshake(bob.uuid, &alice.keychain)
        .await
        .unwrap();
    next_event(&mut bob.events).await;

    // No join_channel: alice is not in bob's subscriber set.
    match alice
        .connection
        .send_message(
            ChannelId::from(bob.uuid),
            b"hi",
            MessageKind::Text,
            &alice.keychain,
        )
        .await
    {
        Err(iplchat_client::error::ClientError::Rejected(PacketKind::MessageError)) => {}
        other => panic!("expected MessageError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unauthenticated_requests_are_dropped_or_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, broker) = spawn_broker(dir.path()).await;

    // A session with a key but no authentication: catalogue requests are
    // dropped without a response, so probe the registry state instead.
    let mut conn = Connection::connect(addr, KeyPair::generate()).await.unwrap();
    conn.handshake().await.unwrap();
    assert_eq!(broker.registry().count(), 1);

    // The notification-port payload is plain; an unauthenticated session
    // must not be able to set one.
    use iplchat_shared::codec::{read_packet, write_packet};
    use iplchat_shared::packet::Packet;
    use tokio::net::TcpStream;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let keypair = KeyPair::generate();
    write_packet(
        &mut writer,
        &Packet::new(
            PacketKind::HandshakeRequest,
            keypair.public_bundle().to_bytes().to_vec(),
        )
        .unwrap(),
    )
    .await
    .unwrap();
    read_packet(&mut reader).await.unwrap();

    write_packet(
        &mut writer,
        &Packet::new(PacketKind::NotificationPort, wire::encode_port(4000)).unwrap(),
    )
    .await
    .unwrap();

    // No response arrives; the next request still works, proving the
    // connection survived the dropped packet.
    write_packet(&mut writer, &Packet::empty(PacketKind::LogoutRequest))
        .await
        .unwrap();
    let reply = read_packet(&mut reader).await.unwrap();
    assert_eq!(reply.kind, PacketKind::LogoutResponse);
}
