//! Per-connection session records and the registry mapping stream ids to
//! them. A session is created on HANDSHAKE_REQUEST, populated as the
//! protocol advances, and removed on disconnect or LOGOUT_REQUEST.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use iplchat_shared::crypto::SymmetricKey;
use iplchat_shared::identity::PublicKeyBundle;
use iplchat_shared::types::{ChannelId, UserId};

/// Broker-side state for one client connection. Fields fill in as the
/// handshake, authentication and notification registration steps complete.
#[derive(Debug, Clone)]
pub struct Session {
    pub stream_id: u64,
    pub addr: IpAddr,
    pub user_uuid: Option<UserId>,
    pub username: Option<String>,
    pub session_key: Option<SymmetricKey>,
    pub peer_public_key: Option<PublicKeyBundle>,
    pub notification_port: Option<u16>,
    pub subscriptions: HashSet<ChannelId>,
    pub login_attempts: u32,
    pub register_attempts: u32,
    pub last_login_time: Option<Instant>,
    pub last_register_time: Option<Instant>,
}

impl Session {
    pub fn new(stream_id: u64, addr: IpAddr) -> Self {
        Self {
            stream_id,
            addr,
            user_uuid: None,
            username: None,
            session_key: None,
            peer_public_key: None,
            notification_port: None,
            subscriptions: HashSet::new(),
            login_attempts: 0,
            register_attempts: 0,
            last_login_time: None,
            last_register_time: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_uuid.is_some()
    }

    pub fn notification_endpoint(&self) -> Option<(IpAddr, u16)> {
        self.notification_port.map(|port| (self.addr, port))
    }
}

/// Throttling policy for login/register attempts. Disabled when the
/// configured window is zero.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub multiplier: f64,
    pub random: bool,
}

impl RateLimitPolicy {
    pub const DISABLED: Self = Self {
        window: Duration::ZERO,
        multiplier: 1.0,
        random: false,
    };

    const FREE_ATTEMPTS: u32 = 3;

    /// Whether another attempt is allowed right now, given how many
    /// attempts have been made and when the last one happened. Each
    /// rejected attempt past the free quota widens the window.
    pub fn throttled(&self, attempts: u32, last: Option<Instant>) -> bool {
        if self.window.is_zero() || attempts < Self::FREE_ATTEMPTS {
            return false;
        }
        let Some(last) = last else { return false };

        let over = attempts - Self::FREE_ATTEMPTS;
        let mut window = self.window.as_secs_f64() * self.multiplier.max(1.0).powi(over as i32);
        if self.random {
            window *= 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        }
        last.elapsed().as_secs_f64() < window
    }
}

/// All live sessions, keyed by stream id. Locked only for straight-line
/// sections; callers clone what they need and never hold the guard across
/// an await.
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a stream id for a freshly accepted connection. The session
    /// record itself is only inserted once the handshake arrives.
    pub fn allocate_stream_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a new session. Returns `false` when the stream id already has
    /// one (a repeated handshake).
    pub fn insert(&self, session: Session) -> bool {
        let mut sessions = self.lock();
        match sessions.entry(session.stream_id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn remove(&self, stream_id: u64) -> Option<Session> {
        self.lock().remove(&stream_id)
    }

    pub fn contains(&self, stream_id: u64) -> bool {
        self.lock().contains_key(&stream_id)
    }

    /// Run a closure against one session under the registry lock.
    pub fn with_session<F, T>(&self, stream_id: u64, f: F) -> Option<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        self.lock().get_mut(&stream_id).map(f)
    }

    /// Clone one session's current state.
    pub fn get(&self, stream_id: u64) -> Option<Session> {
        self.lock().get(&stream_id).cloned()
    }

    /// Linear scan for the session authenticated as `uuid`.
    pub fn find_by_uuid(&self, uuid: UserId) -> Option<u64> {
        self.lock()
            .values()
            .find(|s| s.user_uuid == Some(uuid))
            .map(|s| s.stream_id)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Console listing: stream id, username (if authenticated), address.
    pub fn client_list(&self) -> Vec<(u64, Option<String>, IpAddr)> {
        let mut clients: Vec<_> = self
            .lock()
            .values()
            .map(|s| (s.stream_id, s.username.clone(), s.addr))
            .collect();
        clients.sort_by_key(|(id, _, _)| *id);
        clients
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Session>> {
        self.sessions.lock().expect("session registry lock poisoned")
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
