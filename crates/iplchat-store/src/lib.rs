//! Persistence engine for the iplchat broker: the durable catalogue of
//! users, channels, subscriptions and messages, fronted by a
//! relevance-weighted channel cache, a batched write queue and a bounded
//! snapshot ring.

pub mod cache;
pub mod database;
pub mod error;
pub mod migrations;
pub mod models;
pub mod queue;
pub mod snapshots;

mod channels;
mod messages;
mod users;

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;

use iplchat_shared::constants::CHANNEL_CACHE_CAPACITY;

use crate::cache::ChannelCache;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::MessageRow;
use crate::queue::WriteQueue;
use crate::snapshots::SnapshotRing;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub snapshot_backlog: usize,
    /// Route channel reads through the in-memory cache.
    pub buffered: bool,
    /// Queue length that triggers an early flush.
    pub queue_capacity: usize,
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            snapshot_dir: snapshot_dir.into(),
            snapshot_backlog: 10,
            buffered: true,
            queue_capacity: 100,
        }
    }
}

/// The engine facade. All durable access goes through here; locks are held
/// only for straight-line sections.
pub struct Store {
    db: Database,
    cache: Mutex<ChannelCache>,
    queue: Mutex<WriteQueue>,
    snapshots: Mutex<SnapshotRing>,
    buffered: bool,
    /// Name of the snapshot most recently moved into the live path, kept so
    /// a revert is only offered when there is something to revert.
    last_loaded: Mutex<Option<String>>,
}

impl Store {
    pub fn open(config: StoreConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open_at(&config.db_path)?;
        let snapshots = SnapshotRing::open(&config.snapshot_dir, config.snapshot_backlog)?;

        Ok(Self {
            db,
            cache: Mutex::new(ChannelCache::new(CHANNEL_CACHE_CAPACITY)),
            queue: Mutex::new(WriteQueue::new(config.queue_capacity)),
            snapshots: Mutex::new(snapshots),
            buffered: config.buffered,
            last_loaded: Mutex::new(None),
        })
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn buffered(&self) -> bool {
        self.buffered
    }

    pub(crate) fn cache(&self) -> std::sync::MutexGuard<'_, ChannelCache> {
        self.cache.lock().expect("channel cache lock poisoned")
    }

    // ------------------------------------------------------------------
    // Write queue
    // ------------------------------------------------------------------

    /// Append a message row to the FIFO. Flushes through once the queue
    /// reaches its configured capacity.
    pub fn enqueue_message(&self, row: MessageRow) -> Result<()> {
        let full = {
            let mut queue = self.queue.lock().expect("write queue lock poisoned");
            queue.push(row)
        };
        if full {
            self.flush()?;
        }
        Ok(())
    }

    /// Drain the queue to durable storage in enqueue order. Returns the
    /// number of rows written. On failure the backlog is restored intact.
    pub fn flush(&self) -> Result<usize> {
        let rows = {
            let mut queue = self.queue.lock().expect("write queue lock poisoned");
            queue.drain()
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let count = rows.len();
        match self.write_messages(&rows) {
            Ok(()) => {
                tracing::debug!(count, "flushed message queue");
                Ok(count)
            }
            Err(e) => {
                let mut queue = self.queue.lock().expect("write queue lock poisoned");
                queue.requeue_front(rows);
                Err(e)
            }
        }
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.lock().expect("write queue lock poisoned").len()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Copy the live database into the snapshot directory under a sortable
    /// timestamp name. The oldest snapshot is deleted once the ring
    /// exceeds its backlog.
    pub fn save_snapshot(&self) -> Result<String> {
        self.flush()?;

        let name = SnapshotRing::timestamp_name(Utc::now());
        let dest = {
            let ring = self.snapshots.lock().expect("snapshot ring lock poisoned");
            ring.path_for(&name)
        };

        self.db.with_checkpoint(|live| {
            std::fs::copy(live, &dest)?;
            Ok(())
        })?;

        let evicted = {
            let mut ring = self.snapshots.lock().expect("snapshot ring lock poisoned");
            ring.push(name.clone())
        };
        if let Some(old) = evicted {
            let path = {
                let ring = self.snapshots.lock().expect("snapshot ring lock poisoned");
                ring.path_for(&old)
            };
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(snapshot = %old, error = %e, "failed to delete evicted snapshot");
            }
        }

        tracing::info!(snapshot = %name, "snapshot saved");
        Ok(name)
    }

    /// Move the live database aside into the reserved `temp.db`, then move
    /// the chosen snapshot into the live path and reopen.
    pub fn load_snapshot(&self, name: &str) -> Result<()> {
        self.flush()?;

        let (snap_path, temp_path) = {
            let ring = self.snapshots.lock().expect("snapshot ring lock poisoned");
            if !ring.contains(name) {
                return Err(StoreError::SnapshotMissing(name.to_owned()));
            }
            (ring.path_for(name), ring.temp_path())
        };

        self.db.with_file_swapped(|live| {
            remove_sidecars(live);
            if temp_path.exists() {
                std::fs::remove_file(&temp_path)?;
            }
            std::fs::rename(live, &temp_path)?;
            std::fs::rename(&snap_path, live)?;
            Ok(())
        })?;

        {
            let mut ring = self.snapshots.lock().expect("snapshot ring lock poisoned");
            ring.remove(name);
        }
        *self.last_loaded.lock().expect("last_loaded lock poisoned") = Some(name.to_owned());
        self.invalidate_cache();

        tracing::info!(snapshot = %name, "snapshot loaded");
        Ok(())
    }

    /// Swap the live database back with `temp.db`, restoring the state that
    /// was live immediately before the last load.
    pub fn revert_snapshot_load(&self) -> Result<()> {
        let temp_path = {
            let ring = self.snapshots.lock().expect("snapshot ring lock poisoned");
            ring.temp_path()
        };
        {
            let last = self.last_loaded.lock().expect("last_loaded lock poisoned");
            if last.is_none() || !temp_path.exists() {
                return Err(StoreError::NothingToRevert);
            }
        }

        self.flush()?;

        self.db.with_file_swapped(|live| {
            remove_sidecars(live);
            let staging = temp_path.with_extension("swap");
            std::fs::rename(live, &staging)?;
            std::fs::rename(&temp_path, live)?;
            std::fs::rename(&staging, &temp_path)?;
            Ok(())
        })?;

        *self.last_loaded.lock().expect("last_loaded lock poisoned") = None;
        self.invalidate_cache();

        tracing::info!("snapshot load reverted");
        Ok(())
    }

    pub fn list_snapshots(&self) -> Vec<String> {
        self.snapshots
            .lock()
            .expect("snapshot ring lock poisoned")
            .list()
            .to_vec()
    }

    fn invalidate_cache(&self) {
        *self.cache() = ChannelCache::new(CHANNEL_CACHE_CAPACITY);
    }
}

/// Best-effort removal of `-wal`/`-shm` sidecars before a file swap. After
/// a truncating checkpoint they carry no data.
fn remove_sidecars(live: &std::path::Path) {
    for suffix in ["-wal", "-shm"] {
        let mut os = live.as_os_str().to_owned();
        os.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(os));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iplchat_shared::message::MessageKind;
    use iplchat_shared::types::{ChannelId, UserId};

    fn open_store(dir: &std::path::Path) -> Store {
        let config = StoreConfig::new(dir.join("iplchat.db"), dir.join("snapshots"));
        Store::open(config).unwrap()
    }

    fn seed_user_and_channel(store: &Store) -> (UserId, ChannelId) {
        let user = UserId::new();
        store.register_client(user, "alice", "p1").unwrap();
        let channel = ChannelId::from(user);
        store.create_channel_if_absent("alice", channel).unwrap();
        (user, channel)
    }

    fn row(sender: UserId, channel: ChannelId, tag: u8) -> MessageRow {
        MessageRow {
            kind: MessageKind::Text,
            sender,
            channel,
            content: vec![tag],
            timestamp: Utc::now(),
            file: None,
        }
    }

    #[test]
    fn test_flush_writes_rows_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let (user, channel) = seed_user_and_channel(&store);

        for tag in 0..5u8 {
            store.enqueue_message(row(user, channel, tag)).unwrap();
        }
        assert_eq!(store.queued_messages(), 5);
        assert_eq!(store.flush().unwrap(), 5);
        assert_eq!(store.queued_messages(), 0);

        let contents = store.channel_message_contents(channel).unwrap();
        assert_eq!(contents, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_queue_capacity_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path().join("iplchat.db"), dir.path().join("snaps"));
        config.queue_capacity = 2;
        let store = Store::open(config).unwrap();
        let (user, channel) = seed_user_and_channel(&store);

        store.enqueue_message(row(user, channel, 0)).unwrap();
        assert_eq!(store.queued_messages(), 1);
        store.enqueue_message(row(user, channel, 1)).unwrap();
        // Reaching capacity flushed through.
        assert_eq!(store.queued_messages(), 0);
        assert_eq!(store.channel_message_contents(channel).unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_save_load_revert() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let (user, channel) = seed_user_and_channel(&store);

        // State A: one message.
        store.enqueue_message(row(user, channel, 1)).unwrap();
        store.flush().unwrap();
        let snapshot = store.save_snapshot().unwrap();

        // State B: two messages.
        store.enqueue_message(row(user, channel, 2)).unwrap();
        store.flush().unwrap();
        assert_eq!(store.channel_message_contents(channel).unwrap().len(), 2);

        // Load restores state A.
        store.load_snapshot(&snapshot).unwrap();
        assert_eq!(store.channel_message_contents(channel).unwrap().len(), 1);

        // Revert restores state B.
        store.revert_snapshot_load().unwrap();
        assert_eq!(store.channel_message_contents(channel).unwrap().len(), 2);

        // Nothing left to revert.
        assert!(matches!(
            store.revert_snapshot_load(),
            Err(StoreError::NothingToRevert)
        ));
    }

    #[test]
    fn test_snapshot_backlog_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path().join("iplchat.db"), dir.path().join("snaps"));
        config.snapshot_backlog = 2;
        let store = Store::open(config).unwrap();

        let first = store.save_snapshot().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save_snapshot().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save_snapshot().unwrap();

        let listed = store.list_snapshots();
        assert_eq!(listed.len(), 2);
        assert!(!listed.contains(&first));
        assert!(!dir.path().join("snaps").join(&first).exists());
    }

    #[test]
    fn test_load_unknown_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(matches!(
            store.load_snapshot("19700101000000.db"),
            Err(StoreError::SnapshotMissing(_))
        ));
    }
}
