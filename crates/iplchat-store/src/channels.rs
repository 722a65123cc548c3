use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use iplchat_shared::types::{ChannelId, UserId};

use crate::cache::InsertOutcome;
use crate::error::{Result, StoreError};
use crate::models::Channel;
use crate::Store;

impl Store {
    pub fn create_channel_if_absent(&self, name: &str, uuid: ChannelId) -> Result<()> {
        self.db().with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO channels (uuid, name, created) VALUES (?1, ?2, ?3)",
                params![uuid.to_string(), name, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Subscribe a user to a channel. Idempotent: a duplicate join inserts
    /// no second row.
    pub fn join_channel(&self, user: UserId, channel: ChannelId) -> Result<()> {
        self.db().with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM channels WHERE uuid = ?1)",
                params![channel.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound);
            }
            conn.execute(
                "INSERT OR IGNORE INTO channels_users (channel, user) VALUES (?1, ?2)",
                params![channel.to_string(), user.to_string()],
            )?;
            Ok(())
        })?;

        // Keep any resident cached copy agreeing with the database.
        if self.buffered() {
            self.cache().subscribe_resident(&channel, user);
        }
        Ok(())
    }

    pub fn subscribed_channels(&self, user: UserId) -> Result<Vec<Channel>> {
        self.db().with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.uuid FROM channels c
                 JOIN channels_users cu ON cu.channel = c.uuid
                 WHERE cu.user = ?1
                 ORDER BY c.name ASC",
            )?;
            let uuids = stmt
                .query_map(params![user.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut channels = Vec::with_capacity(uuids.len());
            for uuid_str in uuids {
                channels.push(load_channel(conn, ChannelId::parse_str(&uuid_str)?)?);
            }
            Ok(channels)
        })
    }

    pub fn channel_exists(&self, channel: ChannelId) -> Result<bool> {
        self.db().with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM channels WHERE uuid = ?1)",
                params![channel.to_string()],
                |row| row.get(0),
            )?)
        })
    }

    pub fn is_subscribed(&self, user: UserId, channel: ChannelId) -> Result<bool> {
        self.db().with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM channels_users WHERE channel = ?1 AND user = ?2)",
                params![channel.to_string(), user.to_string()],
                |row| row.get(0),
            )?)
        })
    }

    /// Fetch a channel, counting the access. With buffering enabled the
    /// cache is consulted first and a miss is inserted under the eviction
    /// rule; otherwise this is a direct read.
    pub fn get_channel(&self, uuid: ChannelId) -> Result<Channel> {
        let now = Utc::now();

        // The access bump always hits durable state so cache and database
        // stay in step on identity even when the copy below is served from
        // memory.
        let touched = self.db().with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE channels SET request_count = request_count + 1, last_request = ?1
                 WHERE uuid = ?2",
                params![now.to_rfc3339(), uuid.to_string()],
            )?)
        })?;
        if touched == 0 {
            return Err(StoreError::NotFound);
        }

        if !self.buffered() {
            return self.db().with_conn(|conn| load_channel(conn, uuid));
        }

        {
            let mut cache = self.cache();
            cache.touch_resident(&uuid, now);
            // Resident copies are kept in step on identity and subscribers,
            // so the clone is current.
            if let Some(resident) = cache.get(&uuid) {
                return Ok(resident.clone());
            }
        }

        let channel = self.db().with_conn(|conn| load_channel(conn, uuid))?;
        let outcome = self.cache().insert(channel.clone(), now);
        if outcome == InsertOutcome::WrittenThrough {
            tracing::trace!(channel = %uuid, "channel outscored by all residents, written through");
        }
        Ok(channel)
    }
}

fn load_channel(conn: &Connection, uuid: ChannelId) -> Result<Channel> {
    let (name, description, created, request_count, last_request) = conn
        .query_row(
            "SELECT name, description, created, request_count, last_request
             FROM channels WHERE uuid = ?1",
            params![uuid.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })?;

    Ok(Channel {
        uuid,
        name,
        description,
        created: parse_timestamp(&created)?,
        request_count,
        last_request: last_request.as_deref().map(parse_timestamp).transpose()?,
        subscribers: load_subscribers(conn, uuid)?,
    })
}

fn load_subscribers(conn: &Connection, channel: ChannelId) -> Result<HashSet<UserId>> {
    let mut stmt = conn.prepare("SELECT user FROM channels_users WHERE channel = ?1")?;
    let rows = stmt.query_map(params![channel.to_string()], |row| row.get::<_, String>(0))?;

    let mut subscribers = HashSet::new();
    for row in rows {
        subscribers.insert(UserId::parse_str(&row?)?);
    }
    Ok(subscribers)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;

    fn open_store(buffered: bool) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::new(
            dir.path().join("iplchat.db"),
            dir.path().join("snapshots"),
        );
        config.buffered = buffered;
        (dir, Store::open(config).unwrap())
    }

    fn register(store: &Store, name: &str) -> UserId {
        let uuid = UserId::new();
        store.register_client(uuid, name, "pw").unwrap();
        uuid
    }

    #[test]
    fn test_create_channel_if_absent_is_idempotent() {
        let (_dir, store) = open_store(true);
        let channel = ChannelId::new();
        store.create_channel_if_absent("general", channel).unwrap();
        store.create_channel_if_absent("renamed", channel).unwrap();

        let loaded = store.get_channel(channel).unwrap();
        assert_eq!(loaded.name, "general");
    }

    #[test]
    fn test_join_channel_idempotent_single_row() {
        let (_dir, store) = open_store(true);
        let user = register(&store, "alice");
        let channel = ChannelId::new();
        store.create_channel_if_absent("general", channel).unwrap();

        store.join_channel(user, channel).unwrap();
        store.join_channel(user, channel).unwrap();

        let loaded = store.get_channel(channel).unwrap();
        assert_eq!(loaded.subscribers.len(), 1);
        assert!(loaded.subscribers.contains(&user));
    }

    #[test]
    fn test_join_unknown_channel_fails() {
        let (_dir, store) = open_store(true);
        let user = register(&store, "alice");
        assert!(matches!(
            store.join_channel(user, ChannelId::new()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_subscribed_channels_lists_joined_only() {
        let (_dir, store) = open_store(true);
        let user = register(&store, "alice");
        let joined = ChannelId::new();
        let other = ChannelId::new();
        store.create_channel_if_absent("joined", joined).unwrap();
        store.create_channel_if_absent("other", other).unwrap();
        store.join_channel(user, joined).unwrap();

        let channels = store.subscribed_channels(user).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].uuid, joined);
    }

    #[test]
    fn test_get_channel_bumps_request_count() {
        let (_dir, store) = open_store(false);
        let channel = ChannelId::new();
        store.create_channel_if_absent("general", channel).unwrap();

        let first = store.get_channel(channel).unwrap();
        let second = store.get_channel(channel).unwrap();
        assert_eq!(first.request_count, 1);
        assert_eq!(second.request_count, 2);
        assert!(second.last_request.is_some());
    }

    #[test]
    fn test_cached_copy_agrees_with_database_after_join() {
        let (_dir, store) = open_store(true);
        let user = register(&store, "alice");
        let channel = ChannelId::new();
        store.create_channel_if_absent("general", channel).unwrap();

        // Populate the cache, then mutate the subscriber set.
        store.get_channel(channel).unwrap();
        store.join_channel(user, channel).unwrap();

        let cached = store.get_channel(channel).unwrap();
        assert!(cached.subscribers.contains(&user));
        let direct = store
            .db()
            .with_conn(|conn| load_channel(conn, channel))
            .unwrap();
        assert_eq!(cached.subscribers, direct.subscribers);
        assert_eq!(cached.name, direct.name);
    }
}
