use chrono::Utc;
use rusqlite::params;

use iplchat_shared::constants::PASSWORD_SALT_SIZE;
use iplchat_shared::crypto;
use iplchat_shared::types::UserId;

use crate::error::{Result, StoreError};
use crate::Store;

impl Store {
    /// Create a user row with a fresh 16-byte salt and a memory-hard
    /// password hash. Fails with [`StoreError::AlreadyExists`] when the
    /// username is taken.
    pub fn register_client(&self, uuid: UserId, username: &str, password: &str) -> Result<()> {
        let salt = crypto::random_bytes(PASSWORD_SALT_SIZE);
        let hash = crypto::hash_password(password, &salt)?;

        self.db().with_conn(|conn| {
            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                params![username],
                |row| row.get(0),
            )?;
            if taken {
                return Err(StoreError::AlreadyExists);
            }

            conn.execute(
                "INSERT INTO users (uuid, username, password, salt, created)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid.to_string(),
                    username,
                    hash,
                    salt,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Verify credentials with a constant-time hash comparison. On success
    /// the user is marked authenticated and `last_auth` is stamped.
    pub fn login(&self, username: &str, password: &str) -> Result<UserId> {
        let (uuid_str, stored_hash, salt): (String, Vec<u8>, Vec<u8>) =
            self.db().with_conn(|conn| {
                conn.query_row(
                    "SELECT uuid, password, salt FROM users WHERE username = ?1",
                    params![username],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                    other => StoreError::Sqlite(other),
                })
            })?;

        if !crypto::verify_password(password, &salt, &stored_hash)? {
            return Err(StoreError::InvalidPassword);
        }

        let uuid = UserId::parse_str(&uuid_str)?;
        self.db().with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_authenticated = 1, last_auth = ?1 WHERE uuid = ?2",
                params![Utc::now().to_rfc3339(), uuid_str],
            )?;
            Ok(())
        })?;
        Ok(uuid)
    }

    /// Stamp a user authenticated without a credential check. Used right
    /// after registration, where the password was just set.
    pub fn mark_authenticated(&self, uuid: UserId) -> Result<()> {
        self.db().with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_authenticated = 1, last_auth = ?1 WHERE uuid = ?2",
                params![Utc::now().to_rfc3339(), uuid.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn deauthenticate(&self, uuid: UserId) -> Result<()> {
        self.db().with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_authenticated = 0 WHERE uuid = ?1",
                params![uuid.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn get_user_uuid(&self, username: &str) -> Result<UserId> {
        let uuid_str: String = self.db().with_conn(|conn| {
            conn.query_row(
                "SELECT uuid FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
        })?;
        Ok(UserId::parse_str(&uuid_str)?)
    }

    pub fn get_username(&self, uuid: UserId) -> Result<String> {
        self.db().with_conn(|conn| {
            conn.query_row(
                "SELECT username FROM users WHERE uuid = ?1",
                params![uuid.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
        })
    }

    pub fn is_authenticated(&self, uuid: UserId) -> Result<bool> {
        self.db().with_conn(|conn| {
            conn.query_row(
                "SELECT is_authenticated FROM users WHERE uuid = ?1",
                params![uuid.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
        })
    }

    /// Up to `depth` users whose username contains `pattern`, excluding the
    /// requester, ascending by username.
    pub fn search_users(
        &self,
        requester_name: &str,
        pattern: &str,
        depth: usize,
    ) -> Result<Vec<(String, UserId)>> {
        self.db().with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username, uuid FROM users
                 WHERE instr(username, ?1) > 0 AND username <> ?2
                 ORDER BY username ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![pattern, requester_name, depth as i64],
                |row| {
                    let name: String = row.get(0)?;
                    let uuid: String = row.get(1)?;
                    Ok((name, uuid))
                },
            )?;

            let mut users = Vec::new();
            for row in rows {
                let (name, uuid_str) = row?;
                users.push((name, UserId::parse_str(&uuid_str)?));
            }
            Ok(users)
        })
    }
}
