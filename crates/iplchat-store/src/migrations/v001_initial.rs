//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `users`, `files`, `messages`, `channels`,
//! and `channels_users`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    uuid             TEXT PRIMARY KEY NOT NULL,   -- UUID v4, canonical text
    username         TEXT NOT NULL UNIQUE,
    password         BLOB NOT NULL,               -- salted Argon2 output
    salt             BLOB NOT NULL,               -- 16 bytes
    is_authenticated INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    last_auth        TEXT,                        -- ISO-8601 / RFC-3339
    created          TEXT NOT NULL DEFAULT (datetime('now')),
    profile_picture  TEXT,                        -- nullable FK -> files(uuid)

    FOREIGN KEY (profile_picture) REFERENCES files(uuid)
);

-- ----------------------------------------------------------------
-- File blobs (envelope FILE kind; server-side persistence deferred)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    uuid        TEXT PRIMARY KEY NOT NULL,
    filename    TEXT NOT NULL,
    filesize    INTEGER NOT NULL,
    filedata    BLOB NOT NULL,
    upload_date TEXT NOT NULL DEFAULT (datetime('now'))
);

-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    uuid          TEXT PRIMARY KEY NOT NULL,
    name          TEXT NOT NULL,
    description   TEXT,
    created       TEXT NOT NULL DEFAULT (datetime('now')),
    request_count INTEGER NOT NULL DEFAULT 0,
    last_request  TEXT
);

-- ----------------------------------------------------------------
-- Messages (ciphertext only; the broker never stores plaintext)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    kind      TEXT NOT NULL CHECK (kind IN ('text', 'file')),
    sender    TEXT NOT NULL,                     -- FK -> users(uuid)
    channel   TEXT NOT NULL,                     -- FK -> channels(uuid)
    content   BLOB NOT NULL,                     -- opaque ciphertext
    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
    file      TEXT,                              -- nullable FK -> files(uuid)

    FOREIGN KEY (sender)  REFERENCES users(uuid),
    FOREIGN KEY (channel) REFERENCES channels(uuid),
    FOREIGN KEY (file)    REFERENCES files(uuid)
);

CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
    ON messages(channel, timestamp DESC);

-- ----------------------------------------------------------------
-- Subscriptions. Exactly one row direction: (channel, user).
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels_users (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,                       -- FK -> channels(uuid)
    user    TEXT NOT NULL,                       -- FK -> users(uuid)

    FOREIGN KEY (channel) REFERENCES channels(uuid) ON DELETE CASCADE,
    FOREIGN KEY (user)    REFERENCES users(uuid)    ON DELETE CASCADE,
    UNIQUE (channel, user)
);

CREATE INDEX IF NOT EXISTS idx_channels_users_user ON channels_users(user);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
