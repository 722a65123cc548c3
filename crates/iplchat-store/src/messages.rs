use rusqlite::params;

use iplchat_shared::message::MessageKind;
use iplchat_shared::types::ChannelId;

use crate::error::Result;
use crate::models::MessageRow;
use crate::Store;

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::File => "file",
    }
}

impl Store {
    /// Write a drained queue batch in order, atomically.
    pub(crate) fn write_messages(&self, rows: &[MessageRow]) -> Result<()> {
        self.db().with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (kind, sender, channel, content, timestamp, file)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for row in rows {
                    stmt.execute(params![
                        kind_label(row.kind),
                        row.sender.to_string(),
                        row.channel.to_string(),
                        row.content,
                        row.timestamp.to_rfc3339(),
                        row.file.map(|f| f.to_string()),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Message ciphertexts for a channel in insertion order. Used by the
    /// operator console and tests; envelopes are not reconstructible (the
    /// schema keeps no signature).
    pub fn channel_message_contents(&self, channel: ChannelId) -> Result<Vec<Vec<u8>>> {
        self.db().with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT content FROM messages WHERE channel = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![channel.to_string()], |row| row.get(0))?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    pub fn message_count(&self) -> Result<i64> {
        self.db().with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
        })
    }
}
