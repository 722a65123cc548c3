use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use iplchat_shared::constants::{
    RELEVANCE_DECAY_DELTA, RELEVANCE_DECAY_RHO, RELEVANCE_WEIGHT_DECAY,
    RELEVANCE_WEIGHT_REQUESTS, RELEVANCE_WEIGHT_SUBSCRIBERS,
};
use iplchat_shared::message::MessageKind;
use iplchat_shared::types::{ChannelId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub uuid: UserId,
    pub username: String,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub is_authenticated: bool,
    pub last_auth: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub profile_picture: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub uuid: ChannelId,
    pub name: String,
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub request_count: i64,
    pub last_request: Option<DateTime<Utc>>,
    pub subscribers: HashSet<UserId>,
}

impl Channel {
    /// Numeric priority for cache retention. Grows with subscribers and
    /// accesses, decays in the absence of requests.
    pub fn relevance(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = self
            .last_request
            .map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let decay = (1.0 - RELEVANCE_DECAY_DELTA).powf(elapsed / RELEVANCE_DECAY_RHO);
        RELEVANCE_WEIGHT_SUBSCRIBERS * self.subscribers.len() as f64
            + RELEVANCE_WEIGHT_REQUESTS * self.request_count as f64
            + RELEVANCE_WEIGHT_DECAY * decay
    }
}

/// One persisted message row, queued by the relay and drained by `flush`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub kind: MessageKind,
    pub sender: UserId,
    pub channel: ChannelId,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub file: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileBlob {
    pub uuid: Uuid,
    pub filename: String,
    pub filesize: i64,
    pub filedata: Vec<u8>,
    pub upload_date: DateTime<Utc>,
}
