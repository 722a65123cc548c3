//! In-memory channel cache with relevance-weighted eviction.
//!
//! The capacity check and the eviction decision happen inside one `&mut`
//! borrow, so the eviction rule cannot race; the owning [`Store`]
//! serializes access behind a mutex.
//!
//! [`Store`]: crate::Store

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use iplchat_shared::types::{ChannelId, UserId};

use crate::models::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The channel is now resident.
    Cached,
    /// The key was already resident; nothing changed.
    AlreadyResident,
    /// Cache full and every resident outscored the candidate; the caller
    /// serves the channel straight from durable storage.
    WrittenThrough,
}

pub struct ChannelCache {
    capacity: usize,
    entries: HashMap<ChannelId, Channel>,
}

impl ChannelCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &ChannelId) -> Option<&Channel> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.entries.contains_key(id)
    }

    /// Keep a resident copy in step with a durable access bump.
    pub fn touch_resident(&mut self, id: &ChannelId, now: DateTime<Utc>) {
        if let Some(resident) = self.entries.get_mut(id) {
            resident.request_count += 1;
            resident.last_request = Some(now);
        }
    }

    /// Keep a resident copy's subscriber set in step with the database.
    pub fn subscribe_resident(&mut self, id: &ChannelId, user: UserId) {
        if let Some(resident) = self.entries.get_mut(id) {
            resident.subscribers.insert(user);
        }
    }

    /// Insert under the eviction rule: a full cache only evicts its
    /// lowest-relevance resident when the candidate strictly outscores it.
    pub fn insert(&mut self, channel: Channel, now: DateTime<Utc>) -> InsertOutcome {
        if self.entries.contains_key(&channel.uuid) {
            return InsertOutcome::AlreadyResident;
        }

        if self.entries.len() < self.capacity {
            self.entries.insert(channel.uuid, channel);
            return InsertOutcome::Cached;
        }

        let weakest = self
            .entries
            .values()
            .map(|c| (c.uuid, c.relevance(now)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match weakest {
            Some((weakest_id, weakest_score)) if channel.relevance(now) > weakest_score => {
                self.entries.remove(&weakest_id);
                self.entries.insert(channel.uuid, channel);
                InsertOutcome::Cached
            }
            _ => InsertOutcome::WrittenThrough,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn channel_with_relevance(subscribers: usize) -> Channel {
        // relevance ≈ 0.5 * subscribers + 0.2 (fresh decay term)
        Channel {
            uuid: ChannelId::new(),
            name: format!("ch-{subscribers}"),
            description: None,
            created: Utc::now(),
            request_count: 0,
            last_request: Some(Utc::now()),
            subscribers: (0..subscribers).map(|_| UserId::new()).collect(),
        }
    }

    #[test]
    fn test_fills_to_capacity() {
        let mut cache = ChannelCache::new(3);
        let now = Utc::now();
        for _ in 0..3 {
            assert_eq!(
                cache.insert(channel_with_relevance(2), now),
                InsertOutcome::Cached
            );
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut cache = ChannelCache::new(2);
        let now = Utc::now();
        for subs in 1..=10 {
            cache.insert(channel_with_relevance(subs), now);
            assert!(cache.len() <= 2);
        }
    }

    #[test]
    fn test_resident_key_is_noop() {
        let mut cache = ChannelCache::new(2);
        let now = Utc::now();
        let ch = channel_with_relevance(1);
        assert_eq!(cache.insert(ch.clone(), now), InsertOutcome::Cached);
        assert_eq!(cache.insert(ch, now), InsertOutcome::AlreadyResident);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_low_relevance_candidate_written_through() {
        let mut cache = ChannelCache::new(2);
        let now = Utc::now();
        cache.insert(channel_with_relevance(2), now);
        cache.insert(channel_with_relevance(2), now);

        let weak = channel_with_relevance(1);
        let weak_id = weak.uuid;
        assert_eq!(cache.insert(weak, now), InsertOutcome::WrittenThrough);
        assert!(!cache.contains(&weak_id));
    }

    #[test]
    fn test_strictly_higher_relevance_evicts_weakest() {
        let mut cache = ChannelCache::new(2);
        let now = Utc::now();
        let weakest = channel_with_relevance(1);
        let weakest_id = weakest.uuid;
        cache.insert(weakest, now);
        cache.insert(channel_with_relevance(3), now);

        let strong = channel_with_relevance(4);
        let strong_id = strong.uuid;
        assert_eq!(cache.insert(strong, now), InsertOutcome::Cached);
        assert!(cache.contains(&strong_id));
        assert!(!cache.contains(&weakest_id));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_equal_relevance_does_not_evict() {
        let mut cache = ChannelCache::new(1);
        let now = Utc::now();
        let resident = channel_with_relevance(2);
        let resident_id = resident.uuid;
        cache.insert(resident, now);

        // Same subscriber count and fresh decay term: equal score.
        assert_eq!(
            cache.insert(channel_with_relevance(2), now),
            InsertOutcome::WrittenThrough
        );
        assert!(cache.contains(&resident_id));
    }

    #[test]
    fn test_subscribe_resident_updates_set() {
        let mut cache = ChannelCache::new(1);
        let now = Utc::now();
        let mut ch = channel_with_relevance(0);
        ch.subscribers = HashSet::new();
        let id = ch.uuid;
        cache.insert(ch, now);

        let user = UserId::new();
        cache.subscribe_resident(&id, user);
        assert!(cache.get(&id).unwrap().subscribers.contains(&user));
    }
}
