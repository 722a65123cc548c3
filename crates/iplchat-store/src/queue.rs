//! Batched message write queue. Appends are cheap and in-memory; a drain
//! writes the backlog to durable storage in enqueue order.

use std::collections::VecDeque;

use crate::models::MessageRow;

pub struct WriteQueue {
    items: VecDeque<MessageRow>,
    capacity: usize,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a row. Returns `true` once the backlog has reached capacity
    /// and the caller should flush.
    pub fn push(&mut self, row: MessageRow) -> bool {
        self.items.push_back(row);
        self.items.len() >= self.capacity
    }

    /// Take the whole backlog, oldest first.
    pub fn drain(&mut self) -> Vec<MessageRow> {
        self.items.drain(..).collect()
    }

    /// Put rows back at the front after a failed drain, preserving order.
    pub fn requeue_front(&mut self, rows: Vec<MessageRow>) {
        for row in rows.into_iter().rev() {
            self.items.push_front(row);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
