//! Small shared primitives: bounded drop-oldest queues, wire IDs, clocks.

use std::collections::VecDeque;

use rand_core::{OsRng, RngCore};

// ─── Bounded queue ───────────────────────────────────────────────────────────

/// A FIFO queue with a hard capacity. Pushing past capacity evicts the oldest
/// entry instead of the newest, so a stalled consumer sees the most recent
/// window of traffic.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    /// Append `item`. Returns the evicted oldest entry when at capacity.
    pub fn push(&mut self, item: T) -> Option<T> {
        let dropped = if self.items.len() >= self.cap {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ─── Wire IDs ────────────────────────────────────────────────────────────────

const BASE36: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random uppercase base36 string of `len` characters from the OS RNG.
pub fn base36_id(len: usize) -> String {
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        let idx = (OsRng.next_u32() as usize) % BASE36.len();
        out.push(BASE36[idx] as char);
    }
    out
}

/// 9-character message ID used by data-channel frames.
pub fn frame_id() -> String {
    base36_id(9).to_lowercase()
}

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Millisecond epoch timestamp for wire frames.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
