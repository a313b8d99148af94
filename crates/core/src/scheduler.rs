//! Adaptive FIFO/LIFO selection for a single shard.
//!
//! Under normal load a shard serves its oldest job first. When the local
//! backlog reaches the high-water mark it flips to newest-first so fresh
//! requests still meet their deadlines while stale ones age out; it flips
//! back once the backlog drains to the low-water mark. The two thresholds
//! form a hysteresis band so the mode does not toggle on every job.
//!
//! Both types here are plain single-owner state: a shard worker owns one
//! [`AdaptiveQueue`] and nothing else ever touches it.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::error::CoreError;

/// Order in which a shard picks its next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Oldest first.
    Fifo,
    /// Newest first.
    Lifo,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Fifo => f.write_str("fifo"),
            Mode::Lifo => f.write_str("lifo"),
        }
    }
}

/// Hysteresis state machine over the local queue length.
#[derive(Debug, Clone)]
pub struct ModeSwitch {
    mode: Mode,
    high_water_mark: usize,
    low_water_mark: usize,
}

impl ModeSwitch {
    /// Start in FIFO mode. Fails unless `high_water_mark > low_water_mark`.
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Result<Self, CoreError> {
        if high_water_mark <= low_water_mark {
            return Err(CoreError::Validation(format!(
                "high_water_mark ({high_water_mark}) must be greater than low_water_mark ({low_water_mark})"
            )));
        }
        Ok(Self {
            mode: Mode::Fifo,
            high_water_mark,
            low_water_mark,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Feed the current backlog length. Returns `Some(new_mode)` on a transition.
    pub fn observe(&mut self, queue_len: usize) -> Option<Mode> {
        let next = match self.mode {
            Mode::Fifo if queue_len >= self.high_water_mark => Mode::Lifo,
            Mode::Lifo if queue_len <= self.low_water_mark => Mode::Fifo,
            current => current,
        };
        if next == self.mode {
            return None;
        }
        self.mode = next;
        Some(next)
    }
}

/// A shard's private reorder buffer plus its mode switch.
#[derive(Debug)]
pub struct AdaptiveQueue<T> {
    items: VecDeque<T>,
    switch: ModeSwitch,
}

impl<T> AdaptiveQueue<T> {
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Result<Self, CoreError> {
        Ok(Self {
            items: VecDeque::new(),
            switch: ModeSwitch::new(high_water_mark, low_water_mark)?,
        })
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn mode(&self) -> Mode {
        self.switch.mode()
    }

    /// Re-evaluate the mode against the current backlog.
    ///
    /// Returns the new mode when a transition happened.
    pub fn rebalance(&mut self) -> Option<Mode> {
        self.switch.observe(self.items.len())
    }

    /// Take the next item according to the current mode, without re-evaluating it.
    pub fn pop(&mut self) -> Option<T> {
        match self.switch.mode() {
            Mode::Fifo => self.items.pop_front(),
            Mode::Lifo => self.items.pop_back(),
        }
    }

    /// Re-evaluate the mode, then take the next item.
    pub fn take_next(&mut self) -> Option<T> {
        self.rebalance();
        self.pop()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
