//! Rolling Error Log
//!
//! Keeps the most recent classified errors for diagnostics, bounded both by
//! count and by age.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use super::classify::{ClassifiedError, ErrorKind};

// == Error Log ==
/// Bounded, time-windowed log of classified errors. Oldest entries are at the front.
#[derive(Debug)]
pub struct ErrorLog {
    entries: VecDeque<ClassifiedError>,
    capacity: usize,
    window: Duration,
}

impl ErrorLog {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Appends an error, dropping the oldest once capacity is reached.
    pub fn push(&mut self, error: ClassifiedError) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(error);
    }

    /// Drops entries older than the window. Returns the number removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.entries.len();
        while self
            .entries
            .front()
            .is_some_and(|e| e.timestamp() < cutoff)
        {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    /// Errors inside the window, newest first.
    pub fn recent(&self, now: DateTime<Utc>) -> Vec<ClassifiedError> {
        let cutoff = now - self.window;
        self.entries
            .iter()
            .rev()
            .filter(|e| e.timestamp() >= cutoff)
            .cloned()
            .collect()
    }

    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
