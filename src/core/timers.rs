//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A minimal timer wheel for the single-threaded marshal (spec.md §5,
//! SPEC_FULL.md §5). Timers are identified by an owner-supplied key;
//! the marshal loop polls [`TimerWheel::poll_expired`] once per
//! iteration and redelivers expired keys as ordinary marshal events,
//! keeping timer callbacks on the same thread as every other state
//! transition (spec.md §9 "Async as callbacks").

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub struct TimerWheel<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> Default for TimerWheel<K> {
    fn default() -> Self {
        TimerWheel {
            deadlines: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> TimerWheel<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, key: K, duration: Duration) {
        self.deadlines.insert(key, Instant::now() + duration);
    }

    pub fn cancel(&mut self, key: &K) {
        self.deadlines.remove(key);
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Returns all keys whose deadline has passed, removing them from
    /// the wheel.
    pub fn poll_expired(&mut self) -> Vec<K> {
        let now = Instant::now();
        let expired: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            self.deadlines.remove(k);
        }
        expired
    }

    /// The duration until the next deadline, if any armed timer
    /// exists; used by the marshal loop to size its `recv_timeout`.
    pub fn next_deadline_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.deadlines
            .values()
            .map(|&d| d.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arms_and_expires() {
        let mut wheel: TimerWheel<&'static str> = TimerWheel::new();
        wheel.arm("a", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(wheel.poll_expired(), vec!["a"]);
        assert!(!wheel.is_armed(&"a"));
    }

    #[test]
    fn cancel_prevents_expiry() {
        let mut wheel: TimerWheel<&'static str> = TimerWheel::new();
        wheel.arm("a", Duration::from_millis(1));
        wheel.cancel(&"a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(wheel.poll_expired().is_empty());
    }
}
