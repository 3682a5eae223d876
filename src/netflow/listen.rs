//! Local addresses recently seen accepting connections.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// How long a listen address is remembered after its last connection.
pub const LISTEN_TTL: Duration = Duration::from_secs(5 * 60);
pub const LISTEN_CLEAN_INTERVAL: Duration = Duration::from_secs(3 * 60);

#[derive(Default)]
pub struct ListenRecorder {
    seen: DashMap<IpAddr, Instant>,
}

impl ListenRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: IpAddr) {
        self.insert_at(addr, Instant::now());
    }

    pub fn insert_at(&self, addr: IpAddr, now: Instant) {
        self.seen.insert(addr, now);
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.contains_at(addr, Instant::now())
    }

    pub fn contains_at(&self, addr: &IpAddr, now: Instant) -> bool {
        self.seen
            .get(addr)
            .is_some_and(|seen| now.saturating_duration_since(*seen) <= LISTEN_TTL)
    }

    /// Forget expired addresses, returning how many were removed.
    pub fn clean_at(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| now.saturating_duration_since(*seen) <= LISTEN_TTL);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
