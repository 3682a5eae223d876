//! Address to domain name cache fed by DNS answers.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const MIN_LIFETIME: Duration = Duration::from_secs(60);
pub const MAX_LIFETIME: Duration = Duration::from_secs(10 * 60);
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    domain: String,
    expires: Instant,
}

/// Written by the DNS consumer, read by the netflow tagger.
#[derive(Default)]
pub struct ReverseCache {
    entries: DashMap<IpAddr, Entry>,
}

fn lifetime(ttl_secs: u32) -> Duration {
    Duration::from_secs(ttl_secs as u64).clamp(MIN_LIFETIME, MAX_LIFETIME)
}

impl ReverseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: IpAddr, domain: &str, ttl_secs: u32) {
        self.insert_at(addr, domain, ttl_secs, Instant::now());
    }

    pub fn insert_at(&self, addr: IpAddr, domain: &str, ttl_secs: u32, now: Instant) {
        self.entries.insert(
            addr,
            Entry {
                domain: domain.to_string(),
                expires: now + lifetime(ttl_secs),
            },
        );
    }

    pub fn lookup(&self, addr: &IpAddr) -> Option<String> {
        self.lookup_at(addr, Instant::now())
    }

    pub fn lookup_at(&self, addr: &IpAddr, now: Instant) -> Option<String> {
        self.entries
            .get(addr)
            .filter(|e| e.expires > now)
            .map(|e| e.domain.clone())
    }

    /// Drop expired entries, returning how many went.
    pub fn clean_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_bounds() {
        assert_eq!(lifetime(5), MIN_LIFETIME);
        assert_eq!(lifetime(300), Duration::from_secs(300));
        assert_eq!(lifetime(86400), MAX_LIFETIME);
    }

    #[test]
    fn test_expiry_and_clean() {
        let cache = ReverseCache::new();
        let addr: IpAddr = "93.184.216.34".parse().unwrap();
        let t0 = Instant::now();
        cache.insert_at(addr, "example.com", 30, t0);
        assert_eq!(
            cache.lookup_at(&addr, t0 + Duration::from_secs(59)).as_deref(),
            Some("example.com")
        );
        let later = t0 + Duration::from_secs(61);
        assert_eq!(cache.lookup_at(&addr, later), None);
        assert_eq!(cache.clean_at(later), 1);
        assert!(cache.is_empty());
    }
}
