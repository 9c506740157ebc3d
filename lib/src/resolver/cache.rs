use std::{
    net::IpAddr,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;

struct CacheEntry {
    addresses: Vec<IpAddr>,
    inserted: Instant,
}

/// Resolved addresses by host name, least recently used entries are
/// evicted first and entries older than the TTL are never returned
pub struct HostCache {
    entries: LruCache<String, CacheEntry>,
    ttl: Duration,
}

impl HostCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        HostCache {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            ttl,
        }
    }

    pub fn get(&mut self, host: &str, now: Instant) -> Option<Vec<IpAddr>> {
        let expired = match self.entries.get(host) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.inserted) >= self.ttl,
        };

        if expired {
            self.entries.pop(host);
            return None;
        }
        self.entries.get(host).map(|entry| entry.addresses.clone())
    }

    pub fn insert(&mut self, host: &str, addresses: Vec<IpAddr>, now: Instant) {
        self.entries.put(
            host.to_owned(),
            CacheEntry {
                addresses,
                inserted: now,
            },
        );
    }

    pub fn remove(&mut self, host: &str) -> bool {
        self.entries.pop(host).is_some()
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

    fn ip(address: &str) -> IpAddr {
        address.parse().unwrap()
    }

    #[test]
    fn entries_expire() {
        let start = Instant::now();
        let mut cache = HostCache::new(4, Duration::from_secs(10));
        cache.insert("example.com", vec![ip("93.184.216.34")], start);

        assert_eq!(
            cache.get("example.com", start + Duration::from_secs(9)),
            Some(vec![ip("93.184.216.34")])
        );
        assert_eq!(cache.get("example.com", start + Duration::from_secs(10)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let now = Instant::now();
        let mut cache = HostCache::new(2, Duration::from_secs(60));
        cache.insert("a.test", vec![ip("10.0.0.1")], now);
        cache.insert("b.test", vec![ip("10.0.0.2")], now);

        // touch a.test so b.test becomes the eviction candidate
        assert!(cache.get("a.test", now).is_some());
        cache.insert("c.test", vec![ip("10.0.0.3")], now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b.test", now).is_none());
        assert!(cache.get("a.test", now).is_some());
        assert!(cache.get("c.test", now).is_some());
    }

    #[test]
    fn remove_entry() {
        let now = Instant::now();
        let mut cache = HostCache::new(0, Duration::from_secs(60));
        cache.insert("a.test", vec![ip("::1")], now);
        assert!(cache.remove("a.test"));
        assert!(!cache.remove("a.test"));
    }
}
