use rulegraph_core::CacheSettings;
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Cache entry metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    /// Invalidation tags this entry was stored under
    pub tags: HashSet<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl,
            tags: HashSet::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.created_at) >= ttl,
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries pushed out by the LRU bound
    pub evictions: u64,
    /// Entries dropped because their TTL ran out
    pub expirations: u64,
    /// Entries removed by explicit invalidation
    pub invalidations: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

/// Cache configuration options
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub default_ttl: Option<Duration>,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_entries: settings.max_entries,
            // ttl_secs = 0 means entries only leave through LRU or invalidation
            default_ttl: (settings.ttl_secs > 0).then(|| settings.ttl()),
            cleanup_interval: settings.cleanup_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new("x", Some(Duration::from_secs(10)));
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.created_at + Duration::from_secs(10)));

        let forever = CacheEntry::new("y", None);
        assert!(!forever.is_expired_at(forever.created_at + Duration::from_secs(1_000_000)));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = CacheSettings::default();
        settings.ttl_secs = 0;
        let config = CacheConfig::from(&settings);
        assert_eq!(config.default_ttl, None);
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
    }
}
