use crate::{CacheConfig, CacheEntry, CacheStats};
use lru::LruCache;
use parking_lot::Mutex;
use rulegraph_core::{RenderContext, RuleType};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheState<V> {
    entries: LruCache<String, CacheEntry<V>>,
    /// tag -> keys stored under it
    tag_index: HashMap<String, HashSet<String>>,
    stats: CacheStats,
    last_purge: Instant,
    /// Bumped by every invalidation, even one that drops nothing
    epoch: u64,
}

impl<V> CacheState<V> {
    fn detach(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.unindex(key, &entry.tags);
        Some(entry)
    }

    fn unindex(&mut self, key: &str, tags: &HashSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.detach(key);
        }
        self.stats.expirations += expired.len() as u64;
        self.last_purge = now;
        expired.len()
    }
}

/// Bounded LRU cache for rendered prompts.
///
/// Entries expire lazily: an entry past its TTL is treated as absent on
/// lookup, and a full sweep runs at most once per `cleanup_interval`, piggy-
/// backed on writes. Every entry can carry tags (for example the rules a
/// prompt was built from) so the write path can drop exactly the entries a
/// mutation affects. All state sits behind a single lock; concurrent writers
/// to the same key resolve last-write-wins.
///
/// A value computed across await points can outlive an invalidation that ran
/// while it was being built. Such writers read [`PromptCache::epoch`] before
/// they start and store through [`PromptCache::set_if_epoch`], which refuses
/// the write once any invalidation has happened in between.
pub struct PromptCache<V> {
    state: Mutex<CacheState<V>>,
    config: CacheConfig,
}

impl<V: Clone> PromptCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                tag_index: HashMap::new(),
                stats: CacheStats {
                    capacity: capacity.get(),
                    ..Default::default()
                },
                last_purge: Instant::now(),
                epoch: 0,
            }),
            config,
        }
    }

    /// Deterministic key for one generation request.
    ///
    /// The readable `tier:name:` prefix keeps prefix invalidation usable; the
    /// digest covers the whole request. Model names compare case-insensitively.
    pub fn create_key(
        rule_type: RuleType,
        rule_name: &str,
        context: &RenderContext,
        target_model: &str,
    ) -> String {
        let model = target_model.to_lowercase();
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(rule_type.as_str().as_bytes());
        field(rule_name.as_bytes());
        field(model.as_bytes());
        for (key, value) in context {
            field(key.as_bytes());
            field(value.as_bytes());
        }
        format!("{}:{}:{:x}", rule_type, rule_name, hasher.finalize())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.entries.get_mut(key) {
            None => {
                state.stats.misses += 1;
                None
            }
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch();
                state.stats.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                state.detach(key);
                state.stats.expirations += 1;
                state.stats.misses += 1;
                debug!("Cache entry expired: {}", key);
                None
            }
        }
    }

    /// Whether a live entry exists, without touching recency or stats
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock();
        state
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        self.set_with_tags(key, value, ttl, Vec::new());
    }

    /// Store `value`; `ttl = None` falls back to the configured default
    pub fn set_with_tags(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) {
        if !self.config.enabled {
            return;
        }
        let mut guard = self.state.lock();
        self.insert_locked(&mut guard, key.into(), value, ttl, tags);
    }

    /// Current invalidation epoch
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Store `value` only if no invalidation ran since `epoch` was read.
    ///
    /// Returns whether the value was stored.
    pub fn set_if_epoch(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        tags: Vec<String>,
        epoch: u64,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let key = key.into();
        let mut guard = self.state.lock();
        if guard.epoch != epoch {
            debug!(
                "Discarding cache write for {}: invalidated while computing (epoch {} -> {})",
                key, epoch, guard.epoch
            );
            return false;
        }
        self.insert_locked(&mut guard, key, value, ttl, tags);
        true
    }

    fn insert_locked(
        &self,
        state: &mut CacheState<V>,
        key: String,
        value: V,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) {
        let now = Instant::now();
        if now.saturating_duration_since(state.last_purge) >= self.config.cleanup_interval {
            let purged = state.purge_expired(now);
            if purged > 0 {
                debug!("Purged {} expired cache entries", purged);
            }
        }

        // Replacing a key must not count as an eviction below
        state.detach(&key);

        let entry = CacheEntry::new(value, ttl.or(self.config.default_ttl)).with_tags(tags);
        for tag in &entry.tags {
            state
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }

        if let Some((evicted_key, evicted)) = state.entries.push(key, entry) {
            state.unindex(&evicted_key, &evicted.tags);
            state.stats.evictions += 1;
            debug!("Evicted least recently used cache entry: {}", evicted_key);
        }
    }

    /// Drop every entry (`None`) or every entry under `pattern`.
    ///
    /// Patterns match whole `:`-separated segments: `task:T1` drops
    /// `task:T1:<digest>` but not `task:T10:<digest>`.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.epoch += 1;

        let removed = match pattern {
            None => {
                let count = state.entries.len();
                state.entries.clear();
                state.tag_index.clear();
                count
            }
            Some(prefix) => {
                let keys: Vec<String> = state
                    .entries
                    .iter()
                    .filter(|(key, _)| matches_prefix(key, prefix))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &keys {
                    state.detach(key);
                }
                keys.len()
            }
        };

        state.stats.invalidations += removed as u64;
        debug!("Invalidated {} cache entries (pattern: {:?})", removed, pattern);
        removed
    }

    /// Drop every entry stored under `tag`
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.epoch += 1;

        let Some(keys) = state.tag_index.remove(tag) else {
            return 0;
        };
        let mut removed = 0;
        for key in &keys {
            if state.detach(key).is_some() {
                removed += 1;
            }
        }
        state.stats.invalidations += removed as u64;
        debug!("Invalidated {} cache entries tagged {}", removed, tag);
        removed
    }

    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    pub fn clear(&self) {
        self.invalidate(None);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats.clone()
        }
    }
}

fn matches_prefix(key: &str, prefix: &str) -> bool {
    match key.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with(':') || rest.is_empty() || rest.starts_with(':'),
        None => false,
    }
}

impl<V: Clone> Default for PromptCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
