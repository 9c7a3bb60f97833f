use rulegraph_cache::{invalidate_for_event, rule_tag, CacheConfig, PromptCache};
use rulegraph_core::{MutationEvent, RuleRef, RuleType};
use std::sync::Arc;
use std::time::Duration;

fn small_cache(max_entries: usize) -> PromptCache<String> {
    PromptCache::new(CacheConfig {
        max_entries,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_cache_basic_operations() {
    let cache = small_cache(8);
    assert!(cache.get("missing").is_none());

    cache.set("task:T1:abc", "prompt".to_string(), None);
    assert_eq!(cache.get("task:T1:abc").as_deref(), Some("prompt"));

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.capacity, 8);
}

#[tokio::test]
async fn test_ttl_expiry_is_lazy() {
    let cache = small_cache(8);
    cache.set("short", "x".to_string(), Some(Duration::from_millis(20)));
    cache.set("long", "y".to_string(), Some(Duration::from_secs(60)));

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Still physically present until looked up or purged
    assert_eq!(cache.len(), 2);
    assert!(!cache.contains("short"));
    assert!(cache.get("short").is_none());
    assert_eq!(cache.get("long").as_deref(), Some("y"));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().expirations, 1);
}

#[tokio::test]
async fn test_opportunistic_purge_on_write() {
    let cache: PromptCache<String> = PromptCache::new(CacheConfig {
        max_entries: 8,
        cleanup_interval: Duration::ZERO,
        ..Default::default()
    });
    cache.set("a", "1".to_string(), Some(Duration::from_millis(10)));
    cache.set("b", "2".to_string(), Some(Duration::from_millis(10)));
    tokio::time::sleep(Duration::from_millis(30)).await;

    cache.set("c", "3".to_string(), None);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().expirations, 2);
}

#[tokio::test]
async fn test_prefix_invalidation() {
    let cache = small_cache(8);
    cache.set("task:T1:1", "a".to_string(), None);
    cache.set("task:T1:2", "b".to_string(), None);
    cache.set("task:T2:1", "c".to_string(), None);
    cache.set("semantic:S1:1", "d".to_string(), None);

    assert_eq!(cache.invalidate(Some("task:T1:")), 2);
    assert!(cache.contains("task:T2:1"));
    assert_eq!(cache.invalidate(Some("task:")), 1);
    assert_eq!(cache.invalidate(None), 1);
    assert!(cache.is_empty());
    assert_eq!(cache.stats().invalidations, 4);
}

#[tokio::test]
async fn test_mutation_invalidates_dependent_entries_only() {
    let cache = small_cache(8);
    let p1 = RuleRef::new(RuleType::Primitive, 1);
    let p2 = RuleRef::new(RuleType::Primitive, 2);

    cache.set_with_tags("uses-p1", "a".to_string(), None, vec![rule_tag(p1)]);
    cache.set_with_tags(
        "uses-both",
        "b".to_string(),
        None,
        vec![rule_tag(p1), rule_tag(p2)],
    );
    cache.set_with_tags("uses-p2", "c".to_string(), None, vec![rule_tag(p2)]);

    let removed = invalidate_for_event(
        &cache,
        &MutationEvent::RuleUpdated {
            rule: p1,
            name: "P1".into(),
        },
    );
    assert_eq!(removed, 2);
    assert!(!cache.contains("uses-p1"));
    assert!(!cache.contains("uses-both"));
    assert!(cache.contains("uses-p2"));

    // The tag index no longer points at the removed key
    assert_eq!(cache.invalidate_tag(&rule_tag(p2)), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_eviction_cleans_tag_index() {
    let cache = small_cache(1);
    let rule = RuleRef::new(RuleType::Task, 1);
    cache.set_with_tags("first", "a".to_string(), None, vec![rule_tag(rule)]);
    cache.set("second", "b".to_string(), None);

    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(cache.invalidate_tag(&rule_tag(rule)), 0);
    assert!(cache.contains("second"));
}

#[tokio::test]
async fn test_concurrent_access() {
    let cache = Arc::new(small_cache(16));
    let mut handles = Vec::new();

    for worker in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            for i in 0..200 {
                let key = format!("key-{}", i % 24);
                match i % 5 {
                    0 => {
                        cache.invalidate(Some("key-1"));
                    }
                    1 | 2 => {
                        cache.set_with_tags(
                            key,
                            format!("{}-{}", worker, i),
                            None,
                            vec![format!("worker:{}", worker)],
                        );
                    }
                    _ => {
                        let _ = cache.get(&key);
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    let stats = cache.stats();
    assert!(stats.entries <= 16);
    assert_eq!(stats.entries, cache.len());

    // Index and LRU stay consistent: invalidating every worker tag empties the cache
    let removed: usize = (0..8)
        .map(|worker| cache.invalidate_tag(&format!("worker:{}", worker)))
        .sum();
    assert_eq!(removed, stats.entries);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_last_write_wins() {
    let cache = Arc::new(small_cache(4));
    let a = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.set("k", "first".to_string(), None) })
    };
    a.await.unwrap();
    cache.set("k", "second".to_string(), None);
    assert_eq!(cache.get("k").as_deref(), Some("second"));
}
