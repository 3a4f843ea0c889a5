//! Two-tier decision cache: in-process bounded map with a short soft TTL
//! (tier 1) backed by Redis with a longer TTL (tier 2). Postgres stays the
//! source of truth; coherence is maintained by the invalidation calls the
//! admin service issues after every decision-affecting mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Namespace prefix for all tier-2 keys.
const L2_PREFIX: &str = "authz:";

/// How many entries an eviction pass samples when tier 1 is full.
const EVICTION_SAMPLE: usize = 64;

struct L1Entry {
    json: String,
    inserted: Instant,
    /// Millis since cache construction, bumped on every hit.
    touched_ms: AtomicU64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    l1_evictions: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l1_size: usize,
    pub l1_evictions: u64,
    pub l1_hit_rate: f64,
    pub l2_hit_rate: f64,
    pub hit_rate: f64,
}

pub struct DecisionCache {
    local: DashMap<String, L1Entry>,
    l1_capacity: usize,
    l1_ttl: Duration,
    l2: Option<ConnectionManager>,
    l2_ttl: Duration,
    l2_timeout: Duration,
    epoch: Instant,
    counters: Counters,
}

impl DecisionCache {
    pub fn new(
        l2: Option<ConnectionManager>,
        l1_capacity: usize,
        l1_ttl: Duration,
        l2_ttl: Duration,
        l2_timeout: Duration,
    ) -> Self {
        Self {
            local: DashMap::new(),
            l1_capacity: l1_capacity.max(1),
            l1_ttl,
            l2,
            l2_ttl,
            l2_timeout,
            epoch: Instant::now(),
            counters: Counters::default(),
        }
    }

    /// In-process only; used by tests and single-node deployments.
    pub fn local_only(l1_capacity: usize, l1_ttl: Duration) -> Self {
        Self::new(
            None,
            l1_capacity,
            l1_ttl,
            Duration::from_secs(300),
            Duration::from_millis(20),
        )
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn get<T: DeserializeOwned>(&self, fingerprint: &str) -> Option<T> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        // tier 1
        if let Some(entry) = self.local.get(fingerprint) {
            if entry.inserted.elapsed() < self.l1_ttl {
                entry.touched_ms.store(self.now_ms(), Ordering::Relaxed);
                if let Ok(value) = serde_json::from_str(&entry.json) {
                    self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
            } else {
                drop(entry);
                self.local.remove(fingerprint);
            }
        }

        // tier 2
        if let Some(conn) = &self.l2 {
            let mut conn = conn.clone();
            let key = format!("{L2_PREFIX}{fingerprint}");
            let fetched = tokio::time::timeout(self.l2_timeout, async {
                conn.get::<_, Option<String>>(&key).await
            })
            .await;
            if let Ok(Ok(Some(json))) = fetched {
                if let Ok(value) = serde_json::from_str(&json) {
                    self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    self.insert_local(fingerprint.to_string(), json);
                    return Some(value);
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn put<T: Serialize>(&self, fingerprint: &str, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("failed to serialize cache entry: {}", e);
                return;
            }
        };
        self.insert_local(fingerprint.to_string(), json.clone());

        if let Some(conn) = &self.l2 {
            let mut conn = conn.clone();
            let key = format!("{L2_PREFIX}{fingerprint}");
            let ttl = self.l2_ttl.as_secs();
            let write = tokio::time::timeout(self.l2_timeout, async {
                conn.set_ex::<_, _, ()>(&key, json, ttl).await
            })
            .await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("tier-2 cache write failed: {}", e),
                Err(_) => tracing::warn!("tier-2 cache write timed out"),
            }
        }
    }

    fn insert_local(&self, fingerprint: String, json: String) {
        if self.local.len() >= self.l1_capacity && !self.local.contains_key(&fingerprint) {
            self.evict_one();
        }
        self.local.insert(
            fingerprint,
            L1Entry {
                json,
                inserted: Instant::now(),
                touched_ms: AtomicU64::new(self.now_ms()),
            },
        );
    }

    /// Sampled LRU: scan a bounded slice of tier 1 and drop the
    /// least-recently-touched entry. Expired entries found on the way are
    /// dropped for free.
    fn evict_one(&self) {
        let mut coldest: Option<(String, u64)> = None;
        let mut expired: Vec<String> = Vec::new();
        for entry in self.local.iter().take(EVICTION_SAMPLE) {
            if entry.inserted.elapsed() >= self.l1_ttl {
                expired.push(entry.key().clone());
                continue;
            }
            let touched = entry.touched_ms.load(Ordering::Relaxed);
            match &coldest {
                Some((_, best)) if touched >= *best => {}
                _ => coldest = Some((entry.key().clone(), touched)),
            }
        }
        if !expired.is_empty() {
            for key in expired {
                self.local.remove(&key);
            }
            return;
        }
        if let Some((key, _)) = coldest {
            self.local.remove(&key);
            self.counters.l1_evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every cached decision for one principal.
    pub async fn invalidate_principal(&self, organization_id: Uuid, principal_id: &str) {
        let prefix = format!("{organization_id}:{principal_id}:");
        self.invalidate_prefix(&prefix).await;
    }

    /// Drop every cached decision for a whole organization.
    pub async fn invalidate_organization(&self, organization_id: Uuid) {
        let prefix = format!("{organization_id}:");
        self.invalidate_prefix(&prefix).await;
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        self.local.retain(|key, _| !key.starts_with(prefix));
        if let Some(conn) = &self.l2 {
            let mut conn = conn.clone();
            let pattern = format!("{L2_PREFIX}{prefix}*");
            if let Err(e) = scan_delete(&mut conn, &pattern).await {
                tracing::warn!(pattern = %pattern, "tier-2 invalidation failed: {}", e);
            }
        }
    }

    /// Wipe both tiers.
    pub async fn clear_all(&self) {
        self.local.clear();
        if let Some(conn) = &self.l2 {
            let mut conn = conn.clone();
            let pattern = format!("{L2_PREFIX}*");
            if let Err(e) = scan_delete(&mut conn, &pattern).await {
                tracing::warn!("tier-2 clear failed: {}", e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let requests = self.counters.requests.load(Ordering::Relaxed);
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hits = l1_hits + l2_hits;
        let rate = |n: u64| {
            if requests == 0 {
                0.0
            } else {
                n as f64 / requests as f64
            }
        };
        CacheStats {
            requests,
            hits,
            misses,
            l1_hits,
            l2_hits,
            l1_size: self.local.len(),
            l1_evictions: self.counters.l1_evictions.load(Ordering::Relaxed),
            l1_hit_rate: rate(l1_hits),
            l2_hit_rate: rate(l2_hits),
            hit_rate: rate(hits),
        }
    }
}

/// Cursor-based SCAN + DEL. Never FLUSHes: the Redis instance may be shared.
async fn scan_delete(conn: &mut ConnectionManager, pattern: &str) -> redis::RedisResult<()> {
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(500)
            .query_async(conn)
            .await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        if next == 0 {
            return Ok(());
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        allowed: bool,
    }

    fn fingerprint(org: Uuid, principal: &str, action: &str) -> String {
        format!("{org}:{principal}:{action}:document:d1")
    }

    #[tokio::test]
    async fn put_then_get_round_trips_in_l1() {
        let cache = DecisionCache::local_only(16, Duration::from_secs(10));
        let org = Uuid::new_v4();
        let key = fingerprint(org, "u1", "read");

        assert_eq!(cache.get::<Entry>(&key).await, None);
        cache.put(&key, &Entry { allowed: true }).await;
        assert_eq!(cache.get::<Entry>(&key).await, Some(Entry { allowed: true }));

        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.l1_size, 1);
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = DecisionCache::local_only(16, Duration::from_millis(10));
        let key = fingerprint(Uuid::new_v4(), "u1", "read");
        cache.put(&key, &Entry { allowed: true }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get::<Entry>(&key).await, None);
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache = DecisionCache::local_only(8, Duration::from_secs(10));
        let org = Uuid::new_v4();
        for i in 0..32 {
            cache
                .put(&fingerprint(org, &format!("u{i}"), "read"), &Entry { allowed: true })
                .await;
        }
        assert!(cache.stats().l1_size <= 8);
        assert!(cache.stats().l1_evictions >= 24);
    }

    #[tokio::test]
    async fn principal_invalidation_is_prefix_scoped() {
        let cache = DecisionCache::local_only(64, Duration::from_secs(10));
        let org = Uuid::new_v4();
        let other_org = Uuid::new_v4();

        cache.put(&fingerprint(org, "u1", "read"), &Entry { allowed: true }).await;
        cache.put(&fingerprint(org, "u1", "write"), &Entry { allowed: true }).await;
        cache.put(&fingerprint(org, "u2", "read"), &Entry { allowed: true }).await;
        cache.put(&fingerprint(other_org, "u1", "read"), &Entry { allowed: true }).await;

        cache.invalidate_principal(org, "u1").await;

        assert_eq!(cache.get::<Entry>(&fingerprint(org, "u1", "read")).await, None);
        assert_eq!(cache.get::<Entry>(&fingerprint(org, "u1", "write")).await, None);
        assert!(cache.get::<Entry>(&fingerprint(org, "u2", "read")).await.is_some());
        assert!(cache
            .get::<Entry>(&fingerprint(other_org, "u1", "read"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn organization_invalidation_spares_other_tenants() {
        let cache = DecisionCache::local_only(64, Duration::from_secs(10));
        let org = Uuid::new_v4();
        let other_org = Uuid::new_v4();

        cache.put(&fingerprint(org, "u1", "read"), &Entry { allowed: true }).await;
        cache.put(&fingerprint(org, "u2", "read"), &Entry { allowed: true }).await;
        cache.put(&fingerprint(other_org, "u9", "read"), &Entry { allowed: true }).await;

        cache.invalidate_organization(org).await;

        assert_eq!(cache.get::<Entry>(&fingerprint(org, "u1", "read")).await, None);
        assert_eq!(cache.get::<Entry>(&fingerprint(org, "u2", "read")).await, None);
        assert!(cache
            .get::<Entry>(&fingerprint(other_org, "u9", "read"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn clear_all_empties_l1() {
        let cache = DecisionCache::local_only(64, Duration::from_secs(10));
        cache
            .put(&fingerprint(Uuid::new_v4(), "u1", "read"), &Entry { allowed: true })
            .await;
        cache.clear_all().await;
        assert_eq!(cache.stats().l1_size, 0);
    }

    #[tokio::test]
    async fn hit_rates_reflect_traffic() {
        let cache = DecisionCache::local_only(16, Duration::from_secs(10));
        let key = fingerprint(Uuid::new_v4(), "u1", "read");
        cache.get::<Entry>(&key).await; // miss
        cache.put(&key, &Entry { allowed: false }).await;
        cache.get::<Entry>(&key).await; // hit
        cache.get::<Entry>(&key).await; // hit

        let stats = cache.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.hits, 2);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}

pub type SharedDecisionCache = Arc<DecisionCache>;
