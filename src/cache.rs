// =============================================================================
// Smart Cache (C3) — TTL + LRU store with single-flight get-or-fetch
// =============================================================================
//
// Key is first-class: `(category, identifier, sorted params)` rather than a
// free-form string, per the redesign note against ad-hoc cache keys. Values
// are type-erased behind `Arc<dyn Any>` so one cache instance can serve every
// category; callers downcast on read.
//
// `get_or_fetch` is genuinely single-flight: a per-key `Mutex<Option<...>>`
// guard ensures concurrent callers for the same key share exactly one
// in-flight future rather than racing independent fetches (the source this
// was distilled from does not actually guarantee this — it's a deliberate
// strengthening to match the documented invariant).

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Ticker,
    MarketSummary,
    VolumeAnalysis,
    Candles,
    Indicators,
    Validation,
    Markets,
}

impl Category {
    fn ttl(self, cfg: &CacheConfig) -> Duration {
        let ttl = match self {
            Self::Ticker => cfg.ticker,
            Self::MarketSummary => cfg.market_summary,
            Self::VolumeAnalysis => cfg.volume_analysis,
            Self::Candles => cfg.candles,
            Self::Indicators => cfg.indicators,
            Self::Validation => cfg.validation,
            Self::Markets => cfg.markets,
        };
        Duration::from_secs(ttl.midpoint())
    }
}

/// `category:identifier[:sorted_kv_params]`, matching the wire-level key
/// format the source uses, but constructed only through this type so
/// free-form collisions can't happen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    category: Category,
    identifier: String,
    params: Vec<(String, String)>,
}

impl CacheKey {
    pub fn new(category: Category, identifier: impl Into<String>, mut params: Vec<(String, String)>) -> Self {
        params.sort();
        Self { category, identifier: identifier.into(), params }
    }
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    created: Instant,
    expires: Instant,
    hits: u64,
    last_access: Instant,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

enum Slot {
    Ready,
    /// A fetch for this key is in flight; waiters subscribe on `notify`.
    Pending(Arc<Notify>),
}

pub struct SmartCache {
    cfg: CacheConfig,
    entries: RwLock<HashMap<CacheKey, Entry>>,
    in_flight: Mutex<HashMap<CacheKey, Slot>>,
    stats: Mutex<CacheStats>,
}

impl SmartCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if entry.expires <= now {
                    drop(entries);
                    self.entries.write().remove(key);
                    self.stats.lock().misses += 1;
                    return None;
                }
            } else {
                self.stats.lock().misses += 1;
                return None;
            }
        }
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key)?;
        entry.hits += 1;
        entry.last_access = now;
        let value = entry.value.clone().downcast::<T>().ok().map(|v| (*v).clone());
        drop(entries);
        let mut stats = self.stats.lock();
        if value.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        value
    }

    pub fn set<T: Clone + Send + Sync + 'static>(&self, key: CacheKey, value: T) {
        let now = Instant::now();
        let expires = now + key.category.ttl(&self.cfg);
        self.ensure_space();
        self.entries.write().insert(
            key,
            Entry {
                value: Arc::new(value),
                created: now,
                expires,
                hits: 0,
                last_access: now,
            },
        );
    }

    fn ensure_space(&self) {
        let mut entries = self.entries.write();
        if entries.len() < self.cfg.max_entries {
            return;
        }
        // Evict the least-recently-accessed entries first.
        let mut by_access: Vec<(CacheKey, Instant)> =
            entries.iter().map(|(k, v)| (k.clone(), v.last_access)).collect();
        by_access.sort_by_key(|(_, last_access)| *last_access);
        let to_evict = entries.len() + 1 - self.cfg.max_entries;
        for (key, _) in by_access.into_iter().take(to_evict) {
            entries.remove(&key);
            self.stats.lock().evictions += 1;
        }
    }

    /// Single-flight get-or-fetch: concurrent callers for the same key
    /// coalesce into exactly one invocation of `fetcher`.
    pub async fn get_or_fetch<T, F, Fut, E>(&self, key: CacheKey, fetcher: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get::<T>(&key) {
            return Ok(value);
        }

        let notify = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(Slot::Pending(notify)) => Some(notify.clone()),
                _ => {
                    in_flight.insert(key.clone(), Slot::Pending(Arc::new(Notify::new())));
                    None
                }
            }
        };

        if let Some(notify) = notify {
            debug!(?key.category, key.identifier, "cache single-flight wait");
            notify.notified().await;
            // The leader populated the cache (or failed, leaving it empty);
            // either way re-check rather than fetch ourselves.
            return match self.get::<T>(&key) {
                Some(value) => Ok(value),
                None => fetcher().await,
            };
        }

        let result = fetcher().await;
        if let Ok(value) = &result {
            self.set(key.clone(), value.clone());
        }
        let notify = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.remove(&key) {
                Some(Slot::Pending(notify)) => Some(notify),
                _ => None,
            }
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        result
    }

    pub fn invalidate(&self, category: Category, identifier: Option<&str>) {
        let mut entries = self.entries.write();
        entries.retain(|k, _| {
            !(k.category == category && identifier.map(|id| id == k.identifier).unwrap_or(true))
        });
    }

    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, v| v.expires > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "cache sweep removed expired entries");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = *self.stats.lock();
        stats.size = self.entries.read().len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cfg() -> CacheConfig {
        CacheConfig::default()
    }

    #[test]
    fn set_then_get_roundtrips() {
        let cache = SmartCache::new(cfg());
        let key = CacheKey::new(Category::Ticker, "BTC/USDT", vec![]);
        cache.set(key.clone(), 42u64);
        assert_eq!(cache.get::<u64>(&key), Some(42));
    }

    #[test]
    fn expired_entry_is_absent() {
        let mut custom = cfg();
        custom.ticker.min_secs = 0;
        custom.ticker.max_secs = 0;
        let cache = SmartCache::new(custom);
        let key = CacheKey::new(Category::Ticker, "BTC/USDT", vec![]);
        cache.set(key.clone(), 1u64);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get::<u64>(&key), None);
    }

    #[tokio::test]
    async fn concurrent_get_or_fetch_invokes_fetcher_once() {
        let cache = Arc::new(SmartCache::new(cfg()));
        let key = CacheKey::new(Category::Candles, "ETH/USDT", vec![]);
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch::<u64, _, _, ()>(key, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(7)
                        }
                    })
                    .await
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&v| v == 7));
    }

    #[test]
    fn key_params_are_order_independent() {
        let a = CacheKey::new(
            Category::Candles,
            "BTC/USDT",
            vec![("tf".into(), "2h".into()), ("limit".into(), "100".into())],
        );
        let b = CacheKey::new(
            Category::Candles,
            "BTC/USDT",
            vec![("limit".into(), "100".into()), ("tf".into(), "2h".into())],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn invalidate_category_wide() {
        let cache = SmartCache::new(cfg());
        let a = CacheKey::new(Category::Ticker, "A", vec![]);
        let b = CacheKey::new(Category::Ticker, "B", vec![]);
        cache.set(a.clone(), 1u64);
        cache.set(b.clone(), 2u64);
        cache.invalidate(Category::Ticker, None);
        assert_eq!(cache.get::<u64>(&a), None);
        assert_eq!(cache.get::<u64>(&b), None);
    }
}
