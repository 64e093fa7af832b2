//! 模块共享缓存
//!
//! 按 `模块:键` 存储 JSON 值，支持过期时间和容量上限（淘汰最久未访问的条目）

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 缓存提供者
pub trait CacheProvider: Send + Sync {
    /// 读取缓存值，过期视为未命中
    fn get(&self, module: &str, key: &str) -> Option<Value>;

    /// 写入缓存值，`ttl` 为空时使用默认过期时间
    fn set(&self, module: &str, key: &str, value: Value, ttl: Option<Duration>);

    /// 删除单个键，或在 `key` 为空时删除该模块全部条目
    fn invalidate(&self, module: &str, key: Option<&str>);

    /// 统计信息
    fn statistics(&self) -> CacheStatistics;
}

/// 缓存统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStatistics {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
    last_access: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// 内存缓存
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn cache_key(module: &str, key: &str) -> String {
        format!("{}:{}", module, key)
    }

    /// 清理已过期条目
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    fn evict_lru(&self) {
        let oldest = self.entries.iter()
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(1024, Some(Duration::from_secs(3600)))
    }
}

impl CacheProvider for MemoryCache {
    fn get(&self, module: &str, key: &str) -> Option<Value> {
        let cache_key = Self::cache_key(module, key);
        let now = Instant::now();

        let found = match self.entries.get_mut(&cache_key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => None,
        };

        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.entries.remove_if(&cache_key, |_, entry| entry.is_expired(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, module: &str, key: &str, value: Value, ttl: Option<Duration>) {
        let cache_key = Self::cache_key(module, key);
        let now = Instant::now();

        if !self.entries.contains_key(&cache_key) && self.entries.len() >= self.max_entries {
            self.cleanup_expired();
            while self.entries.len() >= self.max_entries {
                self.evict_lru();
            }
        }

        let ttl = ttl.or(self.default_ttl);
        self.entries.insert(cache_key, CacheEntry {
            value,
            expires_at: ttl.map(|d| now + d),
            last_access: now,
        });
    }

    fn invalidate(&self, module: &str, key: Option<&str>) {
        match key {
            Some(key) => {
                self.entries.remove(&Self::cache_key(module, key));
            }
            None => {
                let prefix = format!("{}:", module);
                self.entries.retain(|k, _| !k.starts_with(&prefix));
            }
        }
    }

    fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
