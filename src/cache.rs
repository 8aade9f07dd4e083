//! Clean-result cache shared by all sessions of an engine.
//!
//! # Invariants
//! - Only "scanned completely and found clean" is ever memoized. There is no
//!   negative entry: a miss means "scan it".
//! - Keys are a BLAKE3 digest of the full object plus its length; digest
//!   collisions are an accepted risk.
//! - Concurrent `store` of the same key is idempotent.
//!
//! # Algorithm
//! - The key's first digest word selects a shard; each shard is a
//!   `Mutex`-protected set with FIFO eviction once it reaches its share of
//!   the configured capacity.
//!
//! # Design Notes
//! - Sharding keeps lock hold times short when many sessions finish objects
//!   at once. Each lookup holds one shard lock for a single hash probe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use ahash::AHashSet;

use crate::config::CacheConfig;

/// Digest-plus-length identity of an object's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: [u8; 32],
    len: u64,
}

impl CacheKey {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            digest: *blake3::hash(bytes).as_bytes(),
            len: bytes.len() as u64,
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    #[inline(always)]
    fn shard_word(&self) -> u64 {
        u64::from_le_bytes([
            self.digest[0],
            self.digest[1],
            self.digest[2],
            self.digest[3],
            self.digest[4],
            self.digest[5],
            self.digest[6],
            self.digest[7],
        ])
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey(")?;
        for b in &self.digest[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…, len={})", self.len)
    }
}

/// Result of a cache probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    HitClean,
    Miss,
}

struct Shard {
    set: AHashSet<CacheKey>,
    order: VecDeque<CacheKey>,
}

/// Counters exported for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
}

/// Concurrent clean-result cache.
pub struct ResultCache {
    enabled: bool,
    shards: Box<[Mutex<Shard>]>,
    shard_mask: u64,
    per_shard: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    /// Build a cache from validated configuration.
    ///
    /// `cfg.shards` is assumed to be a nonzero power of two (enforced by
    /// `EngineConfig::validate`); other values are rounded up.
    pub fn new(cfg: &CacheConfig) -> Self {
        let shards = cfg.shards.max(1).next_power_of_two();
        let per_shard = (cfg.capacity / shards).max(1);
        let shards: Box<[Mutex<Shard>]> = (0..shards)
            .map(|_| {
                Mutex::new(Shard {
                    set: AHashSet::with_capacity(per_shard.min(1024)),
                    order: VecDeque::with_capacity(per_shard.min(1024)),
                })
            })
            .collect();
        Self {
            enabled: cfg.enabled,
            shard_mask: (shards.len() - 1) as u64,
            shards,
            per_shard,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A cache that never hits and never stores.
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            enabled: false,
            capacity: 1,
            shards: 1,
        })
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn shard(&self, key: &CacheKey) -> MutexGuard<'_, Shard> {
        let idx = (key.shard_word() & self.shard_mask) as usize;
        // A poisoned shard only means another session panicked mid-insert;
        // the set is still structurally valid.
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn check(&self, key: &CacheKey) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }
        let hit = self.shard(key).set.contains(key);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            CacheLookup::HitClean
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            CacheLookup::Miss
        }
    }

    /// Memoize `key` as clean. Returns true if it was newly inserted.
    pub fn store(&self, key: CacheKey) -> bool {
        if !self.enabled {
            return false;
        }
        let mut shard = self.shard(&key);
        if !shard.set.insert(key) {
            return false;
        }
        shard.order.push_back(key);
        while shard.order.len() > self.per_shard {
            if let Some(old) = shard.order.pop_front() {
                shard.set.remove(&old);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(shard);
        self.stores.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop every entry (e.g. after the signature set changes).
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock().unwrap_or_else(|p| p.into_inner());
            shard.set.clear();
            shard.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).set.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.enabled)
            .field("shards", &self.shards.len())
            .field("per_shard", &self.per_shard)
            .field("counters", &self.counters())
            .finish()
    }
}
