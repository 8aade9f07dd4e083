//! Engine configuration and hard limits.
//!
//! # Invariants
//! - All limits are hard bounds and must be internally consistent.
//! - Scan input is hostile: sizes, counts, and nesting are untrusted.
//! - A limit of `0` means "unlimited", except `max_recursion`, which is the
//!   stack-safety backstop and must always be set.
//!
//! # Design Notes
//! - Defaults are safety-first and match common antivirus engine defaults.
//! - `ScanOptions` is the per-session part of the configuration; the engine
//!   holds a default copy and callers may override it per scan.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::MatchMode;
use crate::filetype::FamilySet;

/// Upper bound on `max_recursion`. Each level costs a few native stack
/// frames; hosts running sessions on small worker stacks should stay well
/// below this.
pub const MAX_RECURSION_CEILING: u32 = 255;

/// Resource ceilings enforced by `ResourceLimiter`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum nesting depth; objects at this depth only get a raw pass.
    pub max_recursion: u32,
    /// Maximum cumulative bytes charged per session.
    pub max_scan_size: u64,
    /// Maximum size of a single object (top-level or extracted).
    pub max_file_size: u64,
    /// Maximum number of objects scanned per session.
    pub max_files: u32,
    /// Wall-clock budget per session, in milliseconds.
    pub max_scan_time_ms: u64,
    /// Largest container searched for embedded executables.
    pub max_embedded_pe: u64,
    /// Maximum embedded objects followed per object.
    pub max_embedded_objects: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_recursion: 17,
            max_scan_size: 400 * 1024 * 1024,
            max_file_size: 100 * 1024 * 1024,
            max_files: 10_000,
            max_scan_time_ms: 120_000,
            max_embedded_pe: 40 * 1024 * 1024,
            max_embedded_objects: 64,
        }
    }
}

/// Per-session behavior switches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub match_mode: MatchMode,
    /// Heuristic matches halt the branch like signature matches.
    pub prefer_heuristics: bool,
    /// Produce per-object records; disables the result cache.
    pub collect_metadata: bool,
    /// Keep the session temp tree and every extracted file.
    pub retain_temps: bool,
    /// Always materialize extracted entries on disk.
    pub force_to_disk: bool,
    /// Report containers with encrypted content as `Heuristics.Encrypted.*`.
    pub alert_encrypted: bool,
    /// Report limit hits as `Heuristics.Limits.Exceeded.*`.
    pub alert_exceeds_max: bool,
    /// Skip type handlers entirely; only the raw signature pass runs.
    pub raw_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            match_mode: MatchMode::StopOnFirst,
            prefer_heuristics: false,
            collect_metadata: false,
            retain_temps: false,
            force_to_disk: false,
            alert_encrypted: false,
            alert_exceeds_max: false,
            raw_only: false,
        }
    }
}

impl ScanOptions {
    /// Whether cache lookups and stores are allowed for this session.
    #[inline]
    pub fn cache_allowed(&self) -> bool {
        !self.collect_metadata
    }

    /// Whether extracted entries must be written to disk.
    #[inline]
    pub fn spill_to_disk(&self) -> bool {
        self.force_to_disk || self.retain_temps
    }
}

/// Result cache sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Total entries across all shards.
    pub capacity: usize,
    /// Lock shards; must be a nonzero power of two.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 65_536,
            shards: 16,
        }
    }
}

/// Immutable configuration shared by every session of an engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: LimitsConfig,
    /// Enabled handler families.
    pub families: FamilySet,
    /// Default per-session options.
    pub options: ScanOptions,
    pub cache: CacheConfig,
    /// Parent of per-session temp directories; the system temp dir if unset.
    pub temp_dir: Option<PathBuf>,
}

/// Validation error returned by `EngineConfig::validate`.
///
/// Callers should treat this as a configuration bug (not hostile input).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_recursion must be > 0")]
    MaxRecursionZero,
    #[error("max_recursion must be <= {ceiling} (got {value})")]
    MaxRecursionTooDeep { value: u32, ceiling: u32 },
    #[error(
        "max_scan_size must be >= max_file_size (file={max_file_size}, scan={max_scan_size})"
    )]
    ScanSizeBelowFileSize {
        max_file_size: u64,
        max_scan_size: u64,
    },
    #[error("cache shards must be a nonzero power of two (got {0})")]
    CacheShards(usize),
    #[error("cache capacity must be >= shard count (capacity={capacity}, shards={shards})")]
    CacheCapacityTooSmall { capacity: usize, shards: usize },
    #[error("temp_dir {0} is not a directory")]
    TempDirMissing(PathBuf),
}

impl EngineConfig {
    /// Validate cross-field invariants.
    ///
    /// Cheap; call once at engine construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.max_recursion == 0 {
            return Err(ConfigError::MaxRecursionZero);
        }
        if limits.max_recursion > MAX_RECURSION_CEILING {
            return Err(ConfigError::MaxRecursionTooDeep {
                value: limits.max_recursion,
                ceiling: MAX_RECURSION_CEILING,
            });
        }
        if limits.max_scan_size != 0
            && limits.max_file_size != 0
            && limits.max_scan_size < limits.max_file_size
        {
            return Err(ConfigError::ScanSizeBelowFileSize {
                max_file_size: limits.max_file_size,
                max_scan_size: limits.max_scan_size,
            });
        }
        if self.cache.enabled {
            if self.cache.shards == 0 || !self.cache.shards.is_power_of_two() {
                return Err(ConfigError::CacheShards(self.cache.shards));
            }
            if self.cache.capacity < self.cache.shards {
                return Err(ConfigError::CacheCapacityTooSmall {
                    capacity: self.cache.capacity,
                    shards: self.cache.shards,
                });
            }
        }
        if let Some(dir) = &self.temp_dir {
            if !dir.is_dir() {
                return Err(ConfigError::TempDirMissing(dir.clone()));
            }
        }
        Ok(())
    }

    /// Directory under which session temp trees are created.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
