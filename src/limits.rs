//! Session-wide resource accounting.
//!
//! # Invariants
//! - Accounting is saturating; the scanned-bytes counter never exceeds the
//!   configured ceiling.
//! - A limit of `0` disables that check (except recursion, which config
//!   validation forces nonzero).
//! - The deadline is computed once, at construction.
//!
//! # Algorithm
//! - `check(need)` is a pure probe: deadline first, then cumulative scan
//!   size, per-object size, and object count.
//! - `update(need)` probes and, only when within bounds, charges one object
//!   of `need` bytes.
//!
//! # Design Notes
//! - The limiter does not know about the container stack; depth is passed
//!   in by the caller so the check can run before any frame is pushed.
//! - Soft hits are remembered (`limits_exceeded`) so the session can
//!   report "clean, but incomplete".

use std::time::{Duration, Instant};

use crate::config::LimitsConfig;
use crate::outcome::LimitReason;

/// Classification of a limit probe.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitCheck {
    /// Continue.
    Within,
    /// Stop this branch, keep what was found, unwind normally.
    Soft(LimitReason),
    /// Abort the session.
    Hard(LimitReason),
}

impl LimitCheck {
    #[inline(always)]
    pub fn is_within(self) -> bool {
        matches!(self, LimitCheck::Within)
    }
}

/// Tracker for one session's resource usage.
#[derive(Clone, Debug)]
pub struct ResourceLimiter {
    // caps
    max_recursion: u32,
    max_scan_size: u64,
    max_file_size: u64,
    max_files: u32,
    deadline: Option<Instant>,

    // counters
    scanned: u64,
    files: u32,
    exceeded: bool,
}

impl ResourceLimiter {
    /// Start accounting; the deadline is `start + max_scan_time_ms`.
    pub fn new(cfg: &LimitsConfig, start: Instant) -> Self {
        let deadline = (cfg.max_scan_time_ms != 0)
            .then(|| start.checked_add(Duration::from_millis(cfg.max_scan_time_ms)))
            .flatten();
        Self {
            max_recursion: cfg.max_recursion,
            max_scan_size: cfg.max_scan_size,
            max_file_size: cfg.max_file_size,
            max_files: cfg.max_files,
            deadline,
            scanned: 0,
            files: 0,
            exceeded: false,
        }
    }

    /// Replace the deadline (hosts with an external budget; tests).
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    #[inline]
    pub fn max_recursion(&self) -> u32 {
        self.max_recursion
    }

    /// Probe before doing any work at `depth`.
    #[inline]
    pub fn check_depth(&self, depth: u32) -> LimitCheck {
        if depth > self.max_recursion {
            LimitCheck::Soft(LimitReason::Recursion)
        } else {
            LimitCheck::Within
        }
    }

    /// At the deepest allowed level only a raw pass runs; nothing descends.
    #[inline]
    pub fn at_max_depth(&self, depth: u32) -> bool {
        depth >= self.max_recursion
    }

    #[inline]
    pub fn check_time(&self) -> LimitCheck {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => LimitCheck::Hard(LimitReason::Time),
            _ => LimitCheck::Within,
        }
    }

    /// Probe whether an object of `need` bytes may be scanned.
    ///
    /// `need == 0` only checks the cumulative and count ceilings.
    pub fn check(&self, need: u64) -> LimitCheck {
        let time = self.check_time();
        if !time.is_within() {
            return time;
        }
        if self.max_scan_size != 0 {
            if self.scanned >= self.max_scan_size {
                return LimitCheck::Soft(LimitReason::ScanSize);
            }
            if need != 0 && self.scanned.saturating_add(need) > self.max_scan_size {
                return LimitCheck::Soft(LimitReason::ScanSize);
            }
        }
        if self.max_file_size != 0 && need > self.max_file_size {
            return LimitCheck::Soft(LimitReason::FileSize);
        }
        if self.max_files != 0 && self.files >= self.max_files {
            return LimitCheck::Soft(LimitReason::FileCount);
        }
        LimitCheck::Within
    }

    /// Probe and, when within bounds, charge one object of `need` bytes.
    pub fn update(&mut self, need: u64) -> LimitCheck {
        let check = self.check(need);
        if !check.is_within() {
            return check;
        }
        self.files = self.files.saturating_add(1);
        self.scanned = self.scanned.saturating_add(need);
        if self.max_scan_size != 0 && self.scanned > self.max_scan_size {
            self.scanned = self.max_scan_size;
        }
        LimitCheck::Within
    }

    /// Remember that some limit cut the scan short.
    #[inline]
    pub fn note_exceeded(&mut self) {
        self.exceeded = true;
    }

    #[inline]
    pub fn limits_exceeded(&self) -> bool {
        self.exceeded
    }

    /// Bytes an extractor may still produce for one entry.
    pub fn entry_allowance(&self) -> u64 {
        let by_scan = if self.max_scan_size == 0 {
            u64::MAX
        } else {
            self.max_scan_size.saturating_sub(self.scanned)
        };
        let by_file = if self.max_file_size == 0 {
            u64::MAX
        } else {
            self.max_file_size
        };
        by_scan.min(by_file)
    }

    /// Which ceiling `entry_allowance` is bound by.
    pub fn allowance_reason(&self) -> LimitReason {
        let by_scan = self.max_scan_size.saturating_sub(self.scanned);
        if self.max_file_size != 0 && (self.max_scan_size == 0 || self.max_file_size <= by_scan) {
            LimitReason::FileSize
        } else {
            LimitReason::ScanSize
        }
    }

    /// Cumulative scan size has reached its ceiling.
    #[inline]
    pub fn scan_budget_exhausted(&self) -> bool {
        self.max_scan_size != 0 && self.scanned >= self.max_scan_size
    }

    #[inline]
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    #[inline]
    pub fn files(&self) -> u32 {
        self.files
    }
}
