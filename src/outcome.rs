//! Stable, explicit outcome codes for scan sessions.
//!
//! # Invariants
//! - Reason enums are `#[repr(u8)]` with stable discriminants; new variants
//!   must be appended.
//! - `COUNT` constants must match the last variant + 1.
//! - Counters are fixed arrays indexed by the enum discriminant.
//!
//! # Design Notes
//! - `Status` is the per-object result threaded through handlers. Only
//!   `Clean` and `Virus` ever leave the per-object scan entry point; format
//!   and limit conditions are absorbed where they occur.
//! - `ScanOutcome` is the session-level tri-state handed back to the host.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::MatchRecord;
use crate::error::ErrorKind;
use crate::filetype::FileType;

// -----------------------------
// Reasons (stable taxonomy)
// -----------------------------

/// Which resource ceiling was reached.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitReason {
    /// Nesting depth reached `LimitsConfig::max_recursion`.
    Recursion = 0,
    /// Cumulative scanned bytes reached `LimitsConfig::max_scan_size`.
    ScanSize = 1,
    /// A single object exceeded `LimitsConfig::max_file_size`.
    FileSize = 2,
    /// Number of scanned objects reached `LimitsConfig::max_files`.
    FileCount = 3,
    /// Wall-clock deadline passed.
    Time = 4,
    /// Container too large to look for an embedded executable.
    EmbeddedPe = 5,
    /// Too many embedded objects reported for one object.
    EmbeddedCount = 6,
}

impl LimitReason {
    pub const COUNT: usize = 7;

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Recursion => "recursion",
            Self::ScanSize => "scan_size",
            Self::FileSize => "file_size",
            Self::FileCount => "file_count",
            Self::Time => "time",
            Self::EmbeddedPe => "embedded_pe",
            Self::EmbeddedCount => "embedded_count",
        }
    }

    /// Suffix used for the `Heuristics.Limits.Exceeded.*` family.
    pub const fn heuristic_suffix(self) -> &'static str {
        match self {
            Self::Recursion => "MaxRecursion",
            Self::ScanSize => "MaxScanSize",
            Self::FileSize => "MaxFileSize",
            Self::FileCount => "MaxFiles",
            Self::Time => "MaxScanTime",
            Self::EmbeddedPe => "MaxEmbeddedPE",
            Self::EmbeddedCount => "MaxEmbeddedObjects",
        }
    }
}

/// Why a container entry was not extracted.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntrySkipReason {
    /// Directory entries carry no content.
    Directory = 0,
    /// Declared size would exceed a size ceiling.
    TooLarge = 1,
    /// Entry content is encrypted.
    Encrypted = 2,
    /// The extractor failed on this entry.
    ExtractFailed = 3,
}

impl EntrySkipReason {
    pub const COUNT: usize = 4;

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::TooLarge => "too_large",
            Self::Encrypted => "encrypted",
            Self::ExtractFailed => "extract_failed",
        }
    }
}

/// Recoverable structural error reported by a format handler.
///
/// These never abort a session: the object is treated as "could not be
/// fully analyzed" and downgraded to clean.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatErrorKind {
    /// Header or structure does not parse.
    Malformed = 0,
    /// Input ends before a declared structure does.
    Truncated = 1,
    /// Valid but unsupported feature (method, version, multi-volume).
    Unsupported = 2,
    /// Decompression or decoding failed mid-stream.
    Decode = 3,
    /// Container headers are encrypted and cannot be walked.
    EncryptedHeaders = 4,
    /// Container could not be opened by its extractor.
    Open = 5,
}

impl FormatErrorKind {
    pub const COUNT: usize = 6;

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Truncated => "truncated",
            Self::Unsupported => "unsupported",
            Self::Decode => "decode",
            Self::EncryptedHeaders => "encrypted_headers",
            Self::Open => "open",
        }
    }
}

const LIMIT_REASONS: [LimitReason; LimitReason::COUNT] = [
    LimitReason::Recursion,
    LimitReason::ScanSize,
    LimitReason::FileSize,
    LimitReason::FileCount,
    LimitReason::Time,
    LimitReason::EmbeddedPe,
    LimitReason::EmbeddedCount,
];

const ENTRY_SKIP_REASONS: [EntrySkipReason; EntrySkipReason::COUNT] = [
    EntrySkipReason::Directory,
    EntrySkipReason::TooLarge,
    EntrySkipReason::Encrypted,
    EntrySkipReason::ExtractFailed,
];

const FORMAT_ERROR_KINDS: [FormatErrorKind; FormatErrorKind::COUNT] = [
    FormatErrorKind::Malformed,
    FormatErrorKind::Truncated,
    FormatErrorKind::Unsupported,
    FormatErrorKind::Decode,
    FormatErrorKind::EncryptedHeaders,
    FormatErrorKind::Open,
];

// -----------------------------
// Per-object status
// -----------------------------

/// Result of scanning one object or running one handler.
///
/// `Virus` means "a match was recorded and the aggregation policy asks the
/// caller to stop". In collect-all mode matches are recorded but reported as
/// `Clean` so iteration continues.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Clean,
    Virus,
    Format(FormatErrorKind),
    Limit(LimitReason),
}

impl Status {
    #[inline(always)]
    pub fn is_virus(self) -> bool {
        matches!(self, Status::Virus)
    }

    /// Collapse recoverable conditions into `Clean`.
    #[inline]
    pub fn absorb(self) -> Status {
        match self {
            Status::Virus => Status::Virus,
            _ => Status::Clean,
        }
    }
}

// -----------------------------
// Session outcome
// -----------------------------

/// Session-level verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ScanOutcome {
    Clean,
    /// Carries the most relevant match name.
    Virus(String),
    Error(ErrorKind),
}

impl ScanOutcome {
    #[inline]
    pub fn is_clean(&self) -> bool {
        matches!(self, ScanOutcome::Clean)
    }

    #[inline]
    pub fn is_virus(&self) -> bool {
        matches!(self, ScanOutcome::Virus(_))
    }

    pub fn virus_name(&self) -> Option<&str> {
        match self {
            ScanOutcome::Virus(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Clean => f.write_str("clean"),
            ScanOutcome::Virus(name) => write!(f, "{name} FOUND"),
            ScanOutcome::Error(kind) => write!(f, "error: {}", kind.name()),
        }
    }
}

/// Per-object record, produced only when metadata collection is enabled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectRecord {
    pub depth: u32,
    pub file_type: FileType,
    pub len: u64,
    pub name: Option<String>,
    pub parent_type: FileType,
    /// True when a match was recorded while this object was in scope.
    pub matched: bool,
    /// True when a limit cut this object's analysis short.
    pub degraded: bool,
}

/// Everything a host learns from one top-level scan.
#[derive(Clone, Debug, Serialize)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    /// Number of matches recorded (after any hook retractions).
    pub match_count: u32,
    pub matches: Vec<MatchRecord>,
    /// Cumulative bytes charged against `max_scan_size`.
    pub bytes_scanned: u64,
    /// A resource limit cut part of the scan short.
    pub limits_exceeded: bool,
    /// A non-precedence heuristic fired.
    pub possibly_unwanted: bool,
    pub stats: ScanStats,
    pub objects: Vec<ObjectRecord>,
}

impl ScanReport {
    /// Report for an object rejected before a session was created.
    pub(crate) fn clean_unscanned(limits_exceeded: bool) -> Self {
        Self {
            outcome: ScanOutcome::Clean,
            match_count: 0,
            matches: Vec::new(),
            bytes_scanned: 0,
            limits_exceeded,
            possibly_unwanted: false,
            stats: ScanStats::default(),
            objects: Vec::new(),
        }
    }
}

// -----------------------------
// Counters
// -----------------------------

/// Session counters with stable reason tables.
///
/// # Invariants
/// - Arrays are indexed by the stable reason discriminants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub objects_scanned: u64,
    pub handlers_invoked: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_stores: u64,
    pub entries_seen: u64,
    pub entries_extracted: u64,
    pub bytes_extracted: u64,
    pub embedded_found: u64,
    pub max_depth: u32,

    pub entry_skip_reasons: [u64; EntrySkipReason::COUNT],
    pub format_errors: [u64; FormatErrorKind::COUNT],
    pub limit_hits: [u64; LimitReason::COUNT],
}

impl ScanStats {
    #[inline]
    pub fn record_object(&mut self, depth: u32) {
        self.objects_scanned = self.objects_scanned.wrapping_add(1);
        self.max_depth = self.max_depth.max(depth);
    }

    #[inline]
    pub fn record_entry_skipped(&mut self, reason: EntrySkipReason) {
        let slot = &mut self.entry_skip_reasons[reason.as_usize()];
        *slot = slot.wrapping_add(1);
    }

    #[inline]
    pub fn record_format_error(&mut self, kind: FormatErrorKind) {
        let slot = &mut self.format_errors[kind.as_usize()];
        *slot = slot.wrapping_add(1);
    }

    #[inline]
    pub fn record_limit(&mut self, reason: LimitReason) {
        let slot = &mut self.limit_hits[reason.as_usize()];
        *slot = slot.wrapping_add(1);
    }

    #[inline]
    pub fn entries_skipped(&self, reason: EntrySkipReason) -> u64 {
        self.entry_skip_reasons[reason.as_usize()]
    }

    #[inline]
    pub fn limit_hits(&self, reason: LimitReason) -> u64 {
        self.limit_hits[reason.as_usize()]
    }

    #[inline]
    pub fn format_errors(&self, kind: FormatErrorKind) -> u64 {
        self.format_errors[kind.as_usize()]
    }

    /// Render a compact reason table for diagnostics/debug output.
    pub fn fmt_reason_table(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "limit_hits:")?;
        for r in LIMIT_REASONS.iter() {
            let n = self.limit_hits[r.as_usize()];
            if n != 0 {
                writeln!(f, "  {}={}", r.name(), n)?;
            }
        }

        writeln!(f, "entry_skip_reasons:")?;
        for r in ENTRY_SKIP_REASONS.iter() {
            let n = self.entry_skip_reasons[r.as_usize()];
            if n != 0 {
                writeln!(f, "  {}={}", r.name(), n)?;
            }
        }

        writeln!(f, "format_errors:")?;
        for k in FORMAT_ERROR_KINDS.iter() {
            let n = self.format_errors[k.as_usize()];
            if n != 0 {
                writeln!(f, "  {}={}", k.name(), n)?;
            }
        }
        if self.cache_hits != 0 {
            writeln!(f, "cache_hits={}", self.cache_hits)?;
        }
        Ok(())
    }
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "objects={} handlers={} extracted={} ({} bytes) max_depth={}",
            self.objects_scanned,
            self.handlers_invoked,
            self.entries_extracted,
            self.bytes_extracted,
            self.max_depth
        )?;
        self.fmt_reason_table(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_match_variant_space() {
        assert_eq!(LimitReason::COUNT, LimitReason::EmbeddedCount as usize + 1);
        assert_eq!(
            EntrySkipReason::COUNT,
            EntrySkipReason::ExtractFailed as usize + 1
        );
        assert_eq!(FormatErrorKind::COUNT, FormatErrorKind::Open as usize + 1);
    }

    #[test]
    fn reason_arrays_match_discriminants() {
        for r in LIMIT_REASONS.iter() {
            assert_eq!(LIMIT_REASONS[r.as_usize()], *r);
        }
        for r in ENTRY_SKIP_REASONS.iter() {
            assert_eq!(ENTRY_SKIP_REASONS[r.as_usize()], *r);
        }
        for k in FORMAT_ERROR_KINDS.iter() {
            assert_eq!(FORMAT_ERROR_KINDS[k.as_usize()], *k);
        }
    }

    #[test]
    fn absorb_keeps_only_virus() {
        assert_eq!(Status::Virus.absorb(), Status::Virus);
        assert_eq!(Status::Format(FormatErrorKind::Malformed).absorb(), Status::Clean);
        assert_eq!(Status::Limit(LimitReason::ScanSize).absorb(), Status::Clean);
    }

    #[test]
    fn reason_table_lists_only_nonzero_counters() {
        struct Table(ScanStats);
        impl fmt::Display for Table {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt_reason_table(f)
            }
        }

        let mut stats = ScanStats::default();
        stats.record_limit(LimitReason::ScanSize);
        stats.record_entry_skipped(EntrySkipReason::Encrypted);
        let rendered = Table(stats).to_string();
        assert!(rendered.contains("scan_size=1"));
        assert!(rendered.contains("encrypted=1"));
        assert!(!rendered.contains("recursion="));
    }
}
