//! Match aggregation policy.
//!
//! # Invariants
//! - Every recorded match increments the count exactly once; retraction
//!   (host whitelisting) only removes matches recorded after a mark.
//! - `record` returns `Status::Virus` exactly when the caller must stop:
//!   always in stop-on-first mode for definite matches, never in
//!   collect-all mode.
//!
//! # Algorithm
//! - Signature match: record, halt in stop-on-first mode.
//! - Heuristic match with precedence (or in collect-all mode): same as a
//!   signature match.
//! - Heuristic match without precedence in stop-on-first mode: record as
//!   "possibly unwanted" and keep scanning, so a later definite match can
//!   replace it as the reported name.

use serde::{Deserialize, Serialize};

use crate::filetype::FileType;
use crate::outcome::Status;

/// Aggregation mode, fixed for a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchMode {
    #[default]
    StopOnFirst,
    CollectAll,
}

/// Origin of a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum MatchKind {
    /// Content or metadata signature.
    Signature,
    /// Synthesized detection (encrypted archive, limits exceeded, ...).
    Heuristic,
}

/// One recorded match and where it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    pub name: String,
    pub kind: MatchKind,
    /// Nesting depth of the object that produced the match.
    pub depth: u32,
    /// Type of the object that produced the match.
    pub file_type: FileType,
}

/// Position in the match log, used to scope per-object decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchMark(usize);

/// Running match state for one session.
#[derive(Clone, Debug)]
pub struct MatchAggregator {
    mode: MatchMode,
    prefer_heuristics: bool,
    records: Vec<MatchRecord>,
    possibly_unwanted: bool,
}

impl MatchAggregator {
    pub fn new(mode: MatchMode, prefer_heuristics: bool) -> Self {
        Self {
            mode,
            prefer_heuristics,
            records: Vec::new(),
            possibly_unwanted: false,
        }
    }

    #[inline]
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    #[inline(always)]
    fn halt(&self) -> Status {
        match self.mode {
            MatchMode::StopOnFirst => Status::Virus,
            MatchMode::CollectAll => Status::Clean,
        }
    }

    /// Record a match and return whether the caller must stop.
    pub fn record(&mut self, rec: MatchRecord) -> Status {
        let defer = rec.kind == MatchKind::Heuristic
            && !self.prefer_heuristics
            && self.mode == MatchMode::StopOnFirst;
        self.records.push(rec);
        if defer {
            self.possibly_unwanted = true;
            return Status::Clean;
        }
        self.halt()
    }

    #[inline]
    pub fn mark(&self) -> MatchMark {
        MatchMark(self.records.len())
    }

    /// Any match recorded after `mark`?
    #[inline]
    pub fn matched_since(&self, mark: MatchMark) -> bool {
        self.records.len() > mark.0
    }

    /// Any signature (not heuristic) match recorded after `mark`?
    pub fn signature_since(&self, mark: MatchMark) -> bool {
        self.records
            .get(mark.0..)
            .is_some_and(|recs| recs.iter().any(|r| r.kind == MatchKind::Signature))
    }

    /// Forget matches recorded after `mark`.
    pub fn retract_to(&mut self, mark: MatchMark) {
        self.records.truncate(mark.0);
        self.possibly_unwanted = self
            .records
            .iter()
            .any(|r| r.kind == MatchKind::Heuristic)
            && self.possibly_unwanted;
    }

    #[inline]
    pub fn count(&self) -> u32 {
        u32::try_from(self.records.len()).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn possibly_unwanted(&self) -> bool {
        self.possibly_unwanted
    }

    /// The match to report: the last definite signature match, else the
    /// last heuristic one.
    pub fn primary(&self) -> Option<&MatchRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.kind == MatchKind::Signature)
            .or_else(|| self.records.last())
    }

    pub fn records(&self) -> &[MatchRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<MatchRecord> {
        self.records
    }
}
