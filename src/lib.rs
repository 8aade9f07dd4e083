//! Recursive, resource-bounded scan dispatch for nested content inspection.
//!
//! ## Scope
//! This crate decides, for every object handed to it, what to look at and in
//! what order: detect the type, consult the clean-result cache, run the
//! type-specific handler (which may unpack entries and recurse), run the raw
//! signature pass, then look for objects embedded at offsets inside the raw
//! bytes. Signature engines, type detectors and format decoders are
//! collaborators behind traits; a small built-in set covers gzip, tar and zip.
//!
//! ## Key invariants
//! - Recursion depth never exceeds `max_recursion`; exceeding it stops descent
//!   without an error.
//! - Every push onto a container/view stack is popped on every exit path, and
//!   every temp resource is released when its scope unwinds.
//! - A "clean" result is cached only when nothing matched in its scope and no
//!   limit cut any part of it short.
//! - Verdicts are not errors; structural format problems are recovered from;
//!   only out-of-memory, temp-storage and deadline failures abort a session.
//!
//! ## Session flow
//! `Engine::scan_* -> ScanContext::scan_view -> Handler (extract loop) ->
//! scan_view (nested) ... -> raw pass -> embedded objects -> ScanReport`
//!
//! ## Notable entry points
//! - [`Engine`] / [`EngineBuilder`]: shared, immutable engine.
//! - [`ScanContext`]: per-session state, used by handlers to recurse.
//! - [`Handler`], [`EntryIterator`]: format-handler contracts.
//! - [`TypeDetector`], [`SignatureMatcher`], [`ScanHooks`]: collaborators.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod container;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod extract;
pub mod filetype;
pub mod formats;
pub mod hooks;
pub mod limits;
pub mod outcome;
pub mod signature;
pub mod tempstore;
pub mod view;

pub use aggregate::{MatchKind, MatchMode, MatchRecord};
pub use cache::{CacheKey, ResultCache};
pub use config::{CacheConfig, ConfigError, EngineConfig, LimitsConfig, ScanOptions};
pub use context::ScanContext;
pub use dispatch::{Handler, Phase, TypeDispatcher};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorKind, ScanError};
pub use extract::{run_extraction_loop, Comment, EntryHeader, EntryIterator, Step};
pub use filetype::{EmbeddedObject, Family, FamilySet, FileType, MagicDetector, TypeDetector};
pub use hooks::{HookVerdict, NoHooks, ObjectInfo, ScanHooks};
pub use outcome::{
    EntrySkipReason, FormatErrorKind, LimitReason, ObjectRecord, ScanOutcome, ScanReport,
    ScanStats, Status,
};
pub use signature::{Anchor, EntryMetadata, MetadataRule, PatternMatcher, SignatureMatcher};
pub use view::ByteView;
