//! Per-session scan state and the recursive per-object state machine.
//!
//! # Scope
//! - One `ScanContext` per top-level scan; it owns the container stack, the
//!   view stack, the resource limiter, the match aggregator, the session
//!   temp tree and the counters. The engine it borrows is shared and
//!   read-only.
//!
//! # Invariants
//! - Recursion depth (`ContainerStack::depth`) is checked before any work on
//!   a new object and never exceeds `max_recursion`.
//! - Every push onto the container or view stack is popped before
//!   `scan_view` returns, on success and on error.
//! - Format and limit conditions never leave `scan_view`; only `Clean`,
//!   `Virus` and fatal `Err`s do.
//! - A result is memoized only when it is clean, nothing matched in its
//!   scope, and no limit cut any part of it short.
//!
//! # Algorithm (`scan_view`)
//! 1. Depth check and tiny-object check, before anything else.
//! 2. Resolve the type: a non-generic hint wins, else detection on the head.
//! 3. `pre_cache` hook, then the result cache.
//! 4. Charge the object to the limiter (deadline expiry is fatal, other
//!    ceilings are soft).
//! 5. `pre_scan` hook, then either a raw-only pass (raw mode or maximum
//!    depth) or: container-phase handler, raw pass with recognition,
//!    post-raw handler, all inside one pushed container frame.
//! 6. `post_scan` hook, cache store, per-object record.

use std::io::Write;
use std::path::Path;

use crate::aggregate::{MatchAggregator, MatchKind, MatchMode, MatchRecord};
use crate::cache::{CacheKey, CacheLookup};
use crate::config::ScanOptions;
use crate::container::{ContainerFrame, ContainerStack};
use crate::dispatch::{embedded_decision, EmbeddedDecision, Handler, Phase};
use crate::engine::Engine;
use crate::error::ScanError;
use crate::filetype::{EmbeddedObject, FileType, DETECT_HEAD_LEN};
use crate::hooks::{HookVerdict, ObjectInfo, CALLBACK_DETECTION};
use crate::limits::{LimitCheck, ResourceLimiter};
use crate::outcome::{LimitReason, ObjectRecord, ScanOutcome, ScanReport, ScanStats, Status};
use crate::signature::EntryMetadata;
use crate::tempstore::{EntrySink, MaterializedEntry, SessionTemp};
use crate::view::ByteView;

/// Objects this small are never worth dispatching.
pub const MIN_SCAN_LEN: usize = 5;

enum CacheProbe {
    Hit,
    Miss(CacheKey),
    Off,
}

struct ViewFrame {
    view: ByteView,
    file_type: FileType,
    cacheable: bool,
    degraded: bool,
}

/// Mutable state of one scan session.
pub struct ScanContext<'e> {
    engine: &'e Engine,
    options: ScanOptions,
    containers: ContainerStack,
    views: Vec<ViewFrame>,
    limiter: ResourceLimiter,
    matches: MatchAggregator,
    temp: SessionTemp,
    stats: ScanStats,
    objects: Vec<ObjectRecord>,
    limit_alerted: [bool; LimitReason::COUNT],
    sig_scratch: Vec<String>,
}

impl<'e> ScanContext<'e> {
    /// Start a session; creates the session temp directory.
    pub fn new(
        engine: &'e Engine,
        options: ScanOptions,
        basename: Option<&str>,
    ) -> Result<Self, ScanError> {
        let cfg = engine.config();
        let temp = SessionTemp::create(&cfg.temp_root(), basename, options.retain_temps)?;
        let limiter = ResourceLimiter::new(&cfg.limits, std::time::Instant::now());
        Ok(Self {
            engine,
            containers: ContainerStack::new(cfg.limits.max_recursion),
            views: Vec::with_capacity(cfg.limits.max_recursion as usize + 1),
            limiter,
            matches: MatchAggregator::new(options.match_mode, options.prefer_heuristics),
            temp,
            stats: ScanStats::default(),
            objects: Vec::new(),
            limit_alerted: [false; LimitReason::COUNT],
            sig_scratch: Vec::new(),
            options,
        })
    }

    /// Replace the limiter (external deadline, tests).
    #[must_use]
    pub fn with_limiter(mut self, limiter: ResourceLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    // -----------------------------
    // Accessors
    // -----------------------------

    #[inline]
    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    #[inline]
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    #[inline]
    pub fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }

    #[inline]
    pub fn matches(&self) -> &MatchAggregator {
        &self.matches
    }

    #[inline]
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    #[inline]
    pub fn stats_mut(&mut self) -> &mut ScanStats {
        &mut self.stats
    }

    #[inline]
    pub fn temp(&self) -> &SessionTemp {
        &self.temp
    }

    /// Current recursion depth.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.containers.depth()
    }

    /// Type of the container whose children are being scanned.
    #[inline]
    pub fn parent_type(&self) -> FileType {
        self.containers.parent_type()
    }

    pub fn containers(&self) -> &ContainerStack {
        &self.containers
    }

    /// The object being scanned right now.
    pub fn current_view(&self) -> Option<&ByteView> {
        self.views.last().map(|f| &f.view)
    }

    /// Nesting depth of the object being scanned right now (0 = top level).
    #[inline]
    fn object_depth(&self) -> u32 {
        u32::try_from(self.views.len().saturating_sub(1)).unwrap_or(u32::MAX)
    }

    /// Type of the object being scanned right now.
    pub fn current_type(&self) -> FileType {
        self.views.last().map_or(FileType::Any, |f| f.file_type)
    }

    // -----------------------------
    // Entry points
    // -----------------------------

    /// Scan one object (top-level or nested).
    pub fn scan_view(&mut self, view: &ByteView, hint: FileType) -> Result<Status, ScanError> {
        let depth = self.containers.depth();
        if let LimitCheck::Soft(reason) = self.limiter.check_depth(depth) {
            return Ok(self.note_limit(reason));
        }
        if view.len() <= MIN_SCAN_LEN {
            return Ok(Status::Clean);
        }
        self.check_time()?;

        let file_type = self.resolve_type(view, hint);
        let parent = self.containers.parent_type();
        let hooks = self.engine.hooks();
        let info = ObjectInfo {
            file_type,
            len: view.len() as u64,
            depth,
            name: view.name(),
            parent_type: parent,
            head: view.head(DETECT_HEAD_LEN),
        };

        match hooks.pre_cache(&info) {
            HookVerdict::Proceed => {}
            HookVerdict::Whitelist => return Ok(Status::Clean),
            HookVerdict::Blacklist => return Ok(self.report_callback(file_type)),
        }

        let cache_key = match self.cache_probe(view) {
            CacheProbe::Hit => return Ok(Status::Clean),
            CacheProbe::Miss(key) => Some(key),
            CacheProbe::Off => None,
        };

        match self.limiter.update(view.len() as u64) {
            LimitCheck::Within => {}
            LimitCheck::Soft(reason) => return Ok(self.note_limit(reason)),
            LimitCheck::Hard(_) => return Err(ScanError::Timeout),
        }
        self.stats.record_object(depth);

        let mark = self.matches.mark();
        self.views.push(ViewFrame {
            view: view.clone(),
            file_type,
            cacheable: true,
            degraded: false,
        });
        let result = match hooks.pre_scan(&info) {
            HookVerdict::Proceed => self.scan_typed(view, file_type, parent),
            HookVerdict::Whitelist => Ok(Status::Clean),
            HookVerdict::Blacklist => Ok(self.report_callback(file_type)),
        };
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                self.views.pop();
                return Err(e);
            }
        };

        let matched = self.matches.matched_since(mark);
        let (status, vetted) = match hooks.post_scan(&info, status, matched) {
            HookVerdict::Proceed => (status, true),
            HookVerdict::Whitelist => {
                self.matches.retract_to(mark);
                (Status::Clean, false)
            }
            HookVerdict::Blacklist if status.is_virus() => (status, false),
            HookVerdict::Blacklist => (self.report_callback(file_type), false),
        };

        let frame = self.views.pop();
        let (cacheable, degraded) = frame.map_or((false, false), |f| (f.cacheable, f.degraded));
        let matched = self.matches.matched_since(mark);
        if vetted && cacheable && !matched && status == Status::Clean {
            if let Some(key) = cache_key {
                if self.engine.cache().store(key) {
                    self.stats.cache_stores += 1;
                }
            }
        }
        if self.options.collect_metadata {
            self.objects.push(ObjectRecord {
                depth,
                file_type,
                len: view.len() as u64,
                name: view.name().map(str::to_string),
                parent_type: parent,
                matched,
                degraded,
            });
        }
        Ok(status)
    }

    /// Scan `[offset, offset + len)` of `parent` as a nested object.
    ///
    /// `len == 0` means "to the end"; lengths past the end are truncated;
    /// an offset at or past the end is clean.
    pub fn scan_nested(
        &mut self,
        parent: &ByteView,
        offset: u64,
        len: u64,
        hint: FileType,
        name: Option<&str>,
    ) -> Result<Status, ScanError> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(Status::Clean);
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        let Some(sub) = parent.sub_view(offset, len) else {
            return Ok(Status::Clean);
        };
        if sub.len() <= MIN_SCAN_LEN {
            return Ok(Status::Clean);
        }
        let sub = match name {
            Some(name) => sub.with_name(name),
            None => sub,
        };
        self.scan_owned(sub, hint)
    }

    /// Scan a decoded in-memory buffer as a nested object.
    pub fn scan_buffer(
        &mut self,
        bytes: Vec<u8>,
        hint: FileType,
        name: Option<&str>,
    ) -> Result<Status, ScanError> {
        if bytes.len() <= MIN_SCAN_LEN {
            return Ok(Status::Clean);
        }
        let view = ByteView::from_vec(bytes);
        let view = match name {
            Some(name) => view.with_name(name),
            None => view,
        };
        self.scan_owned(view, hint)
    }

    /// Scan a file by path. Files that cannot be opened are skipped.
    pub fn scan_file(&mut self, path: &Path, hint: FileType) -> Result<Status, ScanError> {
        let view = match ByteView::open(path) {
            Ok(view) => view,
            Err(e) => {
                log::debug!("cannot open {}: {e}", path.display());
                return Ok(Status::Clean);
            }
        };
        self.scan_view(&view, hint)
    }

    /// Scan every regular file below `dir`.
    pub fn scan_dir(&mut self, dir: &Path) -> Result<Status, ScanError> {
        for entry in walkdir::WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("skipping unreadable directory entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            self.check_time()?;
            if self.scan_file(entry.path(), FileType::Any)?.is_virus() {
                return Ok(Status::Virus);
            }
        }
        Ok(Status::Clean)
    }

    /// Scan an extracted container entry.
    pub fn scan_entry(&mut self, entry: MaterializedEntry) -> Result<Status, ScanError> {
        self.scan_view(&entry.view, FileType::Any)
    }

    fn scan_owned(&mut self, view: ByteView, hint: FileType) -> Result<Status, ScanError> {
        if !self.options.force_to_disk {
            return self.scan_view(&view, hint);
        }
        let dir = self.temp.path().to_path_buf();
        let mut sink = self.temp.entry_sink(&dir, true, u64::MAX)?;
        sink.write_all(view.as_slice()).map_err(ScanError::Write)?;
        let entry = sink.finish(view.name())?;
        self.scan_entry(entry)
    }

    // -----------------------------
    // Limits
    // -----------------------------

    /// Fail with `Timeout` once the deadline has passed.
    pub fn check_time(&self) -> Result<(), ScanError> {
        match self.limiter.check_time() {
            LimitCheck::Hard(_) => Err(ScanError::Timeout),
            _ => Ok(()),
        }
    }

    /// Probe whether `need` more bytes may be scanned.
    ///
    /// Soft hits are noted (flag, counters, optional heuristic) before they
    /// are returned, together with the status of that note: `Virus` when a
    /// limit heuristic halted the branch. Hard hits are fatal.
    pub fn check_limits(&mut self, need: u64) -> Result<(LimitCheck, Status), ScanError> {
        let check = self.limiter.check(need);
        let status = match check {
            LimitCheck::Within => Status::Clean,
            LimitCheck::Soft(reason) => self.note_limit(reason),
            LimitCheck::Hard(_) => return Err(ScanError::Timeout),
        };
        Ok((check, status))
    }

    /// Record that `reason` cut the current object short.
    ///
    /// The object and every ancestor become non-cacheable. With
    /// `alert_exceeds_max`, the first hit per reason also records a
    /// `Heuristics.Limits.Exceeded.*` match, whose status is returned.
    pub fn note_limit(&mut self, reason: LimitReason) -> Status {
        self.limiter.note_exceeded();
        self.stats.record_limit(reason);
        for frame in self.views.iter_mut() {
            frame.cacheable = false;
        }
        if let Some(frame) = self.views.last_mut() {
            frame.degraded = true;
        }
        log::debug!(
            "limit reached: {} (depth {})",
            reason.name(),
            self.containers.depth()
        );
        let slot = &mut self.limit_alerted[reason.as_usize()];
        if !self.options.alert_exceeds_max || *slot {
            return Status::Clean;
        }
        *slot = true;
        self.report_heuristic(&format!(
            "Heuristics.Limits.Exceeded.{}",
            reason.heuristic_suffix()
        ))
    }

    // -----------------------------
    // Matches
    // -----------------------------

    /// Record a match from the current object.
    pub fn report_match(&mut self, name: String, kind: MatchKind) -> Status {
        let depth = self.object_depth();
        log::debug!("match {name} in {} at depth {depth}", self.current_type());
        let rec = MatchRecord {
            name,
            kind,
            depth,
            file_type: self.current_type(),
        };
        self.matches.record(rec)
    }

    pub fn report_heuristic(&mut self, name: &str) -> Status {
        self.report_match(name.to_string(), MatchKind::Heuristic)
    }

    fn report_callback(&mut self, file_type: FileType) -> Status {
        log::debug!("{file_type} object blacklisted by host callback");
        self.report_match(CALLBACK_DETECTION.to_string(), MatchKind::Signature)
    }

    /// Offer container-entry metadata to metadata signatures.
    pub fn scan_metadata(&mut self, meta: &EntryMetadata<'_>) -> Status {
        match self.engine.matcher().scan_metadata(meta) {
            Some(name) => self.report_match(name, MatchKind::Signature),
            None => Status::Clean,
        }
    }

    /// Bounded sink for one extracted entry under `dir`.
    pub fn entry_sink(&self, dir: &Path, cap: u64) -> Result<EntrySink, ScanError> {
        self.temp.entry_sink(dir, self.options.spill_to_disk(), cap)
    }

    // -----------------------------
    // State machine internals
    // -----------------------------

    fn resolve_type(&self, view: &ByteView, hint: FileType) -> FileType {
        if !hint.is_generic() {
            return hint;
        }
        let detected = self.engine.detector().detect(view.head(DETECT_HEAD_LEN));
        log::trace!("detected {detected} ({} bytes)", view.len());
        detected
    }

    fn cache_probe(&mut self, view: &ByteView) -> CacheProbe {
        let cache = self.engine.cache();
        if !self.options.cache_allowed() || !cache.is_enabled() {
            return CacheProbe::Off;
        }
        let key = view.cache_key();
        match cache.check(&key) {
            CacheLookup::HitClean => {
                self.stats.cache_hits += 1;
                log::trace!("cache hit {key:?}");
                CacheProbe::Hit
            }
            CacheLookup::Miss => {
                self.stats.cache_misses += 1;
                CacheProbe::Miss(key)
            }
        }
    }

    fn scan_typed(
        &mut self,
        view: &ByteView,
        file_type: FileType,
        parent: FileType,
    ) -> Result<Status, ScanError> {
        let engine = self.engine;
        let depth = self.containers.depth();
        let families = engine.config().families;
        let handler = engine.dispatcher().lookup(file_type, families, parent);

        if self.options.raw_only {
            return self.raw_pass(view, file_type, parent, false);
        }
        if self.limiter.at_max_depth(depth) {
            if handler.is_some() || file_type.allows_recognition() {
                let halted = self.note_limit(LimitReason::Recursion);
                if halted.is_virus() {
                    return Ok(halted);
                }
            }
            return self.raw_pass(view, file_type, parent, false);
        }

        let frame = ContainerFrame {
            file_type,
            size: view.len() as u64,
            offset: view.origin_offset(),
        };
        if self.containers.push(frame).is_err() {
            let halted = self.note_limit(LimitReason::Recursion);
            if halted.is_virus() {
                return Ok(halted);
            }
            return self.raw_pass(view, file_type, parent, false);
        }
        let result = self.scan_in_frame(view, file_type, parent, handler);
        self.containers.pop();
        result
    }

    fn scan_in_frame(
        &mut self,
        view: &ByteView,
        file_type: FileType,
        parent: FileType,
        handler: Option<&dyn Handler>,
    ) -> Result<Status, ScanError> {
        if let Some(h) = handler.filter(|h| h.phase() == Phase::Container) {
            if self.run_handler(h, view)?.is_virus() {
                return Ok(Status::Virus);
            }
        }
        if self.raw_pass(view, file_type, parent, true)?.is_virus() {
            return Ok(Status::Virus);
        }
        if let Some(h) = handler.filter(|h| h.phase() == Phase::PostRaw) {
            return self.run_handler(h, view);
        }
        Ok(Status::Clean)
    }

    fn run_handler(&mut self, handler: &dyn Handler, view: &ByteView) -> Result<Status, ScanError> {
        self.stats.handlers_invoked += 1;
        match handler.scan(self, view)? {
            Status::Clean => Ok(Status::Clean),
            Status::Virus => Ok(Status::Virus),
            Status::Format(kind) => {
                self.stats.record_format_error(kind);
                log::debug!(
                    "{} handler: {} error on {}, treating as clean",
                    handler.name(),
                    kind.name(),
                    view.name().unwrap_or("<unnamed>")
                );
                Ok(Status::Clean)
            }
            Status::Limit(reason) => Ok(self.note_limit(reason)),
        }
    }

    /// Signature pass over the whole object, then (optionally) text
    /// reclassification and embedded-object recursion.
    fn raw_pass(
        &mut self,
        view: &ByteView,
        file_type: FileType,
        parent: FileType,
        recognize: bool,
    ) -> Result<Status, ScanError> {
        let engine = self.engine;
        let mut names = std::mem::take(&mut self.sig_scratch);
        names.clear();
        engine
            .matcher()
            .scan(view.as_slice(), file_type, self.matches.mode(), &mut names);
        let mut halted = false;
        for name in names.drain(..) {
            if self.report_match(name, MatchKind::Signature).is_virus() {
                halted = true;
                break;
            }
        }
        names.clear();
        self.sig_scratch = names;
        if halted {
            return Ok(Status::Virus);
        }

        if !recognize || !file_type.allows_recognition() {
            return Ok(Status::Clean);
        }

        if file_type == FileType::Text {
            if let Some(refined) = engine.detector().reclassify_text(view.as_slice()) {
                if let Some(h) =
                    engine
                        .dispatcher()
                        .lookup(refined, engine.config().families, parent)
                {
                    log::trace!("text reclassified as {refined}");
                    self.containers.set_current(refined, view.len() as u64);
                    if self.run_handler(h, view)?.is_virus() {
                        return Ok(Status::Virus);
                    }
                }
            }
        }

        self.scan_embedded(view, file_type, parent)
    }

    fn scan_embedded(
        &mut self,
        view: &ByteView,
        file_type: FileType,
        parent: FileType,
    ) -> Result<Status, ScanError> {
        let engine = self.engine;
        let limits = &engine.config().limits;
        let max = limits.max_embedded_objects;
        if max == 0 {
            return Ok(Status::Clean);
        }
        let mut found: Vec<EmbeddedObject> = Vec::new();
        engine
            .detector()
            .find_embedded(view.as_slice(), file_type, max.saturating_add(1), &mut found);
        if found.len() > max {
            found.truncate(max);
            if self.note_limit(LimitReason::EmbeddedCount).is_virus() {
                return Ok(Status::Virus);
            }
        }

        for obj in found {
            self.check_time()?;
            match embedded_decision(
                obj.file_type,
                file_type,
                parent,
                view.len() as u64,
                limits.max_embedded_pe,
            ) {
                EmbeddedDecision::Scan => {}
                EmbeddedDecision::Skip => continue,
                EmbeddedDecision::Limit(reason) => {
                    if self.note_limit(reason).is_virus() {
                        return Ok(Status::Virus);
                    }
                    continue;
                }
            }
            self.stats.embedded_found += 1;
            log::debug!(
                "embedded {} at offset {} in {file_type}",
                obj.file_type,
                obj.offset
            );
            if self
                .scan_nested(view, obj.offset, 0, obj.file_type, None)?
                .is_virus()
            {
                return Ok(Status::Virus);
            }
            if obj.file_type == FileType::Pe {
                break;
            }
        }
        Ok(Status::Clean)
    }

    // -----------------------------
    // Session end
    // -----------------------------

    /// Fold the session into a report.
    ///
    /// A timeout after a match still reports the match; any other fatal
    /// error wins over matches.
    pub fn finish(self, result: Result<Status, ScanError>) -> ScanReport {
        let count = self.matches.count();
        let possibly_unwanted = self.matches.possibly_unwanted();
        let primary = self.matches.primary().map(|m| m.name.clone());
        let outcome = match result {
            Err(ScanError::Timeout) if count > 0 => ScanOutcome::Virus(primary.unwrap_or_default()),
            Err(e) => {
                log::warn!("scan aborted: {e}");
                ScanOutcome::Error(e.kind())
            }
            Ok(_) => match primary {
                Some(name) if count > 0 => ScanOutcome::Virus(name),
                _ => ScanOutcome::Clean,
            },
        };
        ScanReport {
            outcome,
            match_count: count,
            bytes_scanned: self.limiter.scanned(),
            limits_exceeded: self.limiter.limits_exceeded(),
            possibly_unwanted,
            stats: self.stats,
            objects: self.objects,
            matches: self.matches.into_records(),
        }
    }

    /// Aggregation mode of this session.
    #[inline]
    pub fn match_mode(&self) -> MatchMode {
        self.matches.mode()
    }
}
