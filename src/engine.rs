//! Shared scan engine and its session front door.
//!
//! # Scope
//! - `Engine` owns everything that is immutable across sessions: validated
//!   configuration, the type detector, the signature matcher, the handler
//!   table and host hooks. It also owns the result cache, which is the only
//!   state shared between concurrent sessions.
//! - Every `scan_*` call runs one synchronous session on the calling thread
//!   and returns a [`ScanReport`]. Fatal session errors are folded into
//!   `ScanOutcome::Error`; they are never reported as clean.
//!
//! # Invariants
//! - `Engine` is `Send + Sync`; sessions borrow it immutably.
//! - Objects of at most 5 bytes, or larger than `i32::MAX - 2` bytes, are
//!   reported clean without creating a session.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::cache::ResultCache;
use crate::config::{ConfigError, EngineConfig, ScanOptions};
use crate::context::{ScanContext, MIN_SCAN_LEN};
use crate::dispatch::TypeDispatcher;
use crate::error::ErrorKind;
use crate::filetype::{FileType, MagicDetector, TypeDetector};
use crate::hooks::{NoHooks, ScanHooks};
use crate::outcome::{LimitReason, ScanOutcome, ScanReport};
use crate::signature::{PatternMatcher, SignatureMatcher};
use crate::view::ByteView;

/// Largest object a session accepts.
pub const MAX_OBJECT_LEN: u64 = i32::MAX as u64 - 2;

/// Immutable scan engine shared by all sessions.
pub struct Engine {
    config: EngineConfig,
    detector: Box<dyn TypeDetector>,
    matcher: Box<dyn SignatureMatcher>,
    dispatcher: TypeDispatcher,
    cache: ResultCache,
    hooks: Box<dyn ScanHooks>,
}

impl Engine {
    /// Engine with built-in collaborators and no signatures.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        EngineBuilder::new().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn detector(&self) -> &dyn TypeDetector {
        self.detector.as_ref()
    }

    #[inline]
    pub fn matcher(&self) -> &dyn SignatureMatcher {
        self.matcher.as_ref()
    }

    #[inline]
    pub fn dispatcher(&self) -> &TypeDispatcher {
        &self.dispatcher
    }

    #[inline]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    #[inline]
    pub fn hooks(&self) -> &dyn ScanHooks {
        self.hooks.as_ref()
    }

    // -----------------------------
    // Sessions
    // -----------------------------

    pub fn scan_bytes(&self, bytes: &[u8]) -> ScanReport {
        self.scan_bytes_with(bytes, &self.config.options)
    }

    pub fn scan_bytes_with(&self, bytes: &[u8], options: &ScanOptions) -> ScanReport {
        if bytes.len() as u64 > MAX_OBJECT_LEN || bytes.len() <= MIN_SCAN_LEN {
            return ScanReport::clean_unscanned(false);
        }
        self.scan_view_with(&ByteView::copy_from_slice(bytes), FileType::Any, options)
    }

    /// Scan a caller-supplied view; a non-generic `hint` skips detection.
    pub fn scan_view(&self, view: &ByteView, hint: FileType) -> ScanReport {
        self.scan_view_with(view, hint, &self.config.options)
    }

    pub fn scan_view_with(
        &self,
        view: &ByteView,
        hint: FileType,
        options: &ScanOptions,
    ) -> ScanReport {
        if view.len() as u64 > MAX_OBJECT_LEN {
            log::debug!("object of {} bytes rejected as too large", view.len());
            return ScanReport::clean_unscanned(false);
        }
        let mut ctx = match ScanContext::new(self, options.clone(), view.name()) {
            Ok(ctx) => ctx,
            Err(e) => return failed(e.kind(), &e),
        };
        let result = ctx.scan_view(view, hint);
        ctx.finish(result)
    }

    /// Scan a file by path, applying the single-file size gate first.
    pub fn scan_file(&self, path: &Path) -> ScanReport {
        self.scan_file_with(path, &self.config.options)
    }

    pub fn scan_file_with(&self, path: &Path, options: &ScanOptions) -> ScanReport {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => return failed(ErrorKind::Open, &e),
        };
        if size <= MIN_SCAN_LEN as u64 || size > MAX_OBJECT_LEN {
            return ScanReport::clean_unscanned(false);
        }
        let max_file_size = self.config.limits.max_file_size;
        if max_file_size != 0 && size > max_file_size {
            log::debug!(
                "{} exceeds max_file_size ({size} > {max_file_size})",
                path.display()
            );
            if !options.alert_exceeds_max {
                return ScanReport::clean_unscanned(true);
            }
            let basename = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let mut ctx = match ScanContext::new(self, options.clone(), basename.as_deref()) {
                Ok(ctx) => ctx,
                Err(e) => return failed(e.kind(), &e),
            };
            let status = ctx.note_limit(LimitReason::FileSize);
            return ctx.finish(Ok(status));
        }
        let view = match ByteView::open(path) {
            Ok(view) => view,
            Err(e) => return failed(ErrorKind::Open, &e),
        };
        self.scan_view_with(&view, FileType::Any, options)
    }

    /// Scan every regular file below `dir` in one session.
    pub fn scan_dir(&self, dir: &Path) -> ScanReport {
        self.scan_dir_with(dir, &self.config.options)
    }

    pub fn scan_dir_with(&self, dir: &Path, options: &ScanOptions) -> ScanReport {
        let basename = dir.file_name().map(|n| n.to_string_lossy().into_owned());
        let mut ctx = match ScanContext::new(self, options.clone(), basename.as_deref()) {
            Ok(ctx) => ctx,
            Err(e) => return failed(e.kind(), &e),
        };
        let result = ctx.scan_dir(dir);
        ctx.finish(result)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn failed(kind: ErrorKind, err: &dyn fmt::Display) -> ScanReport {
    log::warn!("scan failed before start: {err}");
    let mut report = ScanReport::clean_unscanned(false);
    report.outcome = ScanOutcome::Error(kind);
    report
}

/// Builder for [`Engine`]; unset collaborators fall back to the built-ins.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    detector: Option<Box<dyn TypeDetector>>,
    matcher: Option<Box<dyn SignatureMatcher>>,
    dispatcher: Option<TypeDispatcher>,
    hooks: Option<Box<dyn ScanHooks>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn detector(mut self, detector: impl TypeDetector + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    #[must_use]
    pub fn matcher(mut self, matcher: impl SignatureMatcher + 'static) -> Self {
        self.matcher = Some(Box::new(matcher));
        self
    }

    #[must_use]
    pub fn dispatcher(mut self, dispatcher: TypeDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: impl ScanHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        let cache = if self.config.cache.enabled {
            ResultCache::new(&self.config.cache)
        } else {
            ResultCache::disabled()
        };
        Ok(Engine {
            detector: self.detector.unwrap_or_else(|| Box::new(MagicDetector)),
            matcher: self
                .matcher
                .unwrap_or_else(|| Box::new(PatternMatcher::new())),
            dispatcher: self.dispatcher.unwrap_or_default(),
            hooks: self.hooks.unwrap_or_else(|| Box::new(NoHooks)),
            cache,
            config: self.config,
        })
    }
}
