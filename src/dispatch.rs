//! Type-tag to handler dispatch.
//!
//! # Invariants
//! - The table is indexed by `FileType` discriminant and never resized after
//!   construction.
//! - A lookup only succeeds when the type's family is enabled and the
//!   immediate parent is not in the handler's exclusion list.
//! - Handlers are stateless and shared across sessions; every bit of
//!   per-scan state lives in the `ScanContext` they are handed.
//!
//! # Design Notes
//! - Adding a format means registering a new handler for its tag; the scan
//!   state machine never branches on concrete types.
//! - Embedded-object gating lives here too, since it is a policy over type
//!   pairs rather than over bytes.

use std::fmt;

use crate::context::ScanContext;
use crate::error::ScanError;
use crate::filetype::{FamilySet, FileType};
use crate::formats::{GzipHandler, TarHandler, ZipHandler};
use crate::outcome::{LimitReason, Status};
use crate::view::ByteView;

/// When a handler runs relative to the object's raw signature pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// Before the raw pass (archives, documents, mail).
    #[default]
    Container,
    /// After the raw pass (executables, whose raw scan feeds recognition).
    PostRaw,
}

/// A format handler.
///
/// Given a typed view, a handler returns `Clean`, `Virus` (the aggregator
/// asked it to stop), `Format(kind)` for a structural failure of the object
/// itself, or `Limit(reason)`. Fatal conditions are `Err`. Extracted
/// sub-objects go back through the context (`scan_nested`, `scan_buffer`,
/// `run_extraction_loop`); a handler never keeps a view past its return.
pub trait Handler: Send + Sync {
    /// Short, stable name for logs.
    fn name(&self) -> &'static str;

    fn phase(&self) -> Phase {
        Phase::Container
    }

    fn scan(&self, ctx: &mut ScanContext<'_>, view: &ByteView) -> Result<Status, ScanError>;
}

struct Slot {
    handler: Box<dyn Handler>,
    excluded_parents: Vec<FileType>,
}

/// Dispatch table from type tag to handler.
pub struct TypeDispatcher {
    slots: Vec<Option<Slot>>,
}

impl TypeDispatcher {
    /// An empty table: every object gets only the raw pass.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(FileType::COUNT);
        slots.resize_with(FileType::COUNT, || None);
        Self { slots }
    }

    /// Table with the bundled gzip, tar and zip handlers.
    pub fn with_builtin() -> Self {
        let mut table = Self::new();
        table.register(FileType::Gzip, Box::new(GzipHandler));
        table.register(FileType::Tar, Box::new(TarHandler));
        table.register(FileType::Zip, Box::new(ZipHandler));
        table
    }

    /// Bind `handler` to `file_type`, replacing any previous binding.
    pub fn register(&mut self, file_type: FileType, handler: Box<dyn Handler>) {
        self.register_with(file_type, handler, &[]);
    }

    /// Bind `handler` to `file_type`, refusing to run it when the immediate
    /// parent is one of `excluded_parents`.
    pub fn register_with(
        &mut self,
        file_type: FileType,
        handler: Box<dyn Handler>,
        excluded_parents: &[FileType],
    ) {
        self.slots[file_type.as_usize()] = Some(Slot {
            handler,
            excluded_parents: excluded_parents.to_vec(),
        });
    }

    /// Handler for `file_type` under the given family mask and parent.
    pub fn lookup(
        &self,
        file_type: FileType,
        families: FamilySet,
        parent: FileType,
    ) -> Option<&dyn Handler> {
        if !families.allows(file_type) {
            return None;
        }
        let slot = self.slots[file_type.as_usize()].as_ref()?;
        if slot.excluded_parents.contains(&parent) {
            return None;
        }
        Some(slot.handler.as_ref())
    }
}

impl Default for TypeDispatcher {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for TypeDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for (ft, slot) in FileType::ALL.iter().zip(self.slots.iter()) {
            if let Some(slot) = slot {
                list.entry(&ft.name(), &slot.handler.name());
            }
        }
        list.finish()
    }
}

/// What to do with an object reported at a nonzero offset by recognition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddedDecision {
    Scan,
    /// Would re-dispatch the container (or its parent) to itself.
    Skip,
    Limit(LimitReason),
}

/// Gate an embedded object of type `found` inside `container`.
///
/// Same-type and parent-type objects are skipped, except executables:
/// an executable may carry another one (droppers, SFX stubs), but only
/// executable, zip and OLE2 containers are searched for them, and only up
/// to `max_embedded_pe` bytes (`0` = unlimited).
pub fn embedded_decision(
    found: FileType,
    container: FileType,
    parent: FileType,
    container_len: u64,
    max_embedded_pe: u64,
) -> EmbeddedDecision {
    if found == FileType::Pe {
        if !matches!(container, FileType::Pe | FileType::Zip | FileType::Ole2) {
            return EmbeddedDecision::Skip;
        }
        if max_embedded_pe != 0 && container_len > max_embedded_pe {
            return EmbeddedDecision::Limit(LimitReason::EmbeddedPe);
        }
        return EmbeddedDecision::Scan;
    }
    if found == container || found == parent {
        return EmbeddedDecision::Skip;
    }
    EmbeddedDecision::Scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filetype::Family;

    struct Named(&'static str);

    impl Handler for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn scan(&self, _ctx: &mut ScanContext<'_>, _view: &ByteView) -> Result<Status, ScanError> {
            Ok(Status::Clean)
        }
    }

    #[test]
    fn lookup_honors_family_mask() {
        let table = TypeDispatcher::with_builtin();
        assert_eq!(
            table
                .lookup(FileType::Zip, FamilySet::ALL, FileType::Any)
                .map(|h| h.name()),
            Some("zip")
        );
        let no_archives = FamilySet::ALL.without(Family::Archive);
        assert!(table
            .lookup(FileType::Zip, no_archives, FileType::Any)
            .is_none());
        assert!(table
            .lookup(FileType::Pdf, FamilySet::ALL, FileType::Any)
            .is_none());
    }

    #[test]
    fn lookup_honors_parent_exclusion() {
        let mut table = TypeDispatcher::new();
        table.register_with(FileType::Html, Box::new(Named("html")), &[FileType::Mail]);
        assert!(table
            .lookup(FileType::Html, FamilySet::ALL, FileType::Any)
            .is_some());
        assert!(table
            .lookup(FileType::Html, FamilySet::ALL, FileType::Mail)
            .is_none());
    }

    #[test]
    fn register_replaces_binding() {
        let mut table = TypeDispatcher::with_builtin();
        table.register(FileType::Gzip, Box::new(Named("custom-gz")));
        let h = table
            .lookup(FileType::Gzip, FamilySet::ALL, FileType::Any)
            .unwrap();
        assert_eq!(h.name(), "custom-gz");
        assert_eq!(h.phase(), Phase::Container);
    }

    #[test]
    fn embedded_same_or_parent_type_is_skipped() {
        use EmbeddedDecision::*;
        assert_eq!(
            embedded_decision(FileType::Zip, FileType::Zip, FileType::Any, 10, 0),
            Skip
        );
        assert_eq!(
            embedded_decision(FileType::Zip, FileType::Pdf, FileType::Zip, 10, 0),
            Skip
        );
        assert_eq!(
            embedded_decision(FileType::Zip, FileType::Pdf, FileType::Any, 10, 0),
            Scan
        );
    }

    #[test]
    fn embedded_pe_rules() {
        use EmbeddedDecision::*;
        assert_eq!(
            embedded_decision(FileType::Pe, FileType::Pe, FileType::Pe, 100, 1000),
            Scan
        );
        assert_eq!(
            embedded_decision(FileType::Pe, FileType::Pdf, FileType::Any, 100, 1000),
            Skip
        );
        assert_eq!(
            embedded_decision(FileType::Pe, FileType::Ole2, FileType::Any, 2000, 1000),
            Limit(LimitReason::EmbeddedPe)
        );
    }
}
