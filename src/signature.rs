//! Signature matching seam.
//!
//! The engine never interprets signatures itself; it hands bytes (or entry
//! metadata) to a [`SignatureMatcher`] and records whatever names come back.
//!
//! `PatternMatcher` is a small literal matcher for hosts without a real
//! signature engine and for tests: literal byte patterns, optionally pinned
//! to an offset and/or a file type, plus metadata rules.

use memchr::memmem;

use crate::aggregate::MatchMode;
use crate::filetype::FileType;

/// Container-entry metadata offered to metadata signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMetadata<'a> {
    pub container: FileType,
    pub name: Option<&'a str>,
    pub packed_size: u64,
    pub unpacked_size: u64,
    pub crc32: Option<u32>,
    pub encrypted: bool,
    /// Ordinal of the entry within its container (1-based).
    pub index: u32,
}

/// Content and metadata signature matcher.
///
/// Implementations are shared across sessions and must be immutable.
pub trait SignatureMatcher: Send + Sync {
    /// Append names of signatures matching `bytes`.
    ///
    /// In `StopOnFirst` mode implementations may stop after the first hit.
    fn scan(&self, bytes: &[u8], file_type: FileType, mode: MatchMode, out: &mut Vec<String>);

    /// Name of a metadata signature matching `meta`, if any.
    fn scan_metadata(&self, _meta: &EntryMetadata<'_>) -> Option<String> {
        None
    }
}

/// Where a literal pattern must occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anchor {
    Anywhere,
    /// Exactly at this offset from the start of the object.
    At(u64),
}

struct Pattern {
    name: String,
    bytes: Vec<u8>,
    anchor: Anchor,
    target: Option<FileType>,
    finder: memmem::Finder<'static>,
}

impl Pattern {
    fn matches(&self, bytes: &[u8], file_type: FileType) -> bool {
        if self.target.is_some_and(|t| t != file_type) {
            return false;
        }
        match self.anchor {
            Anchor::Anywhere => self.finder.find(bytes).is_some(),
            Anchor::At(off) => usize::try_from(off)
                .ok()
                .and_then(|off| bytes.get(off..off.checked_add(self.bytes.len())?))
                .is_some_and(|window| window == self.bytes.as_slice()),
        }
    }
}

/// Metadata signature; every set field must match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataRule {
    pub name: String,
    pub container: Option<FileType>,
    /// Substring of the entry name.
    pub entry_name: Option<String>,
    pub encrypted: Option<bool>,
    pub unpacked_size: Option<u64>,
    pub crc32: Option<u32>,
}

impl MetadataRule {
    fn matches(&self, meta: &EntryMetadata<'_>) -> bool {
        if self.container.is_some_and(|c| c != meta.container) {
            return false;
        }
        if let Some(needle) = &self.entry_name {
            match meta.name {
                Some(name) if name.contains(needle.as_str()) => {}
                _ => return false,
            }
        }
        if self.encrypted.is_some_and(|e| e != meta.encrypted) {
            return false;
        }
        if self.unpacked_size.is_some_and(|s| s != meta.unpacked_size) {
            return false;
        }
        if self.crc32.is_some() && self.crc32 != meta.crc32 {
            return false;
        }
        true
    }
}

/// Literal-pattern matcher.
#[derive(Default)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
    metadata_rules: Vec<MetadataRule>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match `bytes` anywhere in any object.
    #[must_use]
    pub fn with_pattern(self, name: &str, bytes: &[u8]) -> Self {
        self.with_rule(name, bytes, Anchor::Anywhere, None)
    }

    /// Match `bytes` at exactly `offset`.
    #[must_use]
    pub fn with_anchored(self, name: &str, bytes: &[u8], offset: u64) -> Self {
        self.with_rule(name, bytes, Anchor::At(offset), None)
    }

    #[must_use]
    pub fn with_rule(
        mut self,
        name: &str,
        bytes: &[u8],
        anchor: Anchor,
        target: Option<FileType>,
    ) -> Self {
        self.patterns.push(Pattern {
            name: name.to_string(),
            bytes: bytes.to_vec(),
            anchor,
            target,
            finder: memmem::Finder::new(bytes).into_owned(),
        });
        self
    }

    #[must_use]
    pub fn with_metadata_rule(mut self, rule: MetadataRule) -> Self {
        self.metadata_rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len() + self.metadata_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SignatureMatcher for PatternMatcher {
    fn scan(&self, bytes: &[u8], file_type: FileType, mode: MatchMode, out: &mut Vec<String>) {
        for p in &self.patterns {
            if p.matches(bytes, file_type) {
                out.push(p.name.clone());
                if mode == MatchMode::StopOnFirst {
                    return;
                }
            }
        }
    }

    fn scan_metadata(&self, meta: &EntryMetadata<'_>) -> Option<String> {
        self.metadata_rules
            .iter()
            .find(|r| r.matches(meta))
            .map(|r| r.name.clone())
    }
}

impl std::fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternMatcher")
            .field(
                "patterns",
                &self.patterns.iter().map(|p| &p.name).collect::<Vec<_>>(),
            )
            .field("metadata_rules", &self.metadata_rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(m: &PatternMatcher, bytes: &[u8], ft: FileType) -> Vec<String> {
        let mut out = Vec::new();
        m.scan(bytes, ft, MatchMode::CollectAll, &mut out);
        out
    }

    #[test]
    fn anywhere_and_anchored() {
        let m = PatternMatcher::new()
            .with_pattern("Any.Bad", b"BAD")
            .with_anchored("Head.Bad", b"EVIL", 0);
        assert_eq!(scan_all(&m, b"xxBADxx", FileType::Text), vec!["Any.Bad"]);
        assert_eq!(scan_all(&m, b"EVIL and BAD", FileType::Text).len(), 2);
        assert!(scan_all(&m, b"not EVIL", FileType::Text).is_empty());
    }

    #[test]
    fn stop_on_first_reports_one() {
        let m = PatternMatcher::new()
            .with_pattern("A", b"aa")
            .with_pattern("B", b"bb");
        let mut out = Vec::new();
        m.scan(b"aabb", FileType::Text, MatchMode::StopOnFirst, &mut out);
        assert_eq!(out, vec!["A"]);
    }

    #[test]
    fn target_type_filters() {
        let m = PatternMatcher::new().with_rule(
            "Pe.Only",
            b"xyz",
            Anchor::Anywhere,
            Some(FileType::Pe),
        );
        assert!(scan_all(&m, b"..xyz..", FileType::Text).is_empty());
        assert_eq!(scan_all(&m, b"..xyz..", FileType::Pe), vec!["Pe.Only"]);
    }

    #[test]
    fn anchored_past_end_does_not_match() {
        let m = PatternMatcher::new().with_anchored("Deep", b"zz", u64::MAX);
        assert!(scan_all(&m, b"zzzz", FileType::BinaryData).is_empty());
    }

    #[test]
    fn metadata_rules_require_all_fields() {
        let m = PatternMatcher::new().with_metadata_rule(MetadataRule {
            name: "Meta.Dropper".into(),
            container: Some(FileType::Zip),
            entry_name: Some("invoice".into()),
            encrypted: Some(true),
            ..MetadataRule::default()
        });
        let mut meta = EntryMetadata {
            container: FileType::Zip,
            name: Some("invoice.pdf.exe"),
            packed_size: 10,
            unpacked_size: 20,
            crc32: None,
            encrypted: true,
            index: 1,
        };
        assert_eq!(m.scan_metadata(&meta).as_deref(), Some("Meta.Dropper"));
        meta.encrypted = false;
        assert_eq!(m.scan_metadata(&meta), None);
    }
}
