//! Generic extract-then-recurse loop shared by multi-entry containers.
//!
//! # Invariants
//! - After `peek_header` yields a header, exactly one of `skip` or `extract`
//!   is called before the next `peek_header`.
//! - Entry metadata is offered to metadata signatures before any size,
//!   directory or encryption decision, so skipped entries are still vetted.
//! - The deadline is checked once per iteration; expiry unwinds at once.
//! - Temporary storage for an entry lives exactly as long as its scan.
//!
//! # Algorithm
//! 1. Scan archive comments as independent objects (encrypted ones are only
//!    counted).
//! 2. Per entry: header (encrypted headers are counted and skipped; a failed
//!    skip is a structural failure), metadata scan, count ceiling,
//!    directory skip, size skip, encrypted skip, extract, recurse.
//! 3. After the loop: optional `Heuristics.Encrypted.<Format>` when
//!    encrypted content was seen and no signature matched in this container;
//!    structural failure is reported as `Status::Format`.

use std::io::Write;

use crate::context::ScanContext;
use crate::error::ScanError;
use crate::filetype::FileType;
use crate::limits::LimitCheck;
use crate::outcome::{EntrySkipReason, FormatErrorKind, Status};
use crate::signature::EntryMetadata;

/// Result of one extractor call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step<T> {
    Ok(T),
    Encrypted,
    NoMoreEntries,
    Error(FormatErrorKind),
}

/// Header of the next container entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: Option<String>,
    pub packed_size: u64,
    /// Declared size; untrusted.
    pub unpacked_size: u64,
    pub crc32: Option<u32>,
    pub encrypted: bool,
    pub is_dir: bool,
}

/// Free-text archive comment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comment {
    pub data: Vec<u8>,
    pub encrypted: bool,
}

/// Entry-by-entry access to a container, implemented per format.
pub trait EntryIterator {
    /// Archive-level comments, drained before the first header.
    fn next_comment(&mut self) -> Option<Comment> {
        None
    }

    fn peek_header(&mut self) -> Step<EntryHeader>;

    /// Discard the entry whose header was just returned.
    fn skip(&mut self) -> Step<()>;

    /// Write the current entry's content to `out`.
    ///
    /// A write error from `out` must stop extraction of this entry and be
    /// reported as `Step::Error`; the entry counts as consumed either way.
    fn extract(&mut self, out: &mut dyn Write) -> Step<()>;
}

/// Drive `entries` to completion for a container of type `format`.
pub fn run_extraction_loop(
    ctx: &mut ScanContext<'_>,
    format: FileType,
    entries: &mut dyn EntryIterator,
) -> Result<Status, ScanError> {
    let dir = ctx.temp().container_dir(format.name())?;
    let result = extraction_loop(ctx, format, entries, &dir);
    ctx.temp().leave_container_dir(&dir);
    result
}

fn extraction_loop(
    ctx: &mut ScanContext<'_>,
    format: FileType,
    entries: &mut dyn EntryIterator,
    dir: &std::path::Path,
) -> Result<Status, ScanError> {
    let mark = ctx.matches().mark();
    let mut encrypted = 0u32;
    let mut structural: Option<FormatErrorKind> = None;

    let mut comments = 0u32;
    while let Some(comment) = entries.next_comment() {
        ctx.check_time()?;
        if comment.encrypted {
            encrypted += 1;
            continue;
        }
        comments += 1;
        if ctx.options().retain_temps {
            ctx.temp()
                .persist(dir, &format!("comment{comments}"), &comment.data)?;
        }
        if ctx
            .scan_buffer(comment.data, FileType::Any, Some("comment"))?
            .is_virus()
        {
            return Ok(Status::Virus);
        }
    }

    let mut index = 0u32;
    loop {
        ctx.check_time()?;
        let header = match entries.peek_header() {
            Step::Ok(header) => header,
            Step::NoMoreEntries => break,
            Step::Error(kind) => {
                // Unreadable header: keep what was found so far.
                ctx.stats_mut().record_format_error(kind);
                log::debug!("{format}: header error ({}), stopping", kind.name());
                break;
            }
            Step::Encrypted => {
                encrypted += 1;
                ctx.stats_mut()
                    .record_entry_skipped(EntrySkipReason::Encrypted);
                if !matches!(entries.skip(), Step::Ok(())) {
                    structural = Some(FormatErrorKind::EncryptedHeaders);
                    break;
                }
                continue;
            }
        };
        index = index.saturating_add(1);
        ctx.stats_mut().entries_seen += 1;

        let meta = EntryMetadata {
            container: format,
            name: header.name.as_deref(),
            packed_size: header.packed_size,
            unpacked_size: header.unpacked_size,
            crc32: header.crc32,
            encrypted: header.encrypted,
            index,
        };
        if ctx.scan_metadata(&meta).is_virus() {
            return Ok(Status::Virus);
        }

        let (check, status) = ctx.check_limits(0)?;
        if status.is_virus() {
            return Ok(Status::Virus);
        }
        if !check.is_within() {
            break;
        }

        let mut halted = false;
        let skip_reason = if header.is_dir {
            Some(EntrySkipReason::Directory)
        } else {
            let (check, status) = ctx.check_limits(header.unpacked_size)?;
            halted = status.is_virus();
            if !check.is_within() {
                Some(EntrySkipReason::TooLarge)
            } else if header.encrypted {
                encrypted += 1;
                Some(EntrySkipReason::Encrypted)
            } else {
                None
            }
        };
        if let Some(reason) = skip_reason {
            ctx.stats_mut().record_entry_skipped(reason);
            if halted {
                return Ok(Status::Virus);
            }
            if !matches!(entries.skip(), Step::Ok(())) {
                structural = Some(FormatErrorKind::Malformed);
                break;
            }
            continue;
        }

        let cap = ctx.limiter().entry_allowance();
        let mut sink = ctx.entry_sink(dir, cap)?;
        match entries.extract(&mut sink) {
            Step::Ok(()) => {}
            Step::NoMoreEntries => break,
            Step::Encrypted => {
                encrypted += 1;
                ctx.stats_mut()
                    .record_entry_skipped(EntrySkipReason::Encrypted);
                continue;
            }
            Step::Error(kind) => {
                if sink.truncated() {
                    let reason = ctx.limiter().allowance_reason();
                    if ctx.note_limit(reason).is_virus() {
                        return Ok(Status::Virus);
                    }
                } else if sink.written() == 0 && !sink.failed() {
                    ctx.stats_mut().record_format_error(kind);
                    ctx.stats_mut()
                        .record_entry_skipped(EntrySkipReason::ExtractFailed);
                    continue;
                } else {
                    // Partial output is still worth scanning.
                    ctx.stats_mut().record_format_error(kind);
                }
            }
        }

        let written = sink.written();
        let entry = sink.finish(header.name.as_deref())?;
        let stats = ctx.stats_mut();
        stats.entries_extracted += 1;
        stats.bytes_extracted = stats.bytes_extracted.saturating_add(written);

        if ctx.scan_entry(entry)?.is_virus() {
            return Ok(Status::Virus);
        }
        if ctx.limiter().scan_budget_exhausted() {
            match ctx.check_limits(0)? {
                (_, Status::Virus) => return Ok(Status::Virus),
                (LimitCheck::Soft(_), _) => break,
                _ => {}
            }
        }
    }

    if encrypted > 0 && ctx.options().alert_encrypted && !ctx.matches().signature_since(mark) {
        let name = format!("Heuristics.Encrypted.{}", format.label());
        if ctx.report_heuristic(&name).is_virus() {
            return Ok(Status::Virus);
        }
    }
    if let Some(kind) = structural {
        return Ok(Status::Format(kind));
    }
    Ok(Status::Clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::MatchMode;
    use crate::config::{EngineConfig, ScanOptions};
    use crate::engine::Engine;
    use crate::signature::{MetadataRule, PatternMatcher};

    /// Scripted container: headers and payloads, with a log of which
    /// entries were actually extracted.
    struct Scripted {
        comments: Vec<Comment>,
        entries: Vec<(Step<EntryHeader>, Vec<u8>)>,
        pos: usize,
        extracted: Vec<String>,
        skip_fails: bool,
    }

    impl Scripted {
        fn new(entries: Vec<(Step<EntryHeader>, Vec<u8>)>) -> Self {
            Self {
                comments: Vec::new(),
                entries,
                pos: 0,
                extracted: Vec::new(),
                skip_fails: false,
            }
        }

        fn files(files: &[(&str, &[u8])]) -> Self {
            Self::new(
                files
                    .iter()
                    .map(|(name, data)| (Step::Ok(file(name, data.len())), data.to_vec()))
                    .collect(),
            )
        }
    }

    fn file(name: &str, len: usize) -> EntryHeader {
        EntryHeader {
            name: Some(name.to_string()),
            packed_size: len as u64,
            unpacked_size: len as u64,
            ..EntryHeader::default()
        }
    }

    impl EntryIterator for Scripted {
        fn next_comment(&mut self) -> Option<Comment> {
            self.comments.pop()
        }

        fn peek_header(&mut self) -> Step<EntryHeader> {
            match self.entries.get(self.pos) {
                Some((step, _)) => step.clone(),
                None => Step::NoMoreEntries,
            }
        }

        fn skip(&mut self) -> Step<()> {
            if self.skip_fails {
                return Step::Error(FormatErrorKind::Malformed);
            }
            self.pos += 1;
            Step::Ok(())
        }

        fn extract(&mut self, out: &mut dyn Write) -> Step<()> {
            let (step, data) = &self.entries[self.pos];
            self.pos += 1;
            if let Step::Ok(h) = step {
                self.extracted.push(h.name.clone().unwrap_or_default());
            }
            match out.write_all(data) {
                Ok(()) => Step::Ok(()),
                Err(_) => Step::Error(FormatErrorKind::Truncated),
            }
        }
    }

    fn engine(dir: &std::path::Path, matcher: PatternMatcher) -> Engine {
        let config = EngineConfig {
            temp_dir: Some(dir.to_path_buf()),
            ..EngineConfig::default()
        };
        Engine::builder().config(config).matcher(matcher).build().unwrap()
    }

    fn marker() -> PatternMatcher {
        PatternMatcher::new().with_pattern("Test.Marker", b"EVIL-MARKER")
    }

    fn run(
        engine: &Engine,
        options: ScanOptions,
        entries: &mut Scripted,
    ) -> (Result<Status, ScanError>, crate::outcome::ScanReport) {
        let mut ctx = ScanContext::new(engine, options, None).unwrap();
        let result = run_extraction_loop(&mut ctx, FileType::Zip, entries);
        let status = match &result {
            Ok(s) => Ok(*s),
            Err(_) => Err(ScanError::Timeout),
        };
        (result, ctx.finish(status))
    }

    #[test]
    fn stop_first_never_extracts_past_the_match() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), marker());
        let mut entries = Scripted::files(&[
            ("one.txt", b"first clean entry"),
            ("two.txt", b"second clean entry"),
            ("bad.bin", b"payload EVIL-MARKER payload"),
            ("four.txt", b"fourth clean entry"),
        ]);
        let (result, report) = run(&engine, ScanOptions::default(), &mut entries);
        assert_eq!(result.unwrap(), Status::Virus);
        assert_eq!(entries.extracted, ["one.txt", "two.txt", "bad.bin"]);
        assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));
    }

    #[test]
    fn collect_all_walks_every_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), marker());
        let mut entries = Scripted::files(&[
            ("a.bin", b"EVIL-MARKER in the first"),
            ("b.txt", b"clean in between"),
            ("c.bin", b"and EVIL-MARKER in the last"),
        ]);
        let options = ScanOptions {
            match_mode: MatchMode::CollectAll,
            ..ScanOptions::default()
        };
        let (result, report) = run(&engine, options, &mut entries);
        assert_eq!(result.unwrap(), Status::Clean);
        assert_eq!(entries.extracted.len(), 3);
        assert_eq!(report.match_count, 2);
        assert!(report.outcome.is_virus());
    }

    #[test]
    fn encrypted_entries_raise_heuristic_only_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), marker());
        let build = || {
            let mut secret = file("secret.bin", 32);
            secret.encrypted = true;
            Scripted::new(vec![(Step::Ok(secret), vec![0u8; 32])])
        };

        let mut entries = build();
        let (result, report) = run(&engine, ScanOptions::default(), &mut entries);
        assert_eq!(result.unwrap(), Status::Clean);
        assert!(entries.extracted.is_empty());
        assert!(report.outcome.is_clean());

        let mut entries = build();
        let options = ScanOptions {
            alert_encrypted: true,
            prefer_heuristics: true,
            ..ScanOptions::default()
        };
        let (result, report) = run(&engine, options, &mut entries);
        assert_eq!(result.unwrap(), Status::Virus);
        assert_eq!(
            report.outcome.virus_name(),
            Some("Heuristics.Encrypted.Zip")
        );
    }

    #[test]
    fn comments_are_scanned_before_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), marker());
        let mut entries = Scripted::files(&[("a.txt", b"never reached entry")]);
        entries.comments.push(Comment {
            data: b"archive comment EVIL-MARKER".to_vec(),
            encrypted: false,
        });
        let (result, _) = run(&engine, ScanOptions::default(), &mut entries);
        assert_eq!(result.unwrap(), Status::Virus);
        assert!(entries.extracted.is_empty());
    }

    #[test]
    fn header_error_keeps_earlier_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), marker());
        let mut entries = Scripted::new(vec![
            (Step::Ok(file("a.bin", 20)), b"EVIL-MARKER is here".to_vec()),
            (Step::Error(FormatErrorKind::Malformed), Vec::new()),
            (Step::Ok(file("c.txt", 20)), b"unreachable content".to_vec()),
        ]);
        let options = ScanOptions {
            match_mode: MatchMode::CollectAll,
            ..ScanOptions::default()
        };
        let (result, report) = run(&engine, options, &mut entries);
        assert_eq!(result.unwrap(), Status::Clean);
        assert_eq!(entries.extracted, ["a.bin"]);
        assert_eq!(report.match_count, 1);
        assert_eq!(report.stats.format_errors(FormatErrorKind::Malformed), 1);
    }

    #[test]
    fn failed_skip_is_structural() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), marker());
        let mut dir = file("folder/", 0);
        dir.is_dir = true;
        let mut entries = Scripted::new(vec![(Step::Ok(dir), Vec::new())]);
        entries.skip_fails = true;
        let (result, _) = run(&engine, ScanOptions::default(), &mut entries);
        assert_eq!(
            result.unwrap(),
            Status::Format(FormatErrorKind::Malformed)
        );
    }

    #[test]
    fn metadata_rules_see_skipped_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let matcher = PatternMatcher::new().with_metadata_rule(MetadataRule {
            name: "Test.Meta".to_string(),
            entry_name: Some("dropper".to_string()),
            ..MetadataRule::default()
        });
        let engine = engine(tmp.path(), matcher);
        let mut dir = file("dropper/", 0);
        dir.is_dir = true;
        let mut entries = Scripted::new(vec![(Step::Ok(dir), Vec::new())]);
        let (result, report) = run(&engine, ScanOptions::default(), &mut entries);
        assert_eq!(result.unwrap(), Status::Virus);
        assert_eq!(report.outcome.virus_name(), Some("Test.Meta"));
    }

    #[test]
    fn preferred_limit_heuristic_on_truncation_halts_the_loop() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = EngineConfig {
            temp_dir: Some(tmp.path().to_path_buf()),
            ..EngineConfig::default()
        };
        config.limits.max_scan_size = 64;
        config.limits.max_file_size = 0;
        let engine = Engine::builder()
            .config(config)
            .matcher(marker())
            .build()
            .unwrap();
        // Declared size fits; the payload does not.
        let mut entries = Scripted::new(vec![
            (Step::Ok(file("liar.bin", 8)), vec![0u8; 4096]),
            (Step::Ok(file("after.bin", 16)), b"EVIL-MARKER here".to_vec()),
        ]);
        let options = ScanOptions {
            alert_exceeds_max: true,
            prefer_heuristics: true,
            ..ScanOptions::default()
        };
        let (result, report) = run(&engine, options, &mut entries);
        assert_eq!(result.unwrap(), Status::Virus);
        assert_eq!(entries.extracted, ["liar.bin"]);
        assert_eq!(report.match_count, 1);
        assert_eq!(
            report.outcome.virus_name(),
            Some("Heuristics.Limits.Exceeded.MaxScanSize")
        );
    }
}
