//! End-to-end dispatch tests through `Engine`.
//!
//! # Scope
//! These tests drive whole sessions over synthesized containers (gzip, tar,
//! zip) and assert on the aggregated `ScanReport`: verdicts, match counts,
//! limit flags, cache behavior, hooks and temp-tree lifecycle.
//!
//! # Assumptions
//! - Every engine uses a literal `EVIL-MARKER` signature.
//! - Archive bytes are synthesized with minimal headers; zip entries are
//!   deflated when the raw container bytes must not expose the marker.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::{Compression, GzBuilder};
use scan_dispatch::limits::ResourceLimiter;
use scan_dispatch::{
    ByteView, Engine, EngineConfig, EntrySkipReason, ErrorKind, FileType, FormatErrorKind,
    HookVerdict, LimitReason, LimitsConfig, MagicDetector, MatchMode, ObjectInfo, PatternMatcher,
    ScanContext, ScanHooks, ScanOptions, ScanOutcome, ScanReport, Status, TypeDetector,
};
use tempfile::TempDir;

const MARKER: &[u8] = b"EVIL-MARKER";
const TAR_BLOCK_LEN: usize = 512;

// -----------------------------
// Fixtures
// -----------------------------

fn marker_payload(tag: &str) -> Vec<u8> {
    let mut payload = format!("{tag} leading text ").into_bytes();
    payload.extend_from_slice(MARKER);
    payload.extend_from_slice(b" trailing text");
    payload
}

fn gzip(payload: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(payload).unwrap();
    enc.finish().unwrap()
}

fn gzip_named(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut enc = GzBuilder::new()
        .filename(name)
        .write(Vec::new(), Compression::default());
    enc.write_all(payload).unwrap();
    enc.finish().unwrap()
}

/// Minimal ustar header for a regular file.
fn tar_header(name: &str, size: usize) -> [u8; TAR_BLOCK_LEN] {
    let mut buf = [0u8; TAR_BLOCK_LEN];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf[100..108].copy_from_slice(b"0000644\0");
    buf[124..135].copy_from_slice(format!("{size:011o}").as_bytes());
    buf[156] = b'0';
    buf[257..263].copy_from_slice(b"ustar\0");
    buf[263..265].copy_from_slice(b"00");
    buf[148..156].copy_from_slice(b"        ");
    let sum: u32 = buf.iter().map(|&b| u32::from(b)).sum();
    buf[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());
    buf
}

fn tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, payload) in entries {
        out.extend_from_slice(&tar_header(name, payload.len()));
        out.extend_from_slice(payload);
        let pad = (TAR_BLOCK_LEN - payload.len() % TAR_BLOCK_LEN) % TAR_BLOCK_LEN;
        out.resize(out.len() + pad, 0);
    }
    out.resize(out.len() + 2 * TAR_BLOCK_LEN, 0);
    out
}

#[derive(Clone, Copy)]
enum ZipMode {
    Stored,
    Deflated,
    Encrypted,
}

/// Hand-assembled Zip32 archive; the CRC fields are not meaningful.
fn zip(entries: &[(&str, &[u8])], mode: ZipMode) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cd = Vec::new();
    for (name, data) in entries {
        let (method, flags, payload): (u16, u16, Vec<u8>) = match mode {
            ZipMode::Stored => (0, 0, data.to_vec()),
            ZipMode::Encrypted => (0, 1, data.to_vec()),
            ZipMode::Deflated => {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).unwrap();
                (8, 0, enc.finish().unwrap())
            }
        };
        let lfh_off = out.len() as u32;
        out.extend_from_slice(b"PK\x03\x04");
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&payload);

        cd.extend_from_slice(b"PK\x01\x02");
        cd.extend_from_slice(&20u16.to_le_bytes());
        cd.extend_from_slice(&20u16.to_le_bytes());
        cd.extend_from_slice(&flags.to_le_bytes());
        cd.extend_from_slice(&method.to_le_bytes());
        cd.extend_from_slice(&[0u8; 8]);
        cd.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        cd.extend_from_slice(&(data.len() as u32).to_le_bytes());
        cd.extend_from_slice(&(name.len() as u16).to_le_bytes());
        cd.extend_from_slice(&[0u8; 12]);
        cd.extend_from_slice(&lfh_off.to_le_bytes());
        cd.extend_from_slice(name.as_bytes());
    }
    let cd_off = out.len() as u32;
    out.extend_from_slice(&cd);
    out.extend_from_slice(b"PK\x05\x06");
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(cd.len() as u32).to_le_bytes());
    out.extend_from_slice(&cd_off.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn config_in(tmp: &TempDir) -> EngineConfig {
    EngineConfig {
        temp_dir: Some(tmp.path().to_path_buf()),
        ..EngineConfig::default()
    }
}

fn engine_with(config: EngineConfig) -> Engine {
    Engine::builder()
        .config(config)
        .matcher(PatternMatcher::new().with_pattern("Test.Marker", MARKER))
        .build()
        .unwrap()
}

fn collect_all() -> ScanOptions {
    ScanOptions {
        match_mode: MatchMode::CollectAll,
        ..ScanOptions::default()
    }
}

fn dir_entries(path: &Path) -> usize {
    fs::read_dir(path).unwrap().count()
}

// -----------------------------
// Aggregation
// -----------------------------

#[test]
fn stop_first_halts_before_the_fourth_entry() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let bad = marker_payload("third");
    let archive = zip(
        &[
            ("one.txt", b"first harmless entry"),
            ("two.txt", b"second harmless entry"),
            ("three.bin", &bad),
            ("four.txt", b"fourth harmless entry"),
        ],
        ZipMode::Stored,
    );
    let report = engine.scan_bytes(&archive);
    assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));
    assert_eq!(report.stats.entries_extracted, 3);
    assert_eq!(report.stats.entries_seen, 3);
}

#[test]
fn collect_all_counts_nested_matches() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let inner = marker_payload("inner");
    let nested = tar(&[("x.txt", &inner)]);
    let outer = marker_payload("outer");
    let archive = zip(&[("a.bin", &outer), ("b.tar", &nested)], ZipMode::Deflated);

    let report = engine.scan_bytes_with(&archive, &collect_all());
    assert!(report.outcome.is_virus());
    // a.bin, x.txt inside b.tar, and b.tar's own raw bytes.
    assert_eq!(report.match_count, 3);
    assert_eq!(report.stats.entries_extracted, 3);
    assert!(report.matches.iter().any(|m| m.depth == 2));
}

#[test]
fn nested_gzip_in_tar_is_found() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let inner = gzip(&marker_payload("deep"));
    let archive = gzip(&tar(&[("readme.txt", b"nothing to see here"), ("inner.gz", &inner)]));
    let report = engine.scan_bytes(&archive);
    assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));
    assert_eq!(report.stats.max_depth, 3);
}

// -----------------------------
// Cache and tiny objects
// -----------------------------

#[test]
fn identical_content_hits_the_cache() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let archive = gzip(&tar(&[("clean.txt", b"clean content for caching")]));

    let first = engine.scan_bytes(&archive);
    assert!(first.outcome.is_clean());
    assert!(first.stats.bytes_extracted > 0);

    let second = engine.scan_bytes(&archive);
    assert!(second.outcome.is_clean());
    assert_eq!(second.stats.cache_hits, 1);
    assert_eq!(second.stats.bytes_extracted, 0);
    assert_eq!(second.stats.handlers_invoked, 0);

    engine.cache().clear();
    assert!(engine.cache().is_empty());
    let third = engine.scan_bytes(&archive);
    assert_eq!(third.stats.cache_hits, 0);
    assert!(third.stats.bytes_extracted > 0);
}

#[test]
fn metadata_collection_bypasses_the_cache() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let archive = tar(&[("a.txt", b"first clean entry"), ("b.txt", b"second clean entry")]);
    let options = ScanOptions {
        collect_metadata: true,
        ..ScanOptions::default()
    };
    for _ in 0..2 {
        let report = engine.scan_bytes_with(&archive, &options);
        assert_eq!(report.stats.cache_hits, 0);
        assert_eq!(report.objects.len(), 3);
        let names: Vec<_> = report.objects.iter().filter_map(|o| o.name.as_deref()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert!(report.objects.iter().any(|o| o.file_type == FileType::Tar && o.depth == 0));
    }
}

struct CountingDetector(Arc<AtomicUsize>);

impl TypeDetector for CountingDetector {
    fn detect(&self, head: &[u8]) -> FileType {
        self.0.fetch_add(1, Ordering::Relaxed);
        MagicDetector.detect(head)
    }
}

#[test]
fn tiny_objects_skip_detection() {
    let tmp = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Engine::builder()
        .config(config_in(&tmp))
        .detector(CountingDetector(Arc::clone(&calls)))
        .build()
        .unwrap();

    assert!(engine.scan_bytes(b"abcde").outcome.is_clean());
    assert_eq!(calls.load(Ordering::Relaxed), 0);

    let archive = tar(&[("t.bin", b"abc")]);
    assert!(engine.scan_bytes(&archive).outcome.is_clean());
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

// -----------------------------
// Encryption and limits
// -----------------------------

#[test]
fn encrypted_entries_raise_a_heuristic_only_when_enabled() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let archive = zip(&[("secret.doc", b"opaque ciphertext bytes")], ZipMode::Encrypted);

    let report = engine.scan_bytes(&archive);
    assert!(report.outcome.is_clean());
    assert_eq!(report.stats.entries_skipped(EntrySkipReason::Encrypted), 1);

    let options = ScanOptions {
        alert_encrypted: true,
        ..ScanOptions::default()
    };
    let report = engine.scan_bytes_with(&archive, &options);
    assert_eq!(report.outcome.virus_name(), Some("Heuristics.Encrypted.Zip"));
    assert!(report.possibly_unwanted);
}

#[test]
fn oversized_entry_stops_extraction_and_keeps_earlier_matches() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_in(&tmp);
    config.limits = LimitsConfig {
        max_scan_size: 2048,
        max_file_size: 0,
        ..LimitsConfig::default()
    };
    let engine = engine_with(config);
    let bad = marker_payload("early");
    let big = vec![0u8; 64 * 1024];
    let archive = zip(&[("a.bin", &bad), ("big.bin", &big)], ZipMode::Deflated);

    let report = engine.scan_bytes_with(&archive, &collect_all());
    assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));
    assert_eq!(report.match_count, 1);
    assert!(report.limits_exceeded);
    assert_eq!(report.stats.entries_skipped(EntrySkipReason::TooLarge), 1);
    assert!(report.stats.limit_hits(LimitReason::ScanSize) >= 1);
}

#[test]
fn preferred_limit_heuristic_halts_like_a_signature() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_in(&tmp);
    config.limits = LimitsConfig {
        max_scan_size: 2048,
        max_file_size: 0,
        ..LimitsConfig::default()
    };
    let engine = engine_with(config);
    let big = vec![0u8; 64 * 1024];
    let bad = marker_payload("late");
    let archive = zip(&[("big.bin", &big), ("bad.bin", &bad)], ZipMode::Deflated);
    let options = ScanOptions {
        alert_exceeds_max: true,
        prefer_heuristics: true,
        ..ScanOptions::default()
    };

    let report = engine.scan_bytes_with(&archive, &options);
    assert_eq!(
        report.outcome.virus_name(),
        Some("Heuristics.Limits.Exceeded.MaxScanSize")
    );
    assert_eq!(report.match_count, 1);
    assert_eq!(report.stats.entries_extracted, 0);
    assert_eq!(report.stats.entries_skipped(EntrySkipReason::TooLarge), 1);
}

#[test]
fn limit_heuristic_fires_once_per_reason() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_in(&tmp);
    config.limits.max_recursion = 1;
    let engine = engine_with(config);
    let archive = tar(&[
        ("a.gz", &gzip(b"first nested payload")),
        ("b.gz", &gzip(b"second nested payload")),
    ]);
    let options = ScanOptions {
        alert_exceeds_max: true,
        match_mode: MatchMode::CollectAll,
        ..ScanOptions::default()
    };
    let report = engine.scan_bytes_with(&archive, &options);
    assert_eq!(
        report.outcome.virus_name(),
        Some("Heuristics.Limits.Exceeded.MaxRecursion")
    );
    assert_eq!(report.match_count, 1);
    assert_eq!(report.stats.limit_hits(LimitReason::Recursion), 2);
}

#[test]
fn max_recursion_bounds_descent() {
    let tmp = TempDir::new().unwrap();
    let triple = gzip(&gzip(&gzip(&marker_payload("bottom"))));

    let mut config = config_in(&tmp);
    config.limits.max_recursion = 2;
    let report = engine_with(config).scan_bytes(&triple);
    assert!(report.outcome.is_clean());
    assert!(report.limits_exceeded);
    assert_eq!(report.stats.max_depth, 2);

    let mut config = config_in(&tmp);
    config.limits.max_recursion = 3;
    let report = engine_with(config).scan_bytes(&triple);
    assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));
}

#[test]
fn corrupt_archive_is_clean() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let mut bytes = b"PK\x03\x04".to_vec();
    bytes.extend_from_slice(&[0x5a; 60]);
    let report = engine.scan_bytes(&bytes);
    assert!(report.outcome.is_clean());
    assert_eq!(report.stats.format_errors(FormatErrorKind::Malformed), 1);
}

#[test]
fn corrupt_archive_still_gets_a_raw_pass() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let mut bytes = b"PK\x03\x04 broken ".to_vec();
    bytes.extend_from_slice(MARKER);
    let report = engine.scan_bytes(&bytes);
    assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));
}

// -----------------------------
// Deadline
// -----------------------------

/// Blocks in `post_scan` of one named object until the deadline passes.
struct StallUntil {
    name: &'static str,
    deadline: Instant,
}

impl ScanHooks for StallUntil {
    fn post_scan(&self, obj: &ObjectInfo<'_>, _result: Status, _matched: bool) -> HookVerdict {
        if obj.name == Some(self.name) {
            let left = self.deadline.saturating_duration_since(Instant::now());
            thread::sleep(left + Duration::from_millis(5));
        }
        HookVerdict::Proceed
    }
}

fn scan_with_deadline(archive: &[u8], options: ScanOptions) -> ScanReport {
    let tmp = TempDir::new().unwrap();
    let deadline = Instant::now() + Duration::from_millis(300);
    let engine = Engine::builder()
        .config(config_in(&tmp))
        .matcher(PatternMatcher::new().with_pattern("Test.Marker", MARKER))
        .hooks(StallUntil {
            name: "slow.txt",
            deadline,
        })
        .build()
        .unwrap();
    let limiter =
        ResourceLimiter::new(&engine.config().limits, Instant::now()).with_deadline(Some(deadline));
    let mut ctx = ScanContext::new(&engine, options, None)
        .unwrap()
        .with_limiter(limiter);
    let result = ctx.scan_view(&ByteView::copy_from_slice(archive), FileType::Any);
    ctx.finish(result)
}

#[test]
fn deadline_aborts_extraction_with_timeout() {
    let archive = zip(
        &[
            ("one.txt", b"first harmless entry"),
            ("slow.txt", b"entry that stalls the session"),
            ("three.txt", b"never extracted entry"),
            ("four.txt", b"never extracted either"),
        ],
        ZipMode::Stored,
    );
    let report = scan_with_deadline(&archive, ScanOptions::default());
    assert_eq!(report.outcome, ScanOutcome::Error(ErrorKind::Timeout));
    assert_eq!(report.stats.entries_extracted, 2);
    assert_eq!(report.match_count, 0);
}

#[test]
fn deadline_after_a_match_reports_the_match() {
    let bad = marker_payload("early");
    let archive = zip(
        &[
            ("bad.bin", &bad),
            ("slow.txt", b"entry that stalls the session"),
            ("three.txt", b"never extracted entry"),
        ],
        ZipMode::Deflated,
    );
    let report = scan_with_deadline(&archive, collect_all());
    assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));
    assert_eq!(report.match_count, 1);
    assert_eq!(report.stats.entries_extracted, 2);
}

// -----------------------------
// Hooks
// -----------------------------

struct NameHooks;

impl ScanHooks for NameHooks {
    fn pre_scan(&self, obj: &ObjectInfo<'_>) -> HookVerdict {
        match obj.name {
            Some("flagged.txt") => HookVerdict::Blacklist,
            _ => HookVerdict::Proceed,
        }
    }

    fn post_scan(&self, obj: &ObjectInfo<'_>, _result: Status, matched: bool) -> HookVerdict {
        match obj.name {
            Some("trusted.bin") if matched => HookVerdict::Whitelist,
            _ => HookVerdict::Proceed,
        }
    }
}

#[test]
fn hooks_blacklist_and_whitelist() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::builder()
        .config(config_in(&tmp))
        .matcher(PatternMatcher::new().with_pattern("Test.Marker", MARKER))
        .hooks(NameHooks)
        .build()
        .unwrap();

    let flagged = gzip_named("flagged.txt", b"perfectly ordinary text");
    let report = engine.scan_bytes(&flagged);
    assert_eq!(report.outcome.virus_name(), Some("Detected.By.Callback"));

    let trusted = gzip_named("trusted.bin", &marker_payload("vetted"));
    let report = engine.scan_bytes(&trusted);
    assert!(report.outcome.is_clean());
    assert_eq!(report.match_count, 0);
}

// -----------------------------
// Sessions, temp storage, files
// -----------------------------

#[test]
fn temp_tree_is_removed_unless_retained() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let archive = tar(&[("a.txt", b"first clean entry"), ("b.txt", b"second clean entry")]);

    let report = engine.scan_bytes(&archive);
    assert!(report.outcome.is_clean());
    assert_eq!(dir_entries(tmp.path()), 0);

    let options = ScanOptions {
        retain_temps: true,
        collect_metadata: true,
        ..ScanOptions::default()
    };
    let report = engine.scan_bytes_with(&archive, &options);
    assert!(report.outcome.is_clean());
    let sessions: Vec<_> = fs::read_dir(tmp.path()).unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(sessions.len(), 1);
    let session = sessions[0].file_name().to_string_lossy().into_owned();
    assert!(session.contains("-scantemp-"), "{session}");
    let tar_dirs: Vec<_> = fs::read_dir(sessions[0].path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(tar_dirs.len(), 1);
    assert_eq!(dir_entries(&tar_dirs[0]), 2);
}

#[test]
fn files_and_directories_are_scanned() {
    let tmp = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let engine = engine_with(config_in(&scratch));

    let root = tmp.path().join("tree");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("clean.txt"), b"nothing interesting in here").unwrap();
    fs::write(root.join("sub").join("bad.gz"), gzip(&marker_payload("file"))).unwrap();

    assert!(engine.scan_file(&root.join("clean.txt")).outcome.is_clean());
    let report = engine.scan_file(&root.join("sub").join("bad.gz"));
    assert_eq!(report.outcome.virus_name(), Some("Test.Marker"));

    let report = engine.scan_dir_with(&root, &collect_all());
    assert_eq!(report.match_count, 1);
    assert!(report.outcome.is_virus());
}

#[test]
fn sessions_share_one_engine_across_threads() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let bad = gzip(&marker_payload("threaded"));
    let good = gzip(b"a clean payload for every thread");

    std::thread::scope(|s| {
        for i in 0..8 {
            let engine = &engine;
            let (bad, good) = (&bad, &good);
            s.spawn(move || {
                for _ in 0..4 {
                    if i % 2 == 0 {
                        assert!(engine.scan_bytes(bad).outcome.is_virus());
                    } else {
                        assert!(engine.scan_bytes(good).outcome.is_clean());
                    }
                }
            });
        }
    });
    assert!(engine.cache().counters().hits > 0);
    assert_eq!(dir_entries(tmp.path()), 0);
}

#[test]
fn raw_only_skips_handlers() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(config_in(&tmp));
    let archive = gzip(&marker_payload("hidden"));
    let options = ScanOptions {
        raw_only: true,
        ..ScanOptions::default()
    };
    let report = engine.scan_bytes_with(&archive, &options);
    assert!(report.outcome.is_clean());
    assert_eq!(report.stats.handlers_invoked, 0);
}

#[test]
fn config_round_trips_through_json() {
    let mut config = EngineConfig::default();
    config.limits.max_recursion = 9;
    config.options.match_mode = MatchMode::CollectAll;
    config.options.alert_encrypted = true;
    let json = serde_json::to_string(&config).unwrap();
    let back: EngineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);

    let partial: EngineConfig =
        serde_json::from_str(r#"{"limits":{"max_recursion":4}}"#).unwrap();
    assert_eq!(partial.limits.max_recursion, 4);
    assert_eq!(partial.limits.max_files, LimitsConfig::default().max_files);
    partial.validate().unwrap();
}
