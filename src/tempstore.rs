//! Per-session temporary storage.
//!
//! # Invariants
//! - Every session owns exactly one temp directory; no two sessions share a
//!   subtree.
//! - Without retention, the directory and everything written under it is
//!   removed when the session ends, on every exit path.
//! - An `EntrySink` never holds more than its cap; overflow truncates and is
//!   reported, never silently dropped.
//!
//! # Design Notes
//! - Directory names are `<YYYYMMDD_HHMMSS>-<basename|scantemp>-<random>`
//!   so retained trees can be matched to the scanned object.
//! - Extracted entries stay in memory unless the session forces them to
//!   disk (or retains temporaries); disk entries are mapped, not re-read.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile, TempDir, TempPath};

use crate::error::ScanError;
use crate::view::ByteView;

/// Prefix used when the scanned object has no usable basename.
pub const DEFAULT_BASENAME: &str = "scantemp";
const MAX_BASENAME_LEN: usize = 32;

/// Session temp directory.
#[derive(Debug)]
pub struct SessionTemp {
    dir: Option<TempDir>,
    root: PathBuf,
    retain: bool,
}

impl SessionTemp {
    /// Create the session directory under `base`.
    pub fn create(base: &Path, basename: Option<&str>, retain: bool) -> Result<Self, ScanError> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let label = basename
            .map(sanitize_basename)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BASENAME.to_string());
        let prefix = format!("{stamp}-{label}-");
        let dir = Builder::new()
            .prefix(&prefix)
            .keep(retain)
            .tempdir_in(base)
            .map_err(|source| ScanError::TempStorage {
                path: base.to_path_buf(),
                source,
            })?;
        let root = dir.path().to_path_buf();
        log::trace!("session temp dir {}", root.display());
        Ok(Self {
            dir: Some(dir),
            root,
            retain,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn retains(&self) -> bool {
        self.retain
    }

    /// Directory for one container's extracted entries.
    ///
    /// Only retained sessions get per-container directories; otherwise the
    /// session root is used directly.
    pub fn container_dir(&self, label: &str) -> Result<PathBuf, ScanError> {
        if !self.retain {
            return Ok(self.root.clone());
        }
        let dir = Builder::new()
            .prefix(&format!("{label}-"))
            .keep(true)
            .tempdir_in(&self.root)
            .map_err(|source| ScanError::TempStorage {
                path: self.root.clone(),
                source,
            })?;
        Ok(dir.path().to_path_buf())
    }

    /// Remove a per-container directory if nothing was left in it.
    pub fn leave_container_dir(&self, dir: &Path) {
        if dir == self.root {
            return;
        }
        // Fails on non-empty directories, which is what retention wants.
        let _ = fs::remove_dir(dir);
    }

    /// Write `bytes` to a file under `dir`, kept only for retained sessions.
    pub fn persist(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, ScanError> {
        let mut file = Builder::new()
            .prefix(&format!("{name}-"))
            .tempfile_in(dir)
            .map_err(|source| ScanError::TempStorage {
                path: dir.to_path_buf(),
                source,
            })?;
        file.write_all(bytes).map_err(ScanError::Write)?;
        // Reclaimed with the session directory unless retained.
        let (_, path) = file.keep().map_err(|e| ScanError::Write(e.error))?;
        log::trace!("persisted {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Sink for one extracted entry, capped at `cap` bytes.
    pub fn entry_sink(&self, dir: &Path, to_disk: bool, cap: u64) -> Result<EntrySink, ScanError> {
        let store = if to_disk {
            let file = Builder::new()
                .prefix("entry-")
                .tempfile_in(dir)
                .map_err(|source| ScanError::TempStorage {
                    path: dir.to_path_buf(),
                    source,
                })?;
            SinkStore::Disk(BufWriter::new(file))
        } else {
            SinkStore::Memory(Vec::new())
        };
        Ok(EntrySink {
            store,
            cap,
            written: 0,
            truncated: false,
            failure: None,
            retain: self.retain,
        })
    }
}

impl Drop for SessionTemp {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if self.retain {
            log::debug!("retaining session temp dir {}", self.root.display());
            return;
        }
        if let Err(e) = dir.close() {
            log::warn!("failed to remove temp dir {}: {e}", self.root.display());
        }
    }
}

/// Keep `[A-Za-z0-9._-]`, at most 32 characters.
pub fn sanitize_basename(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(MAX_BASENAME_LEN)
        .collect()
}

enum SinkStore {
    Memory(Vec<u8>),
    Disk(BufWriter<NamedTempFile>),
}

enum SinkFailure {
    Memory(u64),
    Io(io::Error),
}

/// Bounded destination for one extracted entry.
///
/// Extractors write into it through `io::Write`. Hitting the cap makes the
/// next write fail; the sink remembers that it truncated so the caller can
/// tell a size limit from a decode error.
pub struct EntrySink {
    store: SinkStore,
    cap: u64,
    written: u64,
    truncated: bool,
    failure: Option<SinkFailure>,
    retain: bool,
}

impl EntrySink {
    #[inline]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The cap cut the entry short.
    #[inline]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// A storage error (not the cap) stopped a write; `finish` reports it.
    #[inline]
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    #[inline]
    pub fn is_on_disk(&self) -> bool {
        matches!(self.store, SinkStore::Disk(_))
    }

    /// Turn the written bytes into a scannable view.
    ///
    /// Storage errors recorded while writing surface here as fatal errors.
    pub fn finish(self, name: Option<&str>) -> Result<MaterializedEntry, ScanError> {
        match self.failure {
            Some(SinkFailure::Memory(requested)) => {
                return Err(ScanError::OutOfMemory { requested })
            }
            Some(SinkFailure::Io(e)) => return Err(ScanError::Write(e)),
            None => {}
        }
        let (view, guard) = match self.store {
            SinkStore::Memory(bytes) => (ByteView::from_vec(bytes), None),
            SinkStore::Disk(writer) => {
                let file = writer
                    .into_inner()
                    .map_err(|e| ScanError::Write(e.into_error()))?;
                if self.retain {
                    let (_, path) = file.keep().map_err(|e| ScanError::Write(e.error))?;
                    let view = ByteView::open(&path).map_err(ScanError::Write)?;
                    (view, None)
                } else {
                    let path = file.into_temp_path();
                    let view = ByteView::open(&path).map_err(ScanError::Write)?;
                    (view, Some(path))
                }
            }
        };
        let view = match name {
            Some(name) => view.with_name(name),
            None => view,
        };
        Ok(MaterializedEntry {
            view,
            _guard: guard,
        })
    }
}

impl Write for EntrySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let room = self.cap.saturating_sub(self.written);
        if room == 0 {
            self.truncated = true;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "entry size limit reached",
            ));
        }
        let n = usize::try_from(room).map_or(buf.len(), |r| r.min(buf.len()));
        match &mut self.store {
            SinkStore::Memory(bytes) => {
                if bytes.try_reserve(n).is_err() {
                    self.failure = Some(SinkFailure::Memory(n as u64));
                    return Err(io::Error::from(io::ErrorKind::OutOfMemory));
                }
                bytes.extend_from_slice(&buf[..n]);
            }
            SinkStore::Disk(file) => {
                if let Err(e) = file.write_all(&buf[..n]) {
                    let kind = e.kind();
                    self.failure = Some(SinkFailure::Io(e));
                    return Err(io::Error::from(kind));
                }
            }
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.store {
            SinkStore::Memory(_) => Ok(()),
            SinkStore::Disk(file) => file.flush(),
        }
    }
}

/// An extracted entry ready to scan.
///
/// Holds the temp file (if any) alive until the entry's scan is done.
pub struct MaterializedEntry {
    pub view: ByteView,
    _guard: Option<TempPath>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_dir_is_named_and_removed() {
        let base = tempfile::tempdir().unwrap();
        let root = {
            let temp = SessionTemp::create(base.path(), Some("evil sample.exe"), false).unwrap();
            let name = temp.path().file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.contains("-evilsample.exe-"), "{name}");
            assert_eq!(name.as_bytes()[8], b'_');
            temp.path().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn retained_session_survives() {
        let base = tempfile::tempdir().unwrap();
        let root = {
            let temp = SessionTemp::create(base.path(), None, true).unwrap();
            let dir = temp.container_dir("zip").unwrap();
            temp.persist(&dir, "comment", b"hello").unwrap();
            let empty = temp.container_dir("tar").unwrap();
            temp.leave_container_dir(&empty);
            assert!(!empty.exists());
            temp.leave_container_dir(&dir);
            assert!(dir.exists());
            temp.path().to_path_buf()
        };
        assert!(root.exists());
        assert!(root
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains(DEFAULT_BASENAME));
    }

    #[test]
    fn missing_base_is_temp_storage_error() {
        let base = tempfile::tempdir().unwrap();
        let missing = base.path().join("nope");
        let err = SessionTemp::create(&missing, None, false).unwrap_err();
        assert!(matches!(err, ScanError::TempStorage { .. }));
    }

    #[test]
    fn sink_caps_and_reports_truncation() {
        let base = tempfile::tempdir().unwrap();
        let temp = SessionTemp::create(base.path(), None, false).unwrap();
        for to_disk in [false, true] {
            let mut sink = temp.entry_sink(temp.path(), to_disk, 4).unwrap();
            assert!(sink.write_all(b"abcdef").is_err());
            assert!(sink.truncated());
            assert_eq!(sink.written(), 4);
            assert_eq!(sink.is_on_disk(), to_disk);
            let entry = sink.finish(Some("x")).unwrap();
            assert_eq!(entry.view.as_slice(), b"abcd");
            assert_eq!(entry.view.name(), Some("x"));
        }
    }

    #[test]
    fn basename_is_sanitized() {
        assert_eq!(sanitize_basename("a/b c$d.txt"), "abcd.txt");
        assert_eq!(sanitize_basename(&"x".repeat(50)).len(), 32);
    }
}
