//! Bounded, offset-addressable read views over scan input.
//!
//! A `ByteView` is backed by either an mmap of a file or shared in-memory
//! bytes. Sub-views share the backing storage; narrowing never copies.
//!
//! # Invariants
//! - `start + len` never exceeds the backing length.
//! - A sub-view's length is truncated to what remains in its parent; it is
//!   never extended.
//! - `path()` is only set on views that cover an entire file, so handlers
//!   that need a real file can reuse it instead of writing a copy.
//!
//! Clones are cheap: backing bytes are reference-counted and immutable for
//! the lifetime of every view over them.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::cache::CacheKey;

#[derive(Clone)]
enum Backing {
    Owned(Arc<[u8]>),
    Mapped(Arc<Mmap>),
}

impl Backing {
    #[inline(always)]
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Owned(bytes) => bytes,
            Backing::Mapped(map) => map.as_ref(),
        }
    }
}

/// Read-only window over scan input.
#[derive(Clone)]
pub struct ByteView {
    backing: Backing,
    start: usize,
    len: usize,
    name: Option<Arc<str>>,
    path: Option<Arc<Path>>,
}

impl ByteView {
    /// Wrap shared, in-memory bytes.
    #[must_use]
    pub fn from_arc(bytes: Arc<[u8]>) -> Self {
        let len = bytes.len();
        Self {
            backing: Backing::Owned(bytes),
            start: 0,
            len,
            name: None,
            path: None,
        }
    }

    /// Wrap owned bytes.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::from_arc(Arc::from(bytes))
    }

    /// Copy a borrowed slice into a new view.
    #[must_use]
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self::from_arc(Arc::from(bytes))
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::from_arc(Arc::from(&[][..]))
    }

    /// Map a file read-only.
    ///
    /// Empty files cannot be mapped and are represented by an empty owned
    /// view that still remembers its path.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut view = if file_len == 0 {
            Self::empty()
        } else {
            // SAFETY: read-only mapping; scan inputs and extracted temp files
            // are not modified while a session holds a view over them.
            let map = unsafe { Mmap::map(&file)? };
            let len = map.len();
            Self {
                backing: Backing::Mapped(Arc::new(map)),
                start: 0,
                len,
                name: None,
                path: None,
            }
        };
        view.path = Some(Arc::from(path));
        if let Some(base) = path.file_name() {
            view.name = Some(Arc::from(base.to_string_lossy().as_ref()));
        }
        Ok(view)
    }

    /// Attach a display name (entry name, original basename).
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(Arc::from(name));
        self
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Backing file, only for views that cover a whole file.
    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.backing.bytes()[self.start..self.start + self.len]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this view within its backing storage.
    #[inline]
    pub fn origin_offset(&self) -> u64 {
        self.start as u64
    }

    /// Exactly `len` bytes at `offset`, or `None` if any of them is out of
    /// bounds.
    #[inline]
    pub fn need(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.as_slice().get(offset..end)
    }

    /// Up to `len` leading bytes.
    #[inline]
    pub fn head(&self, len: usize) -> &[u8] {
        &self.as_slice()[..len.min(self.len)]
    }

    /// Narrow to `[offset, offset + len)` without copying.
    ///
    /// `len == 0` means "to the end". Lengths running past the end are
    /// truncated. Returns `None` when `offset` is at or past the end.
    pub fn sub_view(&self, offset: usize, len: usize) -> Option<ByteView> {
        if offset >= self.len {
            return None;
        }
        let remaining = self.len - offset;
        let len = if len == 0 { remaining } else { len.min(remaining) };
        Some(ByteView {
            backing: self.backing.clone(),
            start: self.start + offset,
            len,
            name: None,
            path: if offset == 0 && len == self.len {
                self.path.clone()
            } else {
                None
            },
        })
    }

    /// Content digest of the whole view.
    #[inline]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::of(self.as_slice())
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteView")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("name", &self.name)
            .field("path", &self.path)
            .field(
                "backing",
                &match self.backing {
                    Backing::Owned(_) => "owned",
                    Backing::Mapped(_) => "mapped",
                },
            )
            .finish()
    }
}
