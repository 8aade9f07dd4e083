//! tar handler.
//!
//! # Invariants
//! - Parsing is sequential over 512-byte blocks; no offset ever moves
//!   backwards.
//! - Size fields are untrusted; overflow or a bad checksum is malformed.
//! - GNU longname (`L`) and PAX `path=` overrides apply to the next real
//!   entry only. Global PAX headers (`g`) are consumed, not applied.
//!
//! # Design Notes
//! - This is a scanner-oriented walker, not a general extraction library.
//! - An unreadable first header means the object is not a tar archive at
//!   all and is reported as a format error; later damage only ends the walk.

use std::io::Write;

use crate::context::ScanContext;
use crate::dispatch::Handler;
use crate::error::ScanError;
use crate::extract::{run_extraction_loop, EntryHeader, EntryIterator, Step};
use crate::filetype::FileType;
use crate::outcome::{FormatErrorKind, Status};
use crate::view::ByteView;

pub const TAR_BLOCK_LEN: usize = 512;
pub const USTAR_MAGIC_OFFSET: usize = 257;

const NAME_RANGE: std::ops::Range<usize> = 0..100;
const SIZE_RANGE: std::ops::Range<usize> = 124..136;
const CHKSUM_RANGE: std::ops::Range<usize> = 148..156;
const TYPEFLAG_OFFSET: usize = 156;
const PREFIX_RANGE: std::ops::Range<usize> = 345..500;
const LONGNAME_MAX: usize = 4096;

#[inline(always)]
pub fn is_ustar_header(header: &[u8]) -> bool {
    header.len() >= TAR_BLOCK_LEN && &header[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5] == b"ustar"
}

/// Handler for `FileType::Tar`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TarHandler;

impl Handler for TarHandler {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn scan(&self, ctx: &mut ScanContext<'_>, view: &ByteView) -> Result<Status, ScanError> {
        let bytes = view.as_slice();
        let valid = bytes
            .get(..TAR_BLOCK_LEN)
            .is_some_and(|hdr| checksum_ok(hdr));
        if !valid {
            return Ok(Status::Format(FormatErrorKind::Malformed));
        }
        let mut entries = TarEntries::new(bytes);
        run_extraction_loop(ctx, FileType::Tar, &mut entries)
    }
}

#[derive(Clone, Copy, Debug)]
struct Current {
    data_start: usize,
    size: u64,
    next: usize,
}

/// Entry walker over an in-memory tar image.
pub struct TarEntries<'a> {
    bytes: &'a [u8],
    pos: usize,
    current: Option<Current>,
    gnu_longname: Option<String>,
    pax_path: Option<String>,
}

impl<'a> TarEntries<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            current: None,
            gnu_longname: None,
            pax_path: None,
        }
    }

    fn payload(&self, data_start: usize, size: u64) -> &'a [u8] {
        let end = usize::try_from(size)
            .ok()
            .and_then(|s| data_start.checked_add(s))
            .unwrap_or(usize::MAX)
            .min(self.bytes.len());
        self.bytes.get(data_start..end).unwrap_or(&[])
    }
}

impl EntryIterator for TarEntries<'_> {
    fn peek_header(&mut self) -> Step<EntryHeader> {
        loop {
            let Some(hdr) = self
                .pos
                .checked_add(TAR_BLOCK_LEN)
                .and_then(|end| self.bytes.get(self.pos..end))
            else {
                return Step::NoMoreEntries;
            };
            if hdr.iter().all(|&b| b == 0) {
                return Step::NoMoreEntries;
            }
            if !checksum_ok(hdr) {
                return Step::Error(FormatErrorKind::Malformed);
            }
            let Some(size) = parse_octal(&hdr[SIZE_RANGE]) else {
                return Step::Error(FormatErrorKind::Malformed);
            };
            let data_start = self.pos + TAR_BLOCK_LEN;
            let Some(next) = padded(size).and_then(|p| data_start.checked_add(p)) else {
                return Step::Error(FormatErrorKind::Malformed);
            };

            let typeflag = hdr[TYPEFLAG_OFFSET];
            match typeflag {
                b'L' => {
                    let raw = self.payload(data_start, size);
                    let raw = &raw[..raw.len().min(LONGNAME_MAX)];
                    self.gnu_longname = Some(lossy(cstr(raw)));
                    self.pos = next;
                    continue;
                }
                b'x' => {
                    self.pax_path = pax_path(self.payload(data_start, size));
                    self.pos = next;
                    continue;
                }
                b'g' => {
                    self.pos = next;
                    continue;
                }
                _ => {}
            }

            let name = self
                .pax_path
                .take()
                .or_else(|| self.gnu_longname.take())
                .unwrap_or_else(|| ustar_name(hdr));
            let is_dir = typeflag == b'5' || name.ends_with('/');
            self.current = Some(Current {
                data_start,
                size,
                next,
            });
            return Step::Ok(EntryHeader {
                name: Some(name),
                packed_size: size,
                unpacked_size: size,
                crc32: None,
                encrypted: false,
                is_dir,
            });
        }
    }

    fn skip(&mut self) -> Step<()> {
        match self.current.take() {
            Some(cur) => {
                self.pos = cur.next;
                Step::Ok(())
            }
            None => Step::Error(FormatErrorKind::Malformed),
        }
    }

    fn extract(&mut self, out: &mut dyn Write) -> Step<()> {
        let Some(cur) = self.current.take() else {
            return Step::Error(FormatErrorKind::Malformed);
        };
        self.pos = cur.next;
        let data = self.payload(cur.data_start, cur.size);
        if out.write_all(data).is_err() {
            return Step::Error(FormatErrorKind::Truncated);
        }
        if (data.len() as u64) < cur.size {
            return Step::Error(FormatErrorKind::Truncated);
        }
        Step::Ok(())
    }
}

/// Header checksum: unsigned (or historic signed) byte sum with the
/// checksum field read as spaces.
fn checksum_ok(hdr: &[u8]) -> bool {
    let Some(stored) = parse_octal(&hdr[CHKSUM_RANGE]) else {
        return false;
    };
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in hdr[..TAR_BLOCK_LEN].iter().enumerate() {
        let b = if CHKSUM_RANGE.contains(&i) { b' ' } else { b };
        unsigned += u64::from(b);
        signed += i64::from(b as i8);
    }
    stored == unsigned || i64::try_from(stored).is_ok_and(|s| s == signed)
}

fn padded(size: u64) -> Option<usize> {
    let block = TAR_BLOCK_LEN as u64;
    let rounded = size.checked_add(block - 1)? / block * block;
    usize::try_from(rounded).ok()
}

/// NUL/space padded octal. An empty field is zero.
fn parse_octal(field: &[u8]) -> Option<u64> {
    let mut digits = field
        .iter()
        .skip_while(|&&b| b == b' ' || b == 0)
        .take_while(|&&b| (b'0'..=b'7').contains(&b))
        .peekable();
    if digits.peek().is_none() {
        return Some(0);
    }
    let mut v: u64 = 0;
    for &d in digits {
        v = v.checked_mul(8)?.checked_add(u64::from(d - b'0'))?;
    }
    Some(v)
}

fn ustar_name(hdr: &[u8]) -> String {
    let name = cstr(&hdr[NAME_RANGE]);
    let prefix = cstr(&hdr[PREFIX_RANGE]);
    if is_ustar_header(hdr) && !prefix.is_empty() {
        let mut full = lossy(prefix);
        if !full.ends_with('/') {
            full.push('/');
        }
        full.push_str(&lossy(name));
        return full;
    }
    lossy(name)
}

fn pax_path(mut records: &[u8]) -> Option<String> {
    let mut path = None;
    while !records.is_empty() {
        let space = memchr::memchr(b' ', records)?;
        let len: usize = std::str::from_utf8(&records[..space]).ok()?.parse().ok()?;
        if len <= space || len > records.len() {
            return path;
        }
        let rec = &records[space + 1..len];
        let rec = rec.strip_suffix(b"\n").unwrap_or(rec);
        if let Some(value) = rec.strip_prefix(b"path=") {
            path = Some(lossy(value));
        }
        records = &records[len..];
    }
    path
}

#[inline]
fn cstr(field: &[u8]) -> &[u8] {
    match memchr::memchr(0, field) {
        Some(i) => &field[..i],
        None => field,
    }
}

#[inline]
fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
