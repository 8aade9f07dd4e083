//! zip sniff helpers + Zip32 entry walker.
//!
//! # Invariants
//! - All sizes/offsets are untrusted and validated against the view length.
//! - Central directory parsing is sequential; local headers are only read
//!   for entries that are extracted.
//!
//! # Supported
//! - Zip32 (EOCD + central directory).
//! - Entries: stored (method 0) and deflate (method 8).
//! - Encrypted entries are reported as such (flag bit 0) and never decoded.
//!
//! # Not Supported
//! - Zip64 (sentinel 0xFFFF/0xFFFFFFFF fields).
//! - Multi-disk archives.

use std::io::{self, Write};

use flate2::read::DeflateDecoder;

use crate::context::ScanContext;
use crate::dispatch::Handler;
use crate::error::ScanError;
use crate::extract::{run_extraction_loop, Comment, EntryHeader, EntryIterator, Step};
use crate::filetype::FileType;
use crate::outcome::{FormatErrorKind, Status};
use crate::view::ByteView;

/// ZIP signatures are `PK..`.
///
/// Common ones:
/// - Local file header:      PK 03 04
/// - Central directory:      PK 01 02
/// - End of central dir:     PK 05 06
/// - Data descriptor:        PK 07 08
#[inline(always)]
pub fn is_zip_magic(header: &[u8]) -> bool {
    if header.len() < 4 {
        return false;
    }
    if header[0] != b'P' || header[1] != b'K' {
        return false;
    }
    matches!((header[2], header[3]), (1, 2) | (3, 4) | (5, 6) | (7, 8))
}

const SIG_EOCD: u32 = 0x0605_4b50;
const SIG_CDFH: u32 = 0x0201_4b50;
const SIG_LFH: u32 = 0x0403_4b50;

const EOCD_MIN_LEN: usize = 22;
const EOCD_SEARCH_MAX: usize = 66 * 1024; // 64 KiB comment + header margin

/// Central directory fixed header length.
const CDFH_LEN: usize = 46;
/// Local file header fixed length.
const LFH_LEN: usize = 30;

const FLAG_ENCRYPTED: u16 = 0x0001;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

/// Handler for `FileType::Zip`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZipHandler;

impl Handler for ZipHandler {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn scan(&self, ctx: &mut ScanContext<'_>, view: &ByteView) -> Result<Status, ScanError> {
        let mut entries = match ZipEntries::open(view.as_slice()) {
            Ok(entries) => entries,
            Err(kind) => return Ok(Status::Format(kind)),
        };
        run_extraction_loop(ctx, FileType::Zip, &mut entries)
    }
}

#[derive(Clone, Copy, Debug)]
struct Current {
    flags: u16,
    method: u16,
    compressed_size: u64,
    local_header_offset: usize,
}

/// Central-directory walker over an in-memory zip image.
pub struct ZipEntries<'a> {
    bytes: &'a [u8],
    cd_pos: usize,
    cd_end: usize,
    entries_total: u16,
    entries_seen: u16,
    comment: Option<Vec<u8>>,
    current: Option<Current>,
}

impl<'a> ZipEntries<'a> {
    /// Locate the end-of-central-directory record and validate its bounds.
    pub fn open(bytes: &'a [u8]) -> Result<Self, FormatErrorKind> {
        if bytes.len() < EOCD_MIN_LEN {
            return Err(FormatErrorKind::Malformed);
        }
        let win_off = bytes.len() - bytes.len().min(EOCD_SEARCH_MAX);
        let win = &bytes[win_off..];

        // Scan backward for a signature whose comment fits in the window;
        // a later match can be a false positive inside the comment itself.
        let mut end = win.len();
        let eocd_rel = loop {
            let Some(i) = rfind_sig(&win[..end], SIG_EOCD) else {
                return Err(FormatErrorKind::Malformed);
            };
            if i + EOCD_MIN_LEN <= win.len() {
                let comment_len = le_u16(&win[i + 20..]) as usize;
                if i + EOCD_MIN_LEN + comment_len <= win.len() {
                    break i;
                }
            }
            end = i + 3;
            if end < 4 {
                return Err(FormatErrorKind::Malformed);
            }
        };

        let eocd = &win[eocd_rel..];
        let disk_no = le_u16(&eocd[4..]);
        let cd_disk = le_u16(&eocd[6..]);
        let entries_disk = le_u16(&eocd[8..]);
        let entries_total = le_u16(&eocd[10..]);
        let cd_size = le_u32(&eocd[12..]);
        let cd_off = le_u32(&eocd[16..]);
        let comment_len = le_u16(&eocd[20..]) as usize;

        if disk_no != 0 || cd_disk != 0 || entries_disk != entries_total {
            return Err(FormatErrorKind::Unsupported);
        }
        if entries_total == 0xFFFF || cd_size == 0xFFFF_FFFF || cd_off == 0xFFFF_FFFF {
            return Err(FormatErrorKind::Unsupported);
        }

        let cd_off = cd_off as usize;
        let cd_end = cd_off.saturating_add(cd_size as usize);
        if cd_off > bytes.len() || cd_end > bytes.len() {
            return Err(FormatErrorKind::Malformed);
        }

        let comment = (comment_len > 0)
            .then(|| eocd[EOCD_MIN_LEN..EOCD_MIN_LEN + comment_len].to_vec());

        Ok(Self {
            bytes,
            cd_pos: cd_off,
            cd_end,
            entries_total,
            entries_seen: 0,
            comment,
            current: None,
        })
    }

    #[inline]
    pub fn entries_total(&self) -> u16 {
        self.entries_total
    }

    /// Payload slice of the current entry, after its local header.
    fn payload(&self, cur: &Current) -> Result<&'a [u8], FormatErrorKind> {
        let lfh = self
            .bytes
            .get(cur.local_header_offset..)
            .and_then(|rest| rest.get(..LFH_LEN))
            .ok_or(FormatErrorKind::Malformed)?;
        if le_u32(lfh) != SIG_LFH {
            return Err(FormatErrorKind::Malformed);
        }
        let name_len = le_u16(&lfh[26..]) as usize;
        let extra_len = le_u16(&lfh[28..]) as usize;
        let data_start = cur.local_header_offset + LFH_LEN + name_len + extra_len;
        let data_end = usize::try_from(cur.compressed_size)
            .ok()
            .and_then(|size| data_start.checked_add(size))
            .ok_or(FormatErrorKind::Malformed)?;
        if data_start > self.bytes.len() {
            return Err(FormatErrorKind::Malformed);
        }
        if data_end > self.bytes.len() {
            return Err(FormatErrorKind::Truncated);
        }
        Ok(&self.bytes[data_start..data_end])
    }
}

impl EntryIterator for ZipEntries<'_> {
    fn next_comment(&mut self) -> Option<Comment> {
        self.comment.take().map(|data| Comment {
            data,
            encrypted: false,
        })
    }

    fn peek_header(&mut self) -> Step<EntryHeader> {
        if self.entries_seen >= self.entries_total || self.cd_pos >= self.cd_end {
            return Step::NoMoreEntries;
        }
        let Some(hdr) = self
            .bytes
            .get(self.cd_pos..self.cd_end)
            .and_then(|cd| cd.get(..CDFH_LEN))
        else {
            return Step::Error(FormatErrorKind::Truncated);
        };
        if le_u32(hdr) != SIG_CDFH {
            return Step::Error(FormatErrorKind::Malformed);
        }
        self.entries_seen += 1;

        let flags = le_u16(&hdr[8..]);
        let method = le_u16(&hdr[10..]);
        let crc32 = le_u32(&hdr[16..]);
        let comp_size = le_u32(&hdr[20..]);
        let uncomp_size = le_u32(&hdr[24..]);
        let name_len = le_u16(&hdr[28..]) as usize;
        let extra_len = le_u16(&hdr[30..]) as usize;
        let comment_len = le_u16(&hdr[32..]) as usize;
        let lfh_off = le_u32(&hdr[42..]);

        let name_start = self.cd_pos + CDFH_LEN;
        let rec_end = name_start + name_len + extra_len + comment_len;
        if rec_end > self.cd_end {
            return Step::Error(FormatErrorKind::Truncated);
        }
        let name = &self.bytes[name_start..name_start + name_len];
        self.cd_pos = rec_end;

        if comp_size == 0xFFFF_FFFF || uncomp_size == 0xFFFF_FFFF || lfh_off == 0xFFFF_FFFF {
            return Step::Error(FormatErrorKind::Unsupported);
        }

        self.current = Some(Current {
            flags,
            method,
            compressed_size: u64::from(comp_size),
            local_header_offset: lfh_off as usize,
        });
        Step::Ok(EntryHeader {
            name: Some(String::from_utf8_lossy(name).into_owned()),
            packed_size: u64::from(comp_size),
            unpacked_size: u64::from(uncomp_size),
            crc32: Some(crc32),
            encrypted: flags & FLAG_ENCRYPTED != 0,
            is_dir: name.last() == Some(&b'/'),
        })
    }

    fn skip(&mut self) -> Step<()> {
        // The central directory cursor already moved past the record.
        match self.current.take() {
            Some(_) => Step::Ok(()),
            None => Step::Error(FormatErrorKind::Malformed),
        }
    }

    fn extract(&mut self, out: &mut dyn Write) -> Step<()> {
        let Some(cur) = self.current.take() else {
            return Step::Error(FormatErrorKind::Malformed);
        };
        if cur.flags & FLAG_ENCRYPTED != 0 {
            return Step::Encrypted;
        }
        let data = match self.payload(&cur) {
            Ok(data) => data,
            Err(kind) => return Step::Error(kind),
        };
        let copied = match cur.method {
            METHOD_STORED => out.write_all(data),
            METHOD_DEFLATE => io::copy(&mut DeflateDecoder::new(data), out).map(|_| ()),
            _ => return Step::Error(FormatErrorKind::Unsupported),
        };
        match copied {
            Ok(()) => Step::Ok(()),
            Err(e) => {
                log::trace!("zip entry stopped: {e}");
                Step::Error(FormatErrorKind::Decode)
            }
        }
    }
}

fn rfind_sig(hay: &[u8], sig: u32) -> Option<usize> {
    if hay.len() < 4 {
        return None;
    }
    let needle = sig.to_le_bytes();
    memchr::memmem::rfind(hay, &needle)
}

#[inline(always)]
fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

#[inline(always)]
fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
