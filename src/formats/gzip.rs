//! gzip handler: one decompressed stream, scanned as a single entry.
//!
//! # Invariants
//! - `MultiGzDecoder` treats concatenated members as a single stream.
//! - Decompressed output is bounded by the entry sink's cap; the trailer's
//!   ISIZE is not trusted and not used for limit decisions.
//!
//! # Design Notes
//! - Header filename parsing is bounded by `GZIP_NAME_MAX`; if the name is
//!   missing or exceeds the cap, `<gunzip>` is used instead.
//! - A stream that fails mid-way still has its partial output scanned.

use std::io::{self, Write};

use flate2::read::MultiGzDecoder;

use crate::context::ScanContext;
use crate::dispatch::Handler;
use crate::error::ScanError;
use crate::extract::{run_extraction_loop, EntryHeader, EntryIterator, Step};
use crate::filetype::FileType;
use crate::outcome::{FormatErrorKind, Status};
use crate::view::ByteView;

/// gzip magic bytes (RFC 1952).
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Entry name used when the header carries no usable FNAME.
pub const GZIP_FALLBACK_NAME: &str = "<gunzip>";

const GZIP_HEADER_LEN: usize = 10;
const GZIP_CM_DEFLATE: u8 = 8;
const GZIP_FLAG_FEXTRA: u8 = 0x04;
const GZIP_FLAG_FNAME: u8 = 0x08;
const GZIP_NAME_MAX: usize = 1024;
const GZIP_HEADER_PEEK: usize = 64 * 1024;

#[inline(always)]
pub fn is_gzip_magic(header: &[u8]) -> bool {
    header.len() >= 2 && header[0] == GZIP_MAGIC[0] && header[1] == GZIP_MAGIC[1]
}

/// Handler for `FileType::Gzip`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GzipHandler;

impl Handler for GzipHandler {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn scan(&self, ctx: &mut ScanContext<'_>, view: &ByteView) -> Result<Status, ScanError> {
        let bytes = view.as_slice();
        if bytes.len() < GZIP_HEADER_LEN || !is_gzip_magic(bytes) {
            return Ok(Status::Format(FormatErrorKind::Malformed));
        }
        if bytes[2] != GZIP_CM_DEFLATE {
            return Ok(Status::Format(FormatErrorKind::Unsupported));
        }
        let name = parse_gzip_name(view.head(GZIP_HEADER_PEEK))
            .unwrap_or_else(|| GZIP_FALLBACK_NAME.to_string());
        let mut stream = GzipStream::new(bytes, name);
        run_extraction_loop(ctx, FileType::Gzip, &mut stream)
    }
}

/// The single decompressed member stream of a gzip object.
pub struct GzipStream<'a> {
    compressed: &'a [u8],
    name: String,
    yielded: bool,
    consumed: bool,
}

impl<'a> GzipStream<'a> {
    pub fn new(compressed: &'a [u8], name: String) -> Self {
        Self {
            compressed,
            name,
            yielded: false,
            consumed: false,
        }
    }
}

impl EntryIterator for GzipStream<'_> {
    fn peek_header(&mut self) -> Step<EntryHeader> {
        if self.yielded {
            return Step::NoMoreEntries;
        }
        self.yielded = true;
        Step::Ok(EntryHeader {
            name: Some(self.name.clone()),
            packed_size: self.compressed.len() as u64,
            unpacked_size: 0,
            ..EntryHeader::default()
        })
    }

    fn skip(&mut self) -> Step<()> {
        self.consumed = true;
        Step::Ok(())
    }

    fn extract(&mut self, out: &mut dyn Write) -> Step<()> {
        if self.consumed {
            return Step::NoMoreEntries;
        }
        self.consumed = true;
        let mut decoder = MultiGzDecoder::new(self.compressed);
        match io::copy(&mut decoder, out) {
            Ok(_) => Step::Ok(()),
            Err(e) => {
                log::trace!("gzip decode stopped: {e}");
                Step::Error(FormatErrorKind::Decode)
            }
        }
    }
}

// Best-effort parse of gzip FNAME from a bounded prefix.
fn parse_gzip_name(prefix: &[u8]) -> Option<String> {
    if prefix.len() < GZIP_HEADER_LEN || !is_gzip_magic(prefix) {
        return None;
    }
    if prefix[2] != GZIP_CM_DEFLATE {
        return None;
    }

    let flg = prefix[3];
    let mut idx = GZIP_HEADER_LEN;

    if (flg & GZIP_FLAG_FEXTRA) != 0 {
        let xlen = prefix.get(idx..idx + 2)?;
        let xlen = u16::from_le_bytes([xlen[0], xlen[1]]) as usize;
        idx = idx.checked_add(2 + xlen)?;
        if idx > prefix.len() {
            return None;
        }
    }

    if (flg & GZIP_FLAG_FNAME) == 0 {
        return None;
    }

    let rest = &prefix[idx..];
    let end = memchr::memchr(0, &rest[..rest.len().min(GZIP_NAME_MAX + 1)])?;
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::{Compression, GzBuilder};

    #[test]
    fn sniff_gzip_magic() {
        assert!(is_gzip_magic(&[0x1f, 0x8b, 0x08, 0x00]));
        assert!(!is_gzip_magic(&[0x1f]));
        assert!(!is_gzip_magic(&[0x50, 0x4b]));
    }

    #[test]
    fn fname_is_parsed_when_present() {
        let mut enc = GzBuilder::new()
            .filename("payload.bin")
            .write(Vec::new(), Compression::default());
        enc.write_all(b"hello hello").unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(parse_gzip_name(&gz).as_deref(), Some("payload.bin"));

        let mut plain = GzEncoder::new(Vec::new(), Compression::default());
        plain.write_all(b"hello hello").unwrap();
        assert_eq!(parse_gzip_name(&plain.finish().unwrap()), None);
    }

    #[test]
    fn stream_yields_one_entry() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"decompressed body").unwrap();
        let gz = enc.finish().unwrap();

        let mut stream = GzipStream::new(&gz, GZIP_FALLBACK_NAME.to_string());
        let header = match stream.peek_header() {
            Step::Ok(h) => h,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(header.name.as_deref(), Some(GZIP_FALLBACK_NAME));
        let mut out = Vec::new();
        assert_eq!(stream.extract(&mut out), Step::Ok(()));
        assert_eq!(out, b"decompressed body");
        assert_eq!(stream.peek_header(), Step::NoMoreEntries);
    }

    #[test]
    fn corrupt_stream_is_decode_error() {
        let mut bytes = vec![0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff];
        bytes.extend_from_slice(&[0xff; 32]);
        let mut stream = GzipStream::new(&bytes, GZIP_FALLBACK_NAME.to_string());
        let _ = stream.peek_header();
        let mut out = Vec::new();
        assert_eq!(
            stream.extract(&mut out),
            Step::Error(FormatErrorKind::Decode)
        );
    }
}
