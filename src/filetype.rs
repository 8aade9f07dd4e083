//! File type tags, feature families, and the type-detection seam.
//!
//! # Invariants
//! - `FileType` discriminants are stable and dense; `FileType::COUNT` sizes
//!   the dispatcher table.
//! - Detection only ever sees a bounded head slice (`DETECT_HEAD_LEN`).
//! - `find_embedded` never reports offset 0 and reports at most one object
//!   per type, in ascending offset order. Filtering against the container's
//!   own type is the dispatcher's job.
//!
//! # Design Notes
//! - `TypeDetector` is the seam for the host's content sniffer. The bundled
//!   `MagicDetector` recognizes the formats the built-in handlers understand
//!   plus the common executable and document magics.
//! - Magic sniffing cannot tell a self-extracting archive from a plain
//!   executable; embedded offsets cover that case instead.

use core::fmt;

use memchr::memmem;
use serde::{Deserialize, Serialize};

use crate::formats::{is_gzip_magic, is_ustar_header, is_zip_magic};

/// Bytes handed to [`TypeDetector::detect`].
pub const DETECT_HEAD_LEN: usize = 1024;

/// Bytes inspected by [`TypeDetector::reclassify_text`].
pub const RECLASSIFY_SCAN_LEN: usize = 4096;

/// Detected (or declared) type of a scanned object.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Unknown; detection decides.
    #[default]
    Any = 0,
    BinaryData = 1,
    Text = 2,
    Html = 3,
    Mail = 4,
    Gzip = 5,
    Bzip2 = 6,
    Tar = 7,
    Zip = 8,
    Rar = 9,
    SevenZip = 10,
    Cab = 11,
    Cpio = 12,
    Ole2 = 13,
    Pdf = 14,
    Pe = 15,
    Elf = 16,
    MachO = 17,
}

impl FileType {
    pub const COUNT: usize = 18;

    pub const ALL: [FileType; FileType::COUNT] = [
        FileType::Any,
        FileType::BinaryData,
        FileType::Text,
        FileType::Html,
        FileType::Mail,
        FileType::Gzip,
        FileType::Bzip2,
        FileType::Tar,
        FileType::Zip,
        FileType::Rar,
        FileType::SevenZip,
        FileType::Cab,
        FileType::Cpio,
        FileType::Ole2,
        FileType::Pdf,
        FileType::Pe,
        FileType::Elf,
        FileType::MachO,
    ];

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::BinaryData => "binary",
            Self::Text => "text",
            Self::Html => "html",
            Self::Mail => "mail",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Tar => "tar",
            Self::Zip => "zip",
            Self::Rar => "rar",
            Self::SevenZip => "7z",
            Self::Cab => "cab",
            Self::Cpio => "cpio",
            Self::Ole2 => "ole2",
            Self::Pdf => "pdf",
            Self::Pe => "pe",
            Self::Elf => "elf",
            Self::MachO => "macho",
        }
    }

    /// Label used in synthesized heuristic names (`Heuristics.Encrypted.Zip`).
    pub const fn label(self) -> &'static str {
        match self {
            Self::Zip => "Zip",
            Self::Rar => "RAR",
            Self::SevenZip => "7Zip",
            Self::Cab => "CAB",
            Self::Pdf => "PDF",
            Self::Ole2 => "OLE2",
            Self::Tar => "Tar",
            Self::Gzip => "GZip",
            Self::Bzip2 => "BZip2",
            Self::Cpio => "CPIO",
            Self::Mail => "Mail",
            Self::Html => "HTML",
            Self::Pe => "PE",
            Self::Elf => "ELF",
            Self::MachO => "MachO",
            Self::Text => "Text",
            Self::BinaryData | Self::Any => "Unknown",
        }
    }

    /// Generic tags may be refined by content detection; anything else is a
    /// declared type that detection must not override.
    #[inline(always)]
    pub const fn is_generic(self) -> bool {
        matches!(self, FileType::Any | FileType::BinaryData | FileType::Text)
    }

    /// Feature family gating this type's handler, if any.
    pub const fn family(self) -> Option<Family> {
        match self {
            Self::Gzip
            | Self::Bzip2
            | Self::Tar
            | Self::Zip
            | Self::Rar
            | Self::SevenZip
            | Self::Cab
            | Self::Cpio => Some(Family::Archive),
            Self::Mail => Some(Family::Mail),
            Self::Html => Some(Family::Html),
            Self::Ole2 => Some(Family::Ole2),
            Self::Pdf => Some(Family::Pdf),
            Self::Pe | Self::Elf | Self::MachO => Some(Family::Executable),
            Self::Any | Self::BinaryData | Self::Text => None,
        }
    }

    /// Whether the raw pass may look for embedded objects in this type.
    ///
    /// Raw archive and stream formats carry fragments of their members
    /// (local headers, stored payloads) that would be misreported as
    /// embedded objects; they are extracted and scanned instead.
    #[inline]
    pub const fn allows_recognition(self) -> bool {
        !matches!(
            self,
            FileType::Gzip | FileType::Tar | FileType::Zip | FileType::Cpio
        )
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// -----------------------------
// Families
// -----------------------------

/// Handler feature family; each has one enable bit in [`FamilySet`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Archive = 0,
    Mail = 1,
    Html = 2,
    Ole2 = 3,
    Pdf = 4,
    Executable = 5,
}

impl Family {
    pub const COUNT: usize = 6;

    #[inline(always)]
    pub const fn bit(self) -> u32 {
        1u32 << (self as u32)
    }
}

/// Per-family enable bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilySet(u32);

impl FamilySet {
    pub const NONE: FamilySet = FamilySet(0);
    pub const ALL: FamilySet = FamilySet((1u32 << Family::COUNT) - 1);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        FamilySet(bits & Self::ALL.0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, family: Family) -> bool {
        self.0 & family.bit() != 0
    }

    #[inline]
    #[must_use]
    pub const fn with(self, family: Family) -> Self {
        FamilySet(self.0 | family.bit())
    }

    #[inline]
    #[must_use]
    pub const fn without(self, family: Family) -> Self {
        FamilySet(self.0 & !family.bit())
    }

    /// Types without a family are always allowed.
    #[inline]
    pub fn allows(self, ft: FileType) -> bool {
        ft.family().map_or(true, |fam| self.contains(fam))
    }
}

impl Default for FamilySet {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Debug for FamilySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FamilySet({:#08b})", self.0)
    }
}

// -----------------------------
// Detection seam
// -----------------------------

/// An object found inside another object's bytes by the raw pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmbeddedObject {
    pub offset: u64,
    pub file_type: FileType,
}

/// Content sniffer consumed by the dispatcher.
///
/// Implementations are shared across sessions and must be immutable.
pub trait TypeDetector: Send + Sync {
    /// Classify an object from at most [`DETECT_HEAD_LEN`] leading bytes.
    fn detect(&self, head: &[u8]) -> FileType;

    /// Append embedded objects found in `bytes` to `out` (at most `max`).
    fn find_embedded(
        &self,
        _bytes: &[u8],
        _container: FileType,
        _max: usize,
        _out: &mut Vec<EmbeddedObject>,
    ) {
    }

    /// Refine a text object into HTML or mail when its body says so.
    fn reclassify_text(&self, _bytes: &[u8]) -> Option<FileType> {
        None
    }
}

const RAR_MAGIC: &[u8] = b"Rar!\x1a\x07";
const SEVEN_ZIP_MAGIC: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];
const CAB_MAGIC: &[u8] = b"MSCF\0\0\0\0";
const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const PDF_MAGIC: &[u8] = b"%PDF-";
const ELF_MAGIC: &[u8] = b"\x7fELF";
const MZ_MAGIC: &[u8] = b"MZ";
const ZIP_LOCAL_MAGIC: &[u8] = b"PK\x03\x04";
const MACHO_MAGICS: [[u8; 4]; 4] = [
    [0xFE, 0xED, 0xFA, 0xCE],
    [0xFE, 0xED, 0xFA, 0xCF],
    [0xCE, 0xFA, 0xED, 0xFE],
    [0xCF, 0xFA, 0xED, 0xFE],
];
const MAIL_PREFIXES: [&[u8]; 5] = [
    b"From ",
    b"Received: ",
    b"Return-Path: ",
    b"Delivered-To: ",
    b"MIME-Version: ",
];
const HTML_MARKERS: [&[u8]; 4] = [b"<html", b"<!doctype html", b"<script", b"<body"];

/// Magic-number sniffer covering the built-in formats.
#[derive(Clone, Copy, Debug, Default)]
pub struct MagicDetector;

impl MagicDetector {
    fn sniff_binary(head: &[u8]) -> Option<FileType> {
        if is_gzip_magic(head) {
            return Some(FileType::Gzip);
        }
        if head.starts_with(b"BZh") {
            return Some(FileType::Bzip2);
        }
        if is_zip_magic(head) {
            return Some(FileType::Zip);
        }
        if head.starts_with(RAR_MAGIC) {
            return Some(FileType::Rar);
        }
        if head.starts_with(SEVEN_ZIP_MAGIC) {
            return Some(FileType::SevenZip);
        }
        if head.starts_with(CAB_MAGIC) {
            return Some(FileType::Cab);
        }
        if head.starts_with(OLE2_MAGIC) {
            return Some(FileType::Ole2);
        }
        if head.starts_with(PDF_MAGIC) {
            return Some(FileType::Pdf);
        }
        if head.starts_with(ELF_MAGIC) {
            return Some(FileType::Elf);
        }
        if head.len() >= 4 && MACHO_MAGICS.iter().any(|m| head[..4] == m[..]) {
            return Some(FileType::MachO);
        }
        if head.starts_with(MZ_MAGIC) {
            return Some(FileType::Pe);
        }
        if head.starts_with(b"070701")
            || head.starts_with(b"070707")
            || head.starts_with(&[0xC7, 0x71])
        {
            return Some(FileType::Cpio);
        }
        if is_ustar_header(head) {
            return Some(FileType::Tar);
        }
        None
    }

    fn looks_like_text(head: &[u8]) -> bool {
        head.iter()
            .all(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
    }

    fn sniff_text(head: &[u8]) -> FileType {
        let trimmed = trim_ascii_start(head);
        if MAIL_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            return FileType::Mail;
        }
        if HTML_MARKERS
            .iter()
            .any(|m| starts_with_ignore_ascii_case(trimmed, m))
        {
            return FileType::Html;
        }
        FileType::Text
    }
}

impl TypeDetector for MagicDetector {
    fn detect(&self, head: &[u8]) -> FileType {
        let head = &head[..head.len().min(DETECT_HEAD_LEN)];
        if let Some(ft) = Self::sniff_binary(head) {
            return ft;
        }
        if Self::looks_like_text(head) {
            return Self::sniff_text(head);
        }
        FileType::BinaryData
    }

    fn find_embedded(
        &self,
        bytes: &[u8],
        _container: FileType,
        max: usize,
        out: &mut Vec<EmbeddedObject>,
    ) {
        if bytes.len() < 2 || max == 0 {
            return;
        }
        let start = out.len();
        let probes: [(&[u8], FileType); 5] = [
            (ZIP_LOCAL_MAGIC, FileType::Zip),
            (RAR_MAGIC, FileType::Rar),
            (SEVEN_ZIP_MAGIC, FileType::SevenZip),
            (CAB_MAGIC, FileType::Cab),
            (PDF_MAGIC, FileType::Pdf),
        ];
        for (magic, ft) in probes {
            if let Some(pos) = memmem::find(&bytes[1..], magic) {
                out.push(EmbeddedObject {
                    offset: (pos + 1) as u64,
                    file_type: ft,
                });
            }
        }
        if let Some(off) = find_embedded_pe(bytes) {
            out.push(EmbeddedObject {
                offset: off as u64,
                file_type: FileType::Pe,
            });
        }
        out[start..].sort_by_key(|e| e.offset);
        out.truncate(start + max);
    }

    fn reclassify_text(&self, bytes: &[u8]) -> Option<FileType> {
        let window = &bytes[..bytes.len().min(RECLASSIFY_SCAN_LEN)];
        let lowered = window.to_ascii_lowercase();
        if HTML_MARKERS
            .iter()
            .any(|m| memmem::find(&lowered, m).is_some())
        {
            return Some(FileType::Html);
        }
        let has_mail_headers = window
            .split(|&b| b == b'\n')
            .take(32)
            .filter(|line| MAIL_PREFIXES.iter().any(|p| line.starts_with(p)))
            .count()
            >= 2;
        has_mail_headers.then_some(FileType::Mail)
    }
}

/// First `MZ` past offset 0 whose `e_lfanew` points at a `PE\0\0` header.
fn find_embedded_pe(bytes: &[u8]) -> Option<usize> {
    const E_LFANEW: usize = 0x3c;
    for pos in memmem::find_iter(&bytes[1..], MZ_MAGIC) {
        let off = pos + 1;
        let Some(lfanew) = bytes.get(off + E_LFANEW..off + E_LFANEW + 4) else {
            break;
        };
        let lfanew = u32::from_le_bytes([lfanew[0], lfanew[1], lfanew[2], lfanew[3]]) as usize;
        let pe = off.saturating_add(lfanew);
        if bytes.get(pe..pe.saturating_add(4)) == Some(b"PE\0\0".as_slice()) {
            return Some(off);
        }
    }
    None
}

#[inline]
fn trim_ascii_start(mut s: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = s.split_first() {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

fn starts_with_ignore_ascii_case(hay: &[u8], prefix: &[u8]) -> bool {
    hay.len() >= prefix.len() && hay[..prefix.len()].eq_ignore_ascii_case(prefix)
}
