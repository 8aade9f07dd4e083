//! Built-in container handlers.
//!
//! # Design Notes
//! - These are thin, bounded adapters that walk container structure and
//!   hand entries to the extraction loop; they are not general extraction
//!   libraries. Hosts register richer handlers through `TypeDispatcher`.
//! - Every handler works on the in-memory (or mapped) view it is given and
//!   treats every size and offset as hostile.

pub mod gzip;
pub mod tar;
pub mod zip;

pub use gzip::{is_gzip_magic, GzipHandler};
pub use tar::{is_ustar_header, TarEntries, TarHandler};
pub use zip::{is_zip_magic, ZipEntries, ZipHandler};
