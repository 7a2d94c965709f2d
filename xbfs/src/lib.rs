//! A library for reading the boot filesystem (XBFS) of Xbox NAND dumps.
//!
//! The NAND holds several copies of the XBFS header, each with a file table
//! of LBA/length pairs. The copy with the highest sequence number whose
//! magic and hash are intact is the one in use.
//!
//! # Example
//!
//! ```no_run
//! use xbfs::Xbfs;
//!
//! let nand = std::fs::read("nand.bin").unwrap();
//! let xbfs = Xbfs::new(nand).unwrap();
//!
//! for file in xbfs.files() {
//!     println!("{}: 0x{:X} bytes", file.name, file.entry.byte_len());
//! }
//! ```

use std::io::{Seek, SeekFrom, Write};

use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use self::header::{HEADER_SIZE, XbfsEntry, XbfsHeader};

use extract_error::*;
use load_error::*;

pub mod header;

const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Known file names, by table index.
pub const FILENAMES: &[&str] = &[
    "1smcbl_a.bin",
    "header.bin",
    "devkit.ini",
    "mtedata.cfg",
    "certkeys.bin",
    "smcerr.log",
    "system.xvd",
    "$sosrst.xvd",
    "download.xvd",
    "smc_s.cfg",
    "sp_s.cfg",
    "os_s.cfg",
    "smc_d.cfg",
    "sp_d.cfg",
    "os_d.cfg",
    "smcfw.bin",
    "boot.bin",
    "host.xvd",
    "settings.xvd",
    "1smcbl_b.bin",
    "bootanim.dat",
    "sostmpl.xvd",
    "update.cfg",
    "sosinit.xvd",
    "hwinit.cfg",
    "qaslt.xvd",
    "sp_s.bak",
    "update2.cfg",
    "obsolete.bin",
    "obsolete.bin",
    "obsolete.bin",
    "obsolete.bin",
];

/// Returns the name of table entry `index`, or `"unknown"` for indices past
/// the known names.
#[must_use]
pub fn filename(index: usize) -> &'static str {
    FILENAMES.get(index).copied().unwrap_or("unknown")
}

/// Console generation of a NAND dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    XboxOne,
    XboxSeries,
}

impl Flavor {
    pub const XBOX_ONE_SIZE: u64 = 0x1_3C00_0000;
    pub const XBOX_SERIES_SIZE: u64 = 0x400_0000;

    /// Picks the flavor from the size of the dump.
    pub fn detect(len: u64) -> Result<Self, LoadError> {
        match len {
            Self::XBOX_ONE_SIZE => Ok(Self::XboxOne),
            Self::XBOX_SERIES_SIZE => Ok(Self::XboxSeries),
            _ => UnknownImageSizeSnafu { len }.fail(),
        }
    }

    /// Offsets of every header copy.
    #[must_use]
    pub const fn header_offsets(self) -> &'static [u64] {
        match self {
            Self::XboxOne => &[0x10000, 0x81_0000, 0x82_0000],
            Self::XboxSeries => &[0x10000],
        }
    }
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::XboxOne => f.write_str("Xbox One"),
            Self::XboxSeries => f.write_str("Xbox Series"),
        }
    }
}

/// A present file of the newest valid header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XbfsFile {
    pub index: usize,
    pub name: &'static str,
    pub entry: XbfsEntry,
}

/// An XBFS over the bytes of a NAND dump.
#[must_use]
pub struct Xbfs<R: AsRef<[u8]>> {
    raw: R,
    flavor: Flavor,
    headers: Vec<XbfsHeader>,
}

impl<R: AsRef<[u8]>> std::fmt::Debug for Xbfs<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xbfs")
            .field("flavor", &self.flavor)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl<R: AsRef<[u8]>> Xbfs<R> {
    /// Loads a dump, detecting the flavor from its size.
    pub fn new(raw: R) -> Result<Self, LoadError> {
        let flavor = Flavor::detect(raw.as_ref().len() as u64)?;
        Self::with_flavor(raw, flavor)
    }

    /// Loads a dump of a known flavor. Every header copy is read, valid or
    /// not.
    pub fn with_flavor(raw: R, flavor: Flavor) -> Result<Self, LoadError> {
        let mut headers = Vec::with_capacity(flavor.header_offsets().len());

        for &offset in flavor.header_offsets() {
            let data = usize::try_from(offset)
                .ok()
                .and_then(|o| raw.as_ref().get(o..o + HEADER_SIZE))
                .context(HeaderOutOfRangeSnafu { offset })?;
            let header = XbfsHeader::read(data).context(ReadHeaderFailedSnafu { offset })?;

            if !header.is_valid() {
                warn!(offset = format_args!("0x{offset:X}"), "XBFS header has invalid magic");
            } else if !header.is_hash_valid() {
                warn!(offset = format_args!("0x{offset:X}"), "XBFS header has invalid hash");
            }

            debug!(
                offset = format_args!("0x{offset:X}"),
                sequence = header.sequence_number(),
                "Read XBFS header"
            );

            headers.push(header);
        }

        Ok(Self {
            raw,
            flavor,
            headers,
        })
    }

    #[must_use]
    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Returns the header copies, in the order of
    /// [`Flavor::header_offsets()`].
    #[must_use]
    pub fn headers(&self) -> &[XbfsHeader] {
        &self.headers
    }

    /// Index of the valid header with the highest sequence number.
    #[must_use]
    pub fn newest_header_index(&self) -> Option<usize> {
        self.headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.is_valid() && h.is_hash_valid())
            .max_by_key(|(_, h)| h.sequence_number())
            .map(|(i, _)| i)
    }

    #[must_use]
    pub fn newest_header(&self) -> Option<&XbfsHeader> {
        self.newest_header_index().map(|i| &self.headers[i])
    }

    /// Returns the present files of the newest valid header. Empty if no
    /// header is valid.
    pub fn files(&self) -> impl Iterator<Item = XbfsFile> + '_ {
        self.newest_header()
            .into_iter()
            .flat_map(|h| h.entries().enumerate())
            .filter(|(_, entry)| entry.is_present())
            .map(|(index, entry)| XbfsFile {
                index,
                name: filename(index),
                entry,
            })
    }

    /// Finds a present file by name.
    pub fn find_file(&self, name: &str) -> Result<XbfsFile, ExtractError> {
        self.newest_header().context(NoValidHeaderSnafu)?;

        self.files()
            .find(|f| f.name == name)
            .context(FileNotFoundSnafu { name })
    }

    /// Copies `file` to `writer` and returns the number of bytes written.
    pub fn extract<W: Write + ?Sized>(
        &self,
        file: &XbfsFile,
        writer: &mut W,
    ) -> Result<u64, ExtractError> {
        let offset = file.entry.offset();
        let len = file.entry.byte_len();

        let data = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(offset + len).ok())
            .and_then(|(start, end)| self.raw.as_ref().get(start..end))
            .context(DataOutOfRangeSnafu {
                index: file.index,
                offset,
                len,
            })?;

        for chunk in data.chunks(COPY_CHUNK_SIZE) {
            writer.write_all(chunk).context(WriteSnafu)?;
        }

        debug!(name = file.name, len, "Extracted XBFS file");

        Ok(len)
    }

    /// Recomputes the hash of every header copy.
    pub fn rehash_headers(&mut self) {
        for header in &mut self.headers {
            header.rehash();
        }
    }

    /// Writes every header copy back to its offset in `writer`.
    pub fn write_headers<W: Write + Seek + ?Sized>(&self, writer: &mut W) -> std::io::Result<()> {
        for (&offset, header) in self.flavor.header_offsets().iter().zip(&self.headers) {
            writer.seek(SeekFrom::Start(offset))?;
            writer.write_all(header.as_bytes())?;
        }

        writer.flush()
    }

    /// Returns the underlying bytes.
    pub fn into_inner(self) -> R {
        self.raw
    }
}

/// Errors for [`Xbfs::new()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(display("image size 0x{len:X} matches no known NAND layout"))]
    UnknownImageSize { len: u64 },

    #[snafu(display("header at 0x{offset:X} is past the end of the image"))]
    HeaderOutOfRange { offset: u64 },

    #[snafu(display("cannot read header at 0x{offset:X}"))]
    ReadHeaderFailed {
        offset: u64,
        source: header::ReadError,
    },
}

/// Errors when extracting files.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ExtractError {
    #[snafu(display("no XBFS header is valid"))]
    NoValidHeader,

    #[snafu(display("no file named '{name}'"))]
    FileNotFound { name: String },

    #[snafu(display("file #{index} at 0x{offset:X} (0x{len:X} bytes) is past the end of the image"))]
    DataOutOfRange { index: usize, offset: u64, len: u64 },

    #[snafu(display("cannot write output"))]
    Write { source: std::io::Error },
}
