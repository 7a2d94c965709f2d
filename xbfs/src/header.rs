use std::fmt;

use sha2::{Digest, Sha256};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U16, U32, U64},
};

/// Errors when reading an XBFS header.
#[derive(Debug, snafu::Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("XBFS header is truncated"))]
    TooSmall,
}

pub const XBFS_MAGIC: [u8; 4] = *b"SFBX";

/// Size of an XBFS header record.
pub const HEADER_SIZE: usize = 0x400;

/// Number of entries in the file table.
pub const ENTRY_COUNT: usize = 0x3A;

/// Size of the part of the header covered by its hash.
pub const HASHED_SIZE: usize = 0x3E0;

/// Unit of entry LBAs and lengths.
pub const LBA_SIZE: u64 = 0x1000;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct XbfsEntryRaw {
    pub lba: U32,       // 0x00
    pub length: U32,    // 0x04
    pub reserved: U64,  // 0x08
}

#[derive(Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct XbfsHeaderRaw {
    pub magic: [u8; 4],                        // 0x000 - "SFBX"
    pub format_version: u8,                    // 0x004
    pub sequence_number: u8,                   // 0x005
    pub layout_version: U16,                   // 0x006
    pub reserved0: [U64; 3],                   // 0x008
    pub entries: [XbfsEntryRaw; ENTRY_COUNT],  // 0x020
    pub system_xvid: [u8; 0x10],               // 0x3C0
    pub reserved1: [u8; 0x10],                 // 0x3D0
    pub hash: [u8; 0x20],                      // 0x3E0 - SHA-256 of 0x000..0x3E0
}

const _: () = assert!(size_of::<XbfsEntryRaw>() == 0x10);
const _: () = assert!(size_of::<XbfsHeaderRaw>() == HEADER_SIZE);

/// An entry of the XBFS file table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct XbfsEntry {
    lba: u32,
    length: u32,
}

impl XbfsEntry {
    pub fn new(lba: u32, length: u32) -> Self {
        Self { lba, length }
    }

    #[must_use]
    pub fn lba(&self) -> u32 {
        self.lba
    }

    /// Length in units of [`LBA_SIZE`].
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Byte offset of the file within the NAND image.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.lba) * LBA_SIZE
    }

    /// Length of the file in bytes.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        u64::from(self.length) * LBA_SIZE
    }

    /// Returns `false` for unused slots of the table.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.length != 0
    }
}

impl fmt::Debug for XbfsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XbfsEntry")
            .field("offset", &format_args!("0x{:X}", self.offset()))
            .field("len", &format_args!("0x{:X}", self.byte_len()))
            .finish()
    }
}

/// A parsed XBFS header.
///
/// Headers are read even when they are invalid so corrupt dumps can be
/// inspected. Check [`is_valid()`](Self::is_valid) and
/// [`is_hash_valid()`](Self::is_hash_valid).
#[derive(Clone)]
pub struct XbfsHeader {
    raw: XbfsHeaderRaw,
}

impl fmt::Debug for XbfsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XbfsHeader")
            .field("valid", &self.is_valid())
            .field("hash_valid", &self.is_hash_valid())
            .field("sequence_number", &self.sequence_number())
            .field("layout_version", &self.layout_version())
            .finish_non_exhaustive()
    }
}

impl XbfsHeader {
    /// Creates a header with valid magic, an empty file table and a valid
    /// hash.
    pub fn new(format_version: u8, sequence_number: u8, layout_version: u16) -> Self {
        let mut raw = XbfsHeaderRaw::new_zeroed();
        raw.magic = XBFS_MAGIC;
        raw.format_version = format_version;
        raw.sequence_number = sequence_number;
        raw.layout_version.set(layout_version);

        let mut header = Self { raw };
        header.rehash();
        header
    }

    /// Parses a header from the start of `data`.
    pub fn read(data: &[u8]) -> Result<Self, ReadError> {
        let (raw, _) =
            XbfsHeaderRaw::read_from_prefix(data).map_err(|_| TooSmallSnafu.build())?;

        Ok(Self { raw })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    /// Returns `true` if the magic matches.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.raw.magic == XBFS_MAGIC
    }

    /// Returns `true` if the stored hash matches the header contents.
    #[must_use]
    pub fn is_hash_valid(&self) -> bool {
        self.compute_hash() == self.raw.hash
    }

    /// Recomputes the stored hash.
    pub fn rehash(&mut self) {
        self.raw.hash = self.compute_hash();
    }

    fn compute_hash(&self) -> [u8; 0x20] {
        Sha256::digest(&self.raw.as_bytes()[..HASHED_SIZE]).into()
    }

    #[must_use]
    pub fn format_version(&self) -> u8 {
        self.raw.format_version
    }

    #[must_use]
    pub fn sequence_number(&self) -> u8 {
        self.raw.sequence_number
    }

    #[must_use]
    pub fn layout_version(&self) -> u16 {
        self.raw.layout_version.get()
    }

    #[must_use]
    pub fn system_xvid(&self) -> [u8; 0x10] {
        self.raw.system_xvid
    }

    #[must_use]
    pub fn hash(&self) -> &[u8; 0x20] {
        &self.raw.hash
    }

    /// Returns entry `index`, or `None` past the end of the table.
    #[must_use]
    pub fn entry(&self, index: usize) -> Option<XbfsEntry> {
        self.raw
            .entries
            .get(index)
            .map(|e| XbfsEntry::new(e.lba.get(), e.length.get()))
    }

    /// Returns every slot of the file table, present or not.
    pub fn entries(&self) -> impl Iterator<Item = XbfsEntry> + '_ {
        self.raw
            .entries
            .iter()
            .map(|e| XbfsEntry::new(e.lba.get(), e.length.get()))
    }

    /// Overwrites entry `index`. The hash is not updated.
    pub fn set_entry(&mut self, index: usize, entry: XbfsEntry) {
        let raw = &mut self.raw.entries[index];
        raw.lba.set(entry.lba);
        raw.length.set(entry.length);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn field_offsets() {
        let mut header = XbfsHeader::new(1, 9, 3);
        header.set_entry(1, XbfsEntry::new(0x10, 0x2));
        header.rehash();

        let bytes = header.as_bytes();
        assert_eq!(&bytes[..4], b"SFBX");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 9);
        assert_eq!(&bytes[6..8], &[3, 0]);
        assert_eq!(&bytes[0x30..0x38], &[0x10, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&bytes[0x3E0..], &Sha256::digest(&bytes[..0x3E0])[..]);
    }

    #[test]
    fn new_header_starts_empty() {
        let header = XbfsHeader::new(2, 0, 1);
        let bytes = header.as_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert!(bytes[8..HASHED_SIZE].iter().all(|&b| b == 0));
        assert_eq!(header.entries().filter(|e| e.is_present()).count(), 0);
        assert!(header.is_hash_valid());
    }

    #[test]
    fn single_byte_flip_breaks_hash() {
        let header = XbfsHeader::new(1, 1, 1);
        assert!(header.is_valid());
        assert!(header.is_hash_valid());

        for offset in 0..HASHED_SIZE {
            let mut bytes = header.as_bytes().to_vec();
            bytes[offset] ^= 0x01;

            let mut flipped = XbfsHeader::read(&bytes).unwrap();
            assert!(!flipped.is_hash_valid(), "offset 0x{offset:X}");

            flipped.rehash();
            assert!(flipped.is_hash_valid(), "offset 0x{offset:X}");
        }
    }

    #[test]
    fn invalid_magic_is_not_an_error() {
        let header = XbfsHeader::read(&[0u8; HEADER_SIZE]).unwrap();
        assert!(!header.is_valid());
        assert!(!header.is_hash_valid());

        assert_matches!(XbfsHeader::read(&[0u8; 0x3FF]), Err(ReadError::TooSmall));
    }

    #[test]
    fn entry_units() {
        let entry = XbfsEntry::new(0x20, 0x3);
        assert_eq!(entry.offset(), 0x20000);
        assert_eq!(entry.byte_len(), 0x3000);
        assert!(entry.is_present());
        assert!(!XbfsEntry::new(0x20, 0).is_present());
    }
}
