//! XVC region tables.
//!
//! Streamed content types carry an [`XvcInfo`] block followed by the region
//! headers, update segments and (from version 2) region specifiers. The
//! mutable data area holds one presence byte per region.

use std::fmt;
use std::io::{self, Read, Seek, Write};

use snafu::{ResultExt, Snafu, ensure};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{I64, U16, U32, U64},
};

use crate::guid::Guid;
use crate::storage::{read_exact_at, write_all_at};

/// Number of key ID slots in [`XvcInfo`].
pub const MAX_KEY_COUNT: usize = 12;

/// Region key ID meaning "not encrypted".
pub const NO_KEY: u16 = 0xFFFF;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("cannot read {what}"))]
    Io {
        what: &'static str,
        source: io::Error,
    },

    #[snafu(display("XVC tables end at 0x{end:X}, past the XVC area of 0x{len:X} bytes"))]
    TablesOverflow { end: u64, len: u64 },
}

fn utf16_to_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();

    String::from_utf16_lossy(&units)
}

#[derive(Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct XvcInfoRaw {
    pub content_id: Guid,                        // 0x000
    pub encryption_key_ids: [Guid; MAX_KEY_COUNT], // 0x010
    pub description: [u8; 0x100],                // 0x0D0
    pub version: U32,                            // 0x1D0
    pub region_count: U32,                       // 0x1D4
    pub flags: U32,                              // 0x1D8
    pub padding: U16,                            // 0x1DC
    pub key_count: U16,                          // 0x1DE
    pub unknown: U32,                            // 0x1E0
    pub initial_play_region_id: U32,             // 0x1E4
    pub initial_play_offset: U64,                // 0x1E8
    pub file_time_created: I64,                  // 0x1F0
    pub preview_region_id: U32,                  // 0x1F8
    pub update_segment_count: U32,               // 0x1FC
    pub preview_offset: U64,                     // 0x200
    pub unused_space: U64,                       // 0x208
    pub region_specifier_count: U32,             // 0x210
    pub reserved: [u8; 0x1DEC],                  // 0x214
}

const _: () = assert!(size_of::<XvcInfoRaw>() == 0x2000);

/// Header of the XVC tables.
#[derive(Clone)]
#[must_use]
pub struct XvcInfo {
    raw: XvcInfoRaw,
}

impl fmt::Debug for XvcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XvcInfo")
            .field("content_id", &self.content_id())
            .field("version", &self.version())
            .field("region_count", &self.region_count())
            .field("key_count", &self.key_count())
            .finish_non_exhaustive()
    }
}

impl XvcInfo {
    pub const RAW_SIZE: usize = size_of::<XvcInfoRaw>();

    /// Creates empty tables of the given version.
    pub fn new(version: u32) -> Self {
        let mut raw = XvcInfoRaw::new_zeroed();
        raw.version.set(version);
        Self { raw }
    }

    #[must_use]
    pub fn content_id(&self) -> Guid {
        self.raw.content_id
    }

    /// Returns the key IDs in use.
    #[must_use]
    pub fn key_ids(&self) -> &[Guid] {
        let count = (self.key_count() as usize).min(MAX_KEY_COUNT);
        &self.raw.encryption_key_ids[..count]
    }

    pub fn set_key_id(&mut self, index: usize, id: Guid) {
        self.raw.encryption_key_ids[index] = id;
    }

    #[must_use]
    pub fn description(&self) -> String {
        utf16_to_string(&self.raw.description)
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.raw.version.get()
    }

    #[must_use]
    pub fn region_count(&self) -> u32 {
        self.raw.region_count.get()
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.raw.flags.get()
    }

    #[must_use]
    pub fn key_count(&self) -> u16 {
        self.raw.key_count.get()
    }

    pub fn set_key_count(&mut self, count: u16) {
        self.raw.key_count.set(count);
    }

    #[must_use]
    pub fn initial_play_region_id(&self) -> u32 {
        self.raw.initial_play_region_id.get()
    }

    #[must_use]
    pub fn initial_play_offset(&self) -> u64 {
        self.raw.initial_play_offset.get()
    }

    pub fn set_initial_play_offset(&mut self, offset: u64) {
        self.raw.initial_play_offset.set(offset);
    }

    #[must_use]
    pub fn preview_region_id(&self) -> u32 {
        self.raw.preview_region_id.get()
    }

    #[must_use]
    pub fn preview_offset(&self) -> u64 {
        self.raw.preview_offset.get()
    }

    pub fn set_preview_offset(&mut self, offset: u64) {
        self.raw.preview_offset.set(offset);
    }

    #[must_use]
    pub fn update_segment_count(&self) -> u32 {
        self.raw.update_segment_count.get()
    }

    #[must_use]
    pub fn region_specifier_count(&self) -> u32 {
        self.raw.region_specifier_count.get()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }
}

/// Well-known region IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XvcRegionId {
    MetadataXvc,
    MetadataFilesystem,
    Unknown,
    EmbeddedXvd,
    Header,
    MutableData,
    /// Content region.
    Other(u32),
}

impl XvcRegionId {
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            0x4000_0001 => Self::MetadataXvc,
            0x4000_0002 => Self::MetadataFilesystem,
            0x4000_0003 => Self::Unknown,
            0x4000_0004 => Self::EmbeddedXvd,
            0x4000_0005 => Self::Header,
            0x4000_0006 => Self::MutableData,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::MetadataXvc => 0x4000_0001,
            Self::MetadataFilesystem => 0x4000_0002,
            Self::Unknown => 0x4000_0003,
            Self::EmbeddedXvd => 0x4000_0004,
            Self::Header => 0x4000_0005,
            Self::MutableData => 0x4000_0006,
            Self::Other(raw) => raw,
        }
    }

    /// Returns `true` for regions that are never encrypted with a CIK.
    #[must_use]
    pub const fn is_unencrypted_metadata(self) -> bool {
        matches!(self, Self::Header | Self::EmbeddedXvd | Self::MetadataXvc)
    }
}

impl fmt::Display for XvcRegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "0x{raw:08X}"),
            other => write!(f, "{other:?} (0x{:08X})", other.as_u32()),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
)]
#[repr(C)]
pub struct XvcRegionFlags(u32);

bitflags::bitflags! {
    impl XvcRegionFlags: u32 {
        const RESIDENT = 0x1;
        const INITIAL_PLAY = 0x2;
        const PREVIEW = 0x4;
        const FILE_SYSTEM_METADATA = 0x8;
        const PRESENT = 0x10;
        const ON_DEMAND = 0x20;
        const AVAILABLE = 0x40;
    }
}

impl fmt::Display for XvcRegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(none)");
        }

        let names: Vec<_> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join(" | "))?;

        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            write!(f, " | 0x{unknown:X}")?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct XvcRegionHeaderRaw {
    id: U32,
    key_id: U16,
    padding: U16,
    flags: U32,
    first_segment_index: U32,
    description: [u8; 0x40],
    offset: U64,
    length: U64,
    region_pduid: U64,
    reserved: [u8; 0x18],
}

const _: () = assert!(size_of::<XvcRegionHeaderRaw>() == 0x80);

/// Region of an XVC image.
#[derive(Clone, Copy)]
#[must_use]
pub struct XvcRegion {
    raw: XvcRegionHeaderRaw,
}

impl fmt::Debug for XvcRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XvcRegion")
            .field("id", &self.id())
            .field("key_id", &self.key_id())
            .field("offset", &self.offset())
            .field("length", &self.length())
            .finish_non_exhaustive()
    }
}

impl XvcRegion {
    pub const RAW_SIZE: usize = size_of::<XvcRegionHeaderRaw>();

    pub fn new(id: XvcRegionId, key_id: u16, offset: u64, length: u64) -> Self {
        let mut raw = XvcRegionHeaderRaw::new_zeroed();
        raw.id.set(id.as_u32());
        raw.key_id.set(key_id);
        raw.offset.set(offset);
        raw.length.set(length);
        Self { raw }
    }

    #[must_use]
    pub fn id(&self) -> XvcRegionId {
        XvcRegionId::from_u32(self.raw.id.get())
    }

    #[must_use]
    pub fn key_id(&self) -> u16 {
        self.raw.key_id.get()
    }

    pub fn set_key_id(&mut self, key_id: u16) {
        self.raw.key_id.set(key_id);
    }

    #[must_use]
    pub fn flags(&self) -> XvcRegionFlags {
        XvcRegionFlags::from_bits_retain(self.raw.flags.get())
    }

    #[must_use]
    pub fn first_segment_index(&self) -> u32 {
        self.raw.first_segment_index.get()
    }

    #[must_use]
    pub fn description(&self) -> String {
        utf16_to_string(&self.raw.description)
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.raw.offset.get()
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.raw.offset.set(offset);
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.raw.length.get()
    }

    pub fn set_length(&mut self, length: u64) {
        self.raw.length.set(length);
    }

    #[must_use]
    pub fn region_pduid(&self) -> u64 {
        self.raw.region_pduid.get()
    }

    /// Returns `true` if the region is encrypted with a content key.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.key_id() != NO_KEY
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct XvcUpdateSegmentRaw {
    page_num: U32,
    hash: U64,
}

const _: () = assert!(size_of::<XvcUpdateSegmentRaw>() == 0xC);

#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct XvcUpdateSegment {
    raw: XvcUpdateSegmentRaw,
}

impl XvcUpdateSegment {
    pub const RAW_SIZE: usize = size_of::<XvcUpdateSegmentRaw>();

    pub fn new(page_num: u32, hash: u64) -> Self {
        let mut raw = XvcUpdateSegmentRaw::new_zeroed();
        raw.page_num.set(page_num);
        raw.hash.set(hash);
        Self { raw }
    }

    #[must_use]
    pub fn page_num(&self) -> u32 {
        self.raw.page_num.get()
    }

    pub fn set_page_num(&mut self, page: u32) {
        self.raw.page_num.set(page);
    }

    #[must_use]
    pub fn hash(&self) -> u64 {
        self.raw.hash.get()
    }
}

#[derive(Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct XvcRegionSpecifierRaw {
    region_id: U32,
    padding: U32,
    key: [u8; 0x80],
    value: [u8; 0x100],
}

const _: () = assert!(size_of::<XvcRegionSpecifierRaw>() == 0x188);

/// Key/value annotation attached to a region.
#[derive(Clone)]
#[must_use]
pub struct XvcRegionSpecifier {
    raw: XvcRegionSpecifierRaw,
}

impl fmt::Debug for XvcRegionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XvcRegionSpecifier")
            .field("region_id", &self.region_id())
            .field("key", &self.key())
            .field("value", &self.value())
            .finish()
    }
}

impl XvcRegionSpecifier {
    pub const RAW_SIZE: usize = size_of::<XvcRegionSpecifierRaw>();

    #[must_use]
    pub fn region_id(&self) -> XvcRegionId {
        XvcRegionId::from_u32(self.raw.region_id.get())
    }

    #[must_use]
    pub fn key(&self) -> String {
        utf16_to_string(&self.raw.key)
    }

    #[must_use]
    pub fn value(&self) -> String {
        utf16_to_string(&self.raw.value)
    }
}

/// All XVC tables of an image.
#[derive(Debug, Clone)]
pub struct XvcData {
    pub info: XvcInfo,
    pub regions: Vec<XvcRegion>,
    pub segments: Vec<XvcUpdateSegment>,
    pub specifiers: Vec<XvcRegionSpecifier>,
    /// One byte per region, empty if the image has no presence info.
    pub presence: Vec<u8>,
}

fn read_table<T: FromBytes, R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    count: usize,
    what: &'static str,
) -> Result<Vec<T>, ReadError> {
    let size = size_of::<T>();
    let mut buf = vec![0u8; size * count];
    read_exact_at(reader, offset, &mut buf).context(IoSnafu { what })?;

    Ok(buf
        .chunks_exact(size)
        .filter_map(|c| T::read_from_bytes(c).ok())
        .collect())
}

impl XvcData {
    /// Builds version 2 tables for `regions`, with presence bytes.
    pub fn new(regions: Vec<XvcRegion>) -> Self {
        let mut info = XvcInfo::new(2);
        info.raw.region_count.set(regions.len() as u32);
        let presence = vec![0u8; regions.len()];

        Self {
            info,
            regions,
            segments: Vec::new(),
            specifiers: Vec::new(),
            presence,
        }
    }

    /// Reads the tables stored at `offset`, which spans `len` bytes.
    /// Presence bytes are read from `mutable_offset` if `has_mutable_data`.
    pub fn read<R: Read + Seek + ?Sized>(
        reader: &mut R,
        offset: u64,
        len: u64,
        mutable_offset: u64,
        has_mutable_data: bool,
    ) -> Result<Self, ReadError> {
        let mut raw = XvcInfoRaw::new_zeroed();
        read_exact_at(reader, offset, raw.as_mut_bytes()).context(IoSnafu { what: "XVC info" })?;
        let info = XvcInfo { raw };

        let region_count = info.region_count() as usize;
        let segment_count = info.update_segment_count() as usize;
        let specifier_count = if info.version() >= 2 {
            info.region_specifier_count() as usize
        } else {
            0
        };

        let regions_offset = offset + XvcInfo::RAW_SIZE as u64;
        let segments_offset = regions_offset + (region_count * XvcRegion::RAW_SIZE) as u64;
        let specifiers_offset =
            segments_offset + (segment_count * XvcUpdateSegment::RAW_SIZE) as u64;
        let end = specifiers_offset + (specifier_count * XvcRegionSpecifier::RAW_SIZE) as u64;

        ensure!(
            end <= offset + len,
            TablesOverflowSnafu {
                end: end - offset,
                len,
            }
        );

        let regions = read_table::<XvcRegionHeaderRaw, _>(reader, regions_offset, region_count, "XVC regions")?
            .into_iter()
            .map(|raw| XvcRegion { raw })
            .collect();

        let segments =
            read_table::<XvcUpdateSegmentRaw, _>(reader, segments_offset, segment_count, "update segments")?
                .into_iter()
                .map(|raw| XvcUpdateSegment { raw })
                .collect();

        let specifiers = read_table::<XvcRegionSpecifierRaw, _>(
            reader,
            specifiers_offset,
            specifier_count,
            "region specifiers",
        )?
        .into_iter()
        .map(|raw| XvcRegionSpecifier { raw })
        .collect();

        let mut presence = Vec::new();
        if info.version() >= 2 && has_mutable_data {
            presence = vec![0u8; region_count];
            read_exact_at(reader, mutable_offset, &mut presence)
                .context(IoSnafu { what: "region presence info" })?;
        }

        Ok(Self {
            info,
            regions,
            segments,
            specifiers,
            presence,
        })
    }

    /// Writes the tables to `offset` and the presence bytes to
    /// `mutable_offset`.
    pub fn write<W: Write + Seek + ?Sized>(
        &self,
        writer: &mut W,
        offset: u64,
        mutable_offset: u64,
    ) -> io::Result<()> {
        let mut buf = self.info.as_bytes().to_vec();

        for region in &self.regions {
            buf.extend_from_slice(region.raw.as_bytes());
        }
        for segment in &self.segments {
            buf.extend_from_slice(segment.raw.as_bytes());
        }
        for specifier in &self.specifiers {
            buf.extend_from_slice(specifier.raw.as_bytes());
        }

        write_all_at(writer, offset, &buf)?;

        if !self.presence.is_empty() {
            write_all_at(writer, mutable_offset, &self.presence)?;
        }

        Ok(())
    }

    /// Returns the GUID of the CIK for `key_id`, if the key table has one.
    #[must_use]
    pub fn key_guid(&self, key_id: u16) -> Option<Guid> {
        self.info.key_ids().get(key_id as usize).copied()
    }

    /// Total size of the serialized tables.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        (XvcInfo::RAW_SIZE
            + self.regions.len() * XvcRegion::RAW_SIZE
            + self.segments.len() * XvcUpdateSegment::RAW_SIZE
            + self.specifiers.len() * XvcRegionSpecifier::RAW_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn info_field_offsets() {
        let mut info = XvcInfo::new(2);
        info.set_key_count(1);
        info.set_initial_play_offset(0x1122);
        info.set_preview_offset(0x3344);

        let bytes = info.as_bytes();
        assert_eq!(&bytes[0x1D0..0x1D4], &2u32.to_le_bytes());
        assert_eq!(&bytes[0x1DE..0x1E0], &1u16.to_le_bytes());
        assert_eq!(&bytes[0x1E8..0x1F0], &0x1122u64.to_le_bytes());
        assert_eq!(&bytes[0x200..0x208], &0x3344u64.to_le_bytes());
    }

    #[test]
    fn region_id_names() {
        assert_eq!(XvcRegionId::from_u32(0x4000_0005), XvcRegionId::Header);
        assert!(XvcRegionId::EmbeddedXvd.is_unencrypted_metadata());
        assert!(!XvcRegionId::MetadataFilesystem.is_unencrypted_metadata());
        assert_eq!(XvcRegionId::Other(0x1234).to_string(), "0x00001234");
    }

    #[test]
    fn tables_round_trip() {
        let mut data = XvcData::new(vec![
            XvcRegion::new(XvcRegionId::Header, NO_KEY, 0, 0x3000),
            XvcRegion::new(XvcRegionId::Other(0x10), 0, 0x8000, 0x4000),
        ]);
        data.segments.push(XvcUpdateSegment::new(9, 0xDEAD));
        data.info.raw.update_segment_count.set(1);
        data.presence[1] = 0x3;

        let mut storage = Cursor::new(vec![0u8; 0x6000]);
        data.write(&mut storage, 0x1000, 0x5000).unwrap();

        let read = XvcData::read(&mut storage, 0x1000, 0x4000, 0x5000, true).unwrap();
        assert_eq!(read.regions.len(), 2);
        assert_eq!(read.regions[1].offset(), 0x8000);
        assert!(read.regions[1].is_encrypted());
        assert!(!read.regions[0].is_encrypted());
        assert_eq!(read.segments[0].page_num(), 9);
        assert_eq!(read.presence, vec![0, 3]);

        assert_matches!(
            XvcData::read(&mut storage, 0x1000, 0x2000, 0x5000, true),
            Err(ReadError::TablesOverflow { .. })
        );
    }

    #[test]
    fn utf16_decoding() {
        let mut raw = [0u8; 0x10];
        for (i, c) in "Game".encode_utf16().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&c.to_le_bytes());
        }
        assert_eq!(utf16_to_string(&raw), "Game");
    }
}
