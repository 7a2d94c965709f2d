use std::fmt;

use snafu::{Snafu, ensure};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{I64, U16, U32, U64},
};

use crate::geometry::{BLOCK_SIZE, bytes_to_pages};
use crate::guid::Guid;

/// Errors when reading an XVD header.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("XVD header is too small"))]
    TooSmall,

    #[snafu(display("invalid XVD magic"))]
    InvalidMagic,

    #[snafu(display("unsupported XVD format version {version}"))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("unknown XVD type {value}"))]
    UnknownType { value: u32 },
}

pub const XVD_MAGIC: [u8; 8] = *b"msft-xvd";

/// Size of the on-disk header including the signature.
pub const HEADER_SIZE: usize = 0xE00;

/// Size of the RSA signature preceding the header body.
pub const SIGNATURE_SIZE: usize = 0x200;

const MIN_FORMAT_VERSION: u32 = 1;
const MAX_FORMAT_VERSION: u32 = 3;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct XvdExtEntry {
    pub code: U32,
    pub length: U32,
    pub offset: U64,
    pub data_length: U32,
    pub reserved: U32,
}

#[derive(Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct XvdHeaderRaw {
    pub signature: [u8; SIGNATURE_SIZE],   // 0x000
    pub magic: [u8; 8],                    // 0x200 - "msft-xvd"
    pub volume_flags: U32,                 // 0x208
    pub format_version: U32,               // 0x20C
    pub file_time_created: I64,            // 0x210
    pub drive_size: U64,                   // 0x218
    pub vduid: Guid,                       // 0x220
    pub uvuid: Guid,                       // 0x230
    pub top_hash_block_hash: [u8; 0x20],   // 0x240
    pub original_xvc_data_hash: [u8; 0x20], // 0x260
    pub xvd_type: U32,                     // 0x280
    pub content_type: U32,                 // 0x284
    pub embedded_xvd_length: U32,          // 0x288
    pub user_data_length: U32,             // 0x28C
    pub xvc_data_length: U32,              // 0x290
    pub dynamic_header_length: U32,        // 0x294
    pub block_size: U32,                   // 0x298
    pub ext_entries: [XvdExtEntry; 4],     // 0x29C
    pub capabilities: [U16; 8],            // 0x2FC
    pub pe_catalog_hash: [u8; 0x20],       // 0x30C
    pub embedded_xvd_pduid: Guid,          // 0x32C
    pub reserved_33c: [u8; 0x10],          // 0x33C
    pub key_material: [u8; 0x20],          // 0x34C
    pub user_data_hash: [u8; 0x20],        // 0x36C
    pub sandbox_id: [u8; 0x10],            // 0x38C
    pub product_id: Guid,                  // 0x39C
    pub pduid: Guid,                       // 0x3AC
    pub package_version: U64,              // 0x3BC
    pub pe_catalog_caps: [U16; 0x10],      // 0x3C4
    pub pe_catalogs: [u8; 0x80],           // 0x3E4
    pub writeable_expiration_date: U32,    // 0x464
    pub writeable_policy_flags: U32,       // 0x468
    pub persistent_local_storage_size: U32, // 0x46C
    pub mutable_data_page_count: u8,       // 0x470
    pub unknown_471: u8,                   // 0x471
    pub unknown_472: [u8; 0x10],           // 0x472
    pub reserved_482: [u8; 0xA],           // 0x482
    pub sequence_number: U64,              // 0x48C
    pub min_sys_version: U64,              // 0x494
    pub odk_keyslot_id: U32,               // 0x49C
    pub resilient_data_offset: U64,        // 0x4A0
    pub resilient_data_length: U64,        // 0x4A8
    pub reserved_4b0: [u8; 0x950],         // 0x4B0
                                           // 0xE00 - end of header
}

const _: () = assert!(size_of::<XvdHeaderRaw>() == HEADER_SIZE);
const _: () = assert!(size_of::<XvdExtEntry>() == 0x18);

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
pub struct VolumeFlags(u32);

bitflags::bitflags! {
    impl VolumeFlags: u32 {
        const READ_ONLY = 0x1;
        const ENCRYPTION_DISABLED = 0x2;
        const DATA_INTEGRITY_DISABLED = 0x4;
        const LEGACY_SECTOR_SIZE = 0x8;
        const RESILIENCY_ENABLED = 0x10;
        const SRA_READ_ONLY = 0x20;
        const REGION_ID_IN_XTS = 0x40;
        const ERA_SPECIFIC = 0x80;
    }
}

impl fmt::Display for VolumeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(none)");
        }

        let mut first = true;
        let mut write_flag = |name: &str| -> fmt::Result {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", name)
        };

        if self.contains(Self::READ_ONLY) {
            write_flag("Read-only")?;
        }
        if self.contains(Self::ENCRYPTION_DISABLED) {
            write_flag("Encryption disabled")?;
        }
        if self.contains(Self::DATA_INTEGRITY_DISABLED) {
            write_flag("Data integrity disabled")?;
        }
        if self.contains(Self::LEGACY_SECTOR_SIZE) {
            write_flag("Legacy sector size")?;
        }
        if self.contains(Self::RESILIENCY_ENABLED) {
            write_flag("Resiliency enabled")?;
        }
        if self.contains(Self::SRA_READ_ONLY) {
            write_flag("SRA read-only")?;
        }
        if self.contains(Self::REGION_ID_IN_XTS) {
            write_flag("Region ID in XTS")?;
        }
        if self.contains(Self::ERA_SPECIFIC) {
            write_flag("ERA specific")?;
        }

        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            write_flag(&format!("Unknown (0x{unknown:X})"))?;
        }

        Ok(())
    }
}

/// Allocation type of an XVD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XvdType {
    /// Every drive page is stored in the file.
    Fixed,
    /// Drive blocks are allocated on demand through the BAT.
    Dynamic,
}

impl XvdType {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Fixed => 0,
            Self::Dynamic => 1,
        }
    }

    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Fixed),
            1 => Some(Self::Dynamic),
            _ => None,
        }
    }
}

impl fmt::Display for XvdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => f.write_str("Fixed"),
            Self::Dynamic => f.write_str("Dynamic"),
        }
    }
}

/// Content type of an XVD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ContentType {
    Data,
    Title,
    SystemOs,
    EraOs,
    Scratch,
    ResetData,
    Application,
    HostOs,
    X360Stfs,
    X360Fatx,
    X360Gdfx,
    Updater,
    OfflineUpdater,
    Template,
    MteHost,
    MteApp,
    MteTitle,
    MteEraOs,
    EraTools,
    SystemTools,
    SystemAux,
    AcousticModel,
    SystemCodecsVolume,
    QasltPackage,
    AppDlc,
    TitleDlc,
    UniversalDlc,
    SystemDataVolume,
    TestVolume,
    HardwareTestVolume,
    KioskContent,
    HostProfiler,
    Uwa,
    ServerAgent,
    /// Unrecognized content type.
    Unknown(u32),
}

impl ContentType {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Data => 0x00,
            Self::Title => 0x01,
            Self::SystemOs => 0x02,
            Self::EraOs => 0x03,
            Self::Scratch => 0x04,
            Self::ResetData => 0x05,
            Self::Application => 0x06,
            Self::HostOs => 0x07,
            Self::X360Stfs => 0x08,
            Self::X360Fatx => 0x09,
            Self::X360Gdfx => 0x0A,
            Self::Updater => 0x0B,
            Self::OfflineUpdater => 0x0C,
            Self::Template => 0x0D,
            Self::MteHost => 0x0E,
            Self::MteApp => 0x0F,
            Self::MteTitle => 0x10,
            Self::MteEraOs => 0x11,
            Self::EraTools => 0x12,
            Self::SystemTools => 0x13,
            Self::SystemAux => 0x14,
            Self::AcousticModel => 0x15,
            Self::SystemCodecsVolume => 0x16,
            Self::QasltPackage => 0x17,
            Self::AppDlc => 0x18,
            Self::TitleDlc => 0x19,
            Self::UniversalDlc => 0x1A,
            Self::SystemDataVolume => 0x1B,
            Self::TestVolume => 0x1C,
            Self::HardwareTestVolume => 0x1D,
            Self::KioskContent => 0x1E,
            Self::HostProfiler => 0x20,
            Self::Uwa => 0x21,
            Self::ServerAgent => 0x25,
            Self::Unknown(raw) => raw,
        }
    }

    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            0x00 => Self::Data,
            0x01 => Self::Title,
            0x02 => Self::SystemOs,
            0x03 => Self::EraOs,
            0x04 => Self::Scratch,
            0x05 => Self::ResetData,
            0x06 => Self::Application,
            0x07 => Self::HostOs,
            0x08 => Self::X360Stfs,
            0x09 => Self::X360Fatx,
            0x0A => Self::X360Gdfx,
            0x0B => Self::Updater,
            0x0C => Self::OfflineUpdater,
            0x0D => Self::Template,
            0x0E => Self::MteHost,
            0x0F => Self::MteApp,
            0x10 => Self::MteTitle,
            0x11 => Self::MteEraOs,
            0x12 => Self::EraTools,
            0x13 => Self::SystemTools,
            0x14 => Self::SystemAux,
            0x15 => Self::AcousticModel,
            0x16 => Self::SystemCodecsVolume,
            0x17 => Self::QasltPackage,
            0x18 => Self::AppDlc,
            0x19 => Self::TitleDlc,
            0x1A => Self::UniversalDlc,
            0x1B => Self::SystemDataVolume,
            0x1C => Self::TestVolume,
            0x1D => Self::HardwareTestVolume,
            0x1E => Self::KioskContent,
            0x20 => Self::HostProfiler,
            0x21 => Self::Uwa,
            0x25 => Self::ServerAgent,
            other => Self::Unknown(other),
        }
    }

    /// Returns `true` if images of this type carry XVC region tables.
    #[must_use]
    pub const fn is_xvc(self) -> bool {
        matches!(
            self,
            Self::Title
                | Self::Application
                | Self::MteApp
                | Self::MteTitle
                | Self::AppDlc
                | Self::TitleDlc
                | Self::UniversalDlc
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "Unknown (0x{raw:X})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Index of the offline distribution key slot used for the header key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OdkIndex(pub u32);

impl OdkIndex {
    pub const STANDARD: Self = Self(0);
    pub const GREEN: Self = Self(1);
    pub const RED: Self = Self(2);
    pub const INVALID: Self = Self(0xFFFF_FFFF);

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "StandardOdk",
            1 => "GreenOdk",
            2 => "RedOdk",
            0xFFFF_FFFF => "Invalid",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for OdkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Parsed XVD header.
///
/// Headers are read whole, mutated in memory and written back whole.
#[derive(Clone)]
#[must_use]
pub struct XvdHeader {
    raw: XvdHeaderRaw,
}

impl fmt::Debug for XvdHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XvdHeader")
            .field("volume_flags", &self.volume_flags())
            .field("format_version", &self.format_version())
            .field("xvd_type", &self.xvd_type())
            .field("content_type", &self.content_type())
            .field("drive_size", &self.drive_size())
            .field("vduid", &self.vduid())
            .finish_non_exhaustive()
    }
}

impl XvdHeader {
    /// Creates a blank header with valid magic and the latest format
    /// version.
    pub fn new(xvd_type: XvdType, content_type: ContentType) -> Self {
        let mut raw = XvdHeaderRaw::new_zeroed();
        raw.magic = XVD_MAGIC;
        raw.format_version.set(MAX_FORMAT_VERSION);
        raw.xvd_type.set(xvd_type.as_u32());
        raw.content_type.set(content_type.as_u32());
        raw.block_size.set(BLOCK_SIZE as u32);
        raw.odk_keyslot_id.set(OdkIndex::INVALID.0);

        Self { raw }
    }

    /// Parses a header from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too small, has an invalid magic, an
    /// unsupported format version or an unknown XVD type.
    pub fn read(data: &[u8]) -> Result<Self, ReadError> {
        ensure!(data.len() >= HEADER_SIZE, TooSmallSnafu);

        let (raw, _) =
            XvdHeaderRaw::read_from_prefix(data).map_err(|_| TooSmallSnafu.build())?;

        ensure!(raw.magic == XVD_MAGIC, InvalidMagicSnafu);

        let version = raw.format_version.get();
        ensure!(
            (MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION).contains(&version),
            UnsupportedVersionSnafu { version }
        );

        let value = raw.xvd_type.get();
        ensure!(
            XvdType::from_u32(value).is_some(),
            UnknownTypeSnafu { value }
        );

        Ok(Self { raw })
    }

    /// Returns the whole header, signature included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    /// Returns the part of the header covered by the signature.
    #[must_use]
    pub fn signed_data(&self) -> &[u8] {
        &self.raw.as_bytes()[SIGNATURE_SIZE..]
    }

    #[must_use]
    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.raw.signature
    }

    /// Stores `signature` at the start of the signature area and zeroes the
    /// remainder.
    pub fn set_signature(&mut self, signature: &[u8]) {
        let n = signature.len().min(SIGNATURE_SIZE);
        self.raw.signature.fill(0);
        self.raw.signature[..n].copy_from_slice(&signature[..n]);
    }

    #[must_use]
    pub fn volume_flags(&self) -> VolumeFlags {
        VolumeFlags::from_bits_retain(self.raw.volume_flags.get())
    }

    pub fn set_volume_flags(&mut self, flags: VolumeFlags) {
        self.raw.volume_flags.set(flags.bits());
    }

    #[must_use]
    pub fn format_version(&self) -> u32 {
        self.raw.format_version.get()
    }

    /// Returns the creation time as a Windows FILETIME.
    #[must_use]
    pub fn file_time_created(&self) -> i64 {
        self.raw.file_time_created.get()
    }

    #[must_use]
    pub fn drive_size(&self) -> u64 {
        self.raw.drive_size.get()
    }

    pub fn set_drive_size(&mut self, size: u64) {
        self.raw.drive_size.set(size);
    }

    #[must_use]
    pub fn vduid(&self) -> Guid {
        self.raw.vduid
    }

    pub fn set_vduid(&mut self, vduid: Guid) {
        self.raw.vduid = vduid;
    }

    #[must_use]
    pub fn uvuid(&self) -> Guid {
        self.raw.uvuid
    }

    #[must_use]
    pub fn top_hash_block_hash(&self) -> &[u8; 0x20] {
        &self.raw.top_hash_block_hash
    }

    pub fn set_top_hash_block_hash(&mut self, hash: [u8; 0x20]) {
        self.raw.top_hash_block_hash = hash;
    }

    #[must_use]
    pub fn original_xvc_data_hash(&self) -> &[u8; 0x20] {
        &self.raw.original_xvc_data_hash
    }

    /// Returns the allocation type.
    ///
    /// The value is validated by [`read()`](Self::read).
    #[must_use]
    pub fn xvd_type(&self) -> XvdType {
        XvdType::from_u32(self.raw.xvd_type.get()).unwrap_or(XvdType::Fixed)
    }

    #[must_use]
    pub fn content_type(&self) -> ContentType {
        ContentType::from_u32(self.raw.content_type.get())
    }

    #[must_use]
    pub fn embedded_xvd_length(&self) -> u32 {
        self.raw.embedded_xvd_length.get()
    }

    pub fn set_embedded_xvd_length(&mut self, length: u32) {
        self.raw.embedded_xvd_length.set(length);
    }

    #[must_use]
    pub fn user_data_length(&self) -> u32 {
        self.raw.user_data_length.get()
    }

    pub fn set_user_data_length(&mut self, length: u32) {
        self.raw.user_data_length.set(length);
    }

    #[must_use]
    pub fn xvc_data_length(&self) -> u32 {
        self.raw.xvc_data_length.get()
    }

    pub fn set_xvc_data_length(&mut self, length: u32) {
        self.raw.xvc_data_length.set(length);
    }

    #[must_use]
    pub fn dynamic_header_length(&self) -> u32 {
        self.raw.dynamic_header_length.get()
    }

    pub fn set_dynamic_header_length(&mut self, length: u32) {
        self.raw.dynamic_header_length.set(length);
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.raw.block_size.get()
    }

    #[must_use]
    pub fn ext_entries(&self) -> &[XvdExtEntry; 4] {
        &self.raw.ext_entries
    }

    #[must_use]
    pub fn capabilities(&self) -> [u16; 8] {
        self.raw.capabilities.map(|c| c.get())
    }

    #[must_use]
    pub fn embedded_xvd_pduid(&self) -> Guid {
        self.raw.embedded_xvd_pduid
    }

    #[must_use]
    pub fn key_material(&self) -> &[u8; 0x20] {
        &self.raw.key_material
    }

    pub fn set_key_material(&mut self, key: [u8; 0x20]) {
        self.raw.key_material = key;
    }

    #[must_use]
    pub fn user_data_hash(&self) -> &[u8; 0x20] {
        &self.raw.user_data_hash
    }

    /// Returns the sandbox ID with trailing NULs removed.
    #[must_use]
    pub fn sandbox_id(&self) -> &str {
        let bytes = &self.raw.sandbox_id;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..len]).unwrap_or("<invalid>")
    }

    #[must_use]
    pub fn product_id(&self) -> Guid {
        self.raw.product_id
    }

    #[must_use]
    pub fn pduid(&self) -> Guid {
        self.raw.pduid
    }

    /// Returns the package version as `major.minor.build.revision`.
    #[must_use]
    pub fn package_version(&self) -> [u16; 4] {
        let v = self.raw.package_version.get();
        [(v >> 48) as u16, (v >> 32) as u16, (v >> 16) as u16, v as u16]
    }

    #[must_use]
    pub fn pe_catalog_hash(&self) -> &[u8; 0x20] {
        &self.raw.pe_catalog_hash
    }

    #[must_use]
    pub fn writeable_expiration_date(&self) -> u32 {
        self.raw.writeable_expiration_date.get()
    }

    #[must_use]
    pub fn writeable_policy_flags(&self) -> u32 {
        self.raw.writeable_policy_flags.get()
    }

    #[must_use]
    pub fn persistent_local_storage_size(&self) -> u32 {
        self.raw.persistent_local_storage_size.get()
    }

    #[must_use]
    pub fn mutable_data_page_count(&self) -> u8 {
        self.raw.mutable_data_page_count
    }

    pub fn set_mutable_data_page_count(&mut self, count: u8) {
        self.raw.mutable_data_page_count = count;
    }

    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.raw.sequence_number.get()
    }

    #[must_use]
    pub fn min_sys_version(&self) -> u64 {
        self.raw.min_sys_version.get()
    }

    #[must_use]
    pub fn odk_keyslot_id(&self) -> OdkIndex {
        OdkIndex(self.raw.odk_keyslot_id.get())
    }

    pub fn set_odk_keyslot_id(&mut self, odk: OdkIndex) {
        self.raw.odk_keyslot_id.set(odk.0);
    }

    #[must_use]
    pub fn resilient_data_offset(&self) -> u64 {
        self.raw.resilient_data_offset.get()
    }

    #[must_use]
    pub fn resilient_data_length(&self) -> u64 {
        self.raw.resilient_data_length.get()
    }

    #[must_use]
    pub fn embedded_xvd_page_count(&self) -> u64 {
        bytes_to_pages(self.embedded_xvd_length().into())
    }

    #[must_use]
    pub fn user_data_page_count(&self) -> u64 {
        bytes_to_pages(self.user_data_length().into())
    }

    #[must_use]
    pub fn xvc_info_page_count(&self) -> u64 {
        bytes_to_pages(self.xvc_data_length().into())
    }

    #[must_use]
    pub fn dynamic_header_page_count(&self) -> u64 {
        bytes_to_pages(self.dynamic_header_length().into())
    }

    #[must_use]
    pub fn drive_page_count(&self) -> u64 {
        bytes_to_pages(self.drive_size())
    }

    /// Pages between the user data offset and the drive data.
    #[must_use]
    pub fn number_of_metadata_pages(&self) -> u64 {
        self.user_data_page_count() + self.xvc_info_page_count() + self.dynamic_header_page_count()
    }

    /// Pages covered by the hash tree.
    #[must_use]
    pub fn number_of_hashed_pages(&self) -> u64 {
        self.drive_page_count() + self.number_of_metadata_pages()
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        !self
            .volume_flags()
            .contains(VolumeFlags::ENCRYPTION_DISABLED)
    }

    #[must_use]
    pub fn is_data_integrity_enabled(&self) -> bool {
        !self
            .volume_flags()
            .contains(VolumeFlags::DATA_INTEGRITY_DISABLED)
    }

    #[must_use]
    pub fn is_resiliency_enabled(&self) -> bool {
        self.volume_flags()
            .contains(VolumeFlags::RESILIENCY_ENABLED)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.volume_flags().contains(VolumeFlags::READ_ONLY)
    }

    /// Returns `true` if the content type carries XVC tables and the header
    /// reserves space for them.
    #[must_use]
    pub fn has_xvc_info(&self) -> bool {
        self.content_type().is_xvc() && self.xvc_data_length() > 0
    }

    /// Returns the raw header.
    #[must_use]
    pub const fn raw_header(&self) -> &XvdHeaderRaw {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn field_offsets() {
        let mut header = XvdHeader::new(XvdType::Dynamic, ContentType::Title);
        header.set_drive_size(0x1122334455667788);
        header.set_odk_keyslot_id(OdkIndex::GREEN);
        header.set_mutable_data_page_count(7);
        header.set_key_material([0xAB; 0x20]);

        let bytes = header.as_bytes();
        assert_eq!(&bytes[0x200..0x208], b"msft-xvd");
        assert_eq!(&bytes[0x218..0x220], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&bytes[0x280..0x284], &1u32.to_le_bytes());
        assert_eq!(&bytes[0x284..0x288], &1u32.to_le_bytes());
        assert_eq!(&bytes[0x298..0x29C], &0xAA000u32.to_le_bytes());
        assert_eq!(&bytes[0x34C..0x36C], &[0xAB; 0x20]);
        assert_eq!(bytes[0x470], 7);
        assert_eq!(&bytes[0x49C..0x4A0], &1u32.to_le_bytes());
    }

    #[test]
    fn read_validates() {
        let header = XvdHeader::new(XvdType::Fixed, ContentType::Data);
        let mut bytes = header.as_bytes().to_vec();

        assert!(XvdHeader::read(&bytes).is_ok());
        assert_matches!(
            XvdHeader::read(&bytes[..0x100]),
            Err(ReadError::TooSmall)
        );

        bytes[0x280] = 7;
        assert_matches!(
            XvdHeader::read(&bytes),
            Err(ReadError::UnknownType { value: 7 })
        );

        bytes[0x280] = 0;
        bytes[0x20C] = 9;
        assert_matches!(
            XvdHeader::read(&bytes),
            Err(ReadError::UnsupportedVersion { version: 9 })
        );

        bytes[0x200] = b'M';
        assert_matches!(XvdHeader::read(&bytes), Err(ReadError::InvalidMagic));
    }

    #[test]
    fn page_counts() {
        let mut header = XvdHeader::new(XvdType::Fixed, ContentType::Data);
        header.set_drive_size(0x10001);
        header.set_user_data_length(0x1000);
        header.set_xvc_data_length(0x2001);
        header.set_dynamic_header_length(0);

        assert_eq!(header.drive_page_count(), 0x11);
        assert_eq!(header.number_of_metadata_pages(), 1 + 3);
        assert_eq!(header.number_of_hashed_pages(), 0x15);
    }

    #[test]
    fn flags() {
        let mut header = XvdHeader::new(XvdType::Fixed, ContentType::Application);
        assert!(header.is_encrypted());
        assert!(header.is_data_integrity_enabled());

        header.set_volume_flags(
            VolumeFlags::ENCRYPTION_DISABLED | VolumeFlags::DATA_INTEGRITY_DISABLED,
        );
        assert!(!header.is_encrypted());
        assert!(!header.is_data_integrity_enabled());
        assert_eq!(
            header.volume_flags().to_string(),
            "Encryption disabled, Data integrity disabled"
        );
    }

    #[test]
    fn xvc_content_types() {
        assert!(ContentType::Application.is_xvc());
        assert!(ContentType::UniversalDlc.is_xvc());
        assert!(!ContentType::SystemOs.is_xvc());
        assert_eq!(ContentType::from_u32(0x99), ContentType::Unknown(0x99));
        assert_eq!(ContentType::from_u32(0x1A).as_u32(), 0x1A);
    }
}
