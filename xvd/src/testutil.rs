//! In-memory images for tests.

use std::io::Cursor;

use crate::geometry::{
    BLOCK_SIZE, HEADER_AREA_SIZE, INVALID_SECTOR, PAGE_SIZE, PAGES_PER_BLOCK, bytes_to_blocks,
    bytes_to_pages, page_number_to_offset, query_first_dynamic_page,
};
use crate::header::{ContentType, OdkIndex, VolumeFlags, XvdHeader, XvdType};
use crate::keys::{KeyId, MemoryKeyStore};
use crate::xvc::{NO_KEY, XvcData, XvcRegion, XvcRegionId};
use crate::{LoadOptions, XvdFile};

pub const VDUID: &str = "ab3f50c9-0d1b-4e26-9b7a-00ff12345678";
pub const CIK_GUID: &str = "11223344-5566-7788-99aa-bbccddeeff00";
pub const ODK_KEY: [u8; 32] = [0x3C; 32];
pub const CIK_KEY: [u8; 32] = [0xC1; 32];

pub const FIRST_CONTENT_REGION: XvcRegionId = XvcRegionId::Other(0x4000_0007);
pub const SECOND_CONTENT_REGION: XvcRegionId = XvcRegionId::Other(0x4000_0008);

/// Fill byte of logical drive page `page`.
pub fn page_fill(page: u64) -> u8 {
    (page % 0xFF) as u8 + 1
}

pub fn keys() -> MemoryKeyStore {
    let mut keys = MemoryKeyStore::new();
    keys.load(KeyId::Odk(OdkIndex::RED), &ODK_KEY).unwrap();
    keys.load(KeyId::Cik(CIK_GUID.parse().unwrap()), &CIK_KEY).unwrap();
    keys
}

/// Builds plaintext fixed images, optionally with XVC tables and a hash
/// tree.
pub struct ImageBuilder {
    drive_pages: u64,
    xvc: bool,
    hash_tree: bool,
}

impl ImageBuilder {
    pub fn new(drive_pages: u64) -> Self {
        Self {
            drive_pages,
            xvc: false,
            hash_tree: false,
        }
    }

    pub fn xvc(mut self) -> Self {
        self.xvc = true;
        self
    }

    pub fn hash_tree(mut self) -> Self {
        self.hash_tree = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let content_type = if self.xvc {
            ContentType::Application
        } else {
            ContentType::SystemOs
        };

        let mut header = XvdHeader::new(XvdType::Fixed, content_type);
        header.set_volume_flags(
            VolumeFlags::ENCRYPTION_DISABLED | VolumeFlags::DATA_INTEGRITY_DISABLED,
        );
        header.set_vduid(VDUID.parse().unwrap());
        header.set_odk_keyslot_id(OdkIndex::RED);
        header.set_drive_size(page_number_to_offset(self.drive_pages));
        header.set_user_data_length(PAGE_SIZE as u32);

        // Without a hash tree the user data directly follows the header area
        // and the mutable data page.
        let mutable_pages = u64::from(self.xvc);
        let user_data_offset = HEADER_AREA_SIZE + page_number_to_offset(mutable_pages);
        let xvc_info_offset = user_data_offset + PAGE_SIZE;

        let mut xvc = None;
        let mut xvc_pages = 0;

        if self.xvc {
            header.set_mutable_data_page_count(mutable_pages as u8);

            let table_len = XvcData::new(vec![XvcRegion::new(FIRST_CONTENT_REGION, 0, 0, 0); 3])
                .byte_len();
            xvc_pages = bytes_to_pages(table_len);

            let drive_offset = xvc_info_offset + page_number_to_offset(xvc_pages);
            let half = page_number_to_offset(self.drive_pages / 2);
            let rest = page_number_to_offset(self.drive_pages) - half;

            let data = XvcData::new(vec![
                XvcRegion::new(
                    XvcRegionId::MetadataXvc,
                    NO_KEY,
                    xvc_info_offset,
                    page_number_to_offset(xvc_pages),
                ),
                XvcRegion::new(FIRST_CONTENT_REGION, NO_KEY, drive_offset, half),
                XvcRegion::new(SECOND_CONTENT_REGION, NO_KEY, drive_offset + half, rest),
            ]);

            header.set_xvc_data_length(table_len as u32);
            xvc = Some(data);
        }

        let drive_offset = xvc_info_offset + page_number_to_offset(xvc_pages);
        let mut image = vec![0u8; (drive_offset + page_number_to_offset(self.drive_pages)) as usize];

        image[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
        image[user_data_offset as usize..xvc_info_offset as usize].fill(0xDA);

        for page in 0..self.drive_pages {
            let start = (drive_offset + page_number_to_offset(page)) as usize;
            image[start..start + PAGE_SIZE as usize].fill(page_fill(page));
        }

        let mut cursor = Cursor::new(image);

        if let Some(xvc) = xvc {
            xvc.write(&mut cursor, xvc_info_offset, HEADER_AREA_SIZE).unwrap();
        }

        if self.hash_tree {
            let options = LoadOptions { verify_data: false };
            let mut xvd = XvdFile::open_with(&mut cursor, options).unwrap();
            assert!(xvd.add_hash_tree().unwrap());
            xvd.rehash_data().unwrap();
        }

        cursor.into_inner()
    }
}

/// Builds a plaintext dynamic image of two blocks. The first block of the
/// BAT is allocated and the second is not.
pub fn dynamic_image() -> Vec<u8> {
    let drive_size = 2 * BLOCK_SIZE;

    let mut header = XvdHeader::new(XvdType::Dynamic, ContentType::SystemOs);
    header.set_volume_flags(VolumeFlags::ENCRYPTION_DISABLED | VolumeFlags::DATA_INTEGRITY_DISABLED);
    header.set_vduid(VDUID.parse().unwrap());
    header.set_drive_size(drive_size);
    header.set_user_data_length(PAGE_SIZE as u32);
    header.set_dynamic_header_length((bytes_to_blocks(drive_size) * 4) as u32);

    // One user data page and one BAT page.
    let metadata_pages = header.number_of_metadata_pages();
    let first_dynamic = query_first_dynamic_page(metadata_pages);
    let direct_pages = first_dynamic - metadata_pages;

    let user_data_offset = HEADER_AREA_SIZE;
    let bat_offset = user_data_offset + PAGE_SIZE;
    let drive_offset = bat_offset + PAGE_SIZE;
    // Block 0 is stored right after the directly mapped pages.
    let block_page = metadata_pages + direct_pages;
    let len = user_data_offset + page_number_to_offset(block_page + PAGES_PER_BLOCK);

    let mut image = vec![0u8; len as usize];
    image[..header.as_bytes().len()].copy_from_slice(header.as_bytes());

    let bat = bat_offset as usize;
    image[bat..bat + 4].copy_from_slice(&(block_page as u32).to_le_bytes());
    image[bat + 4..bat + 8].copy_from_slice(&INVALID_SECTOR.to_le_bytes());

    for page in 0..direct_pages + PAGES_PER_BLOCK {
        let start = (drive_offset + page_number_to_offset(page)) as usize;
        image[start..start + PAGE_SIZE as usize].fill(page_fill(page));
    }

    image
}
