use crate::geometry::{
    HEADER_AREA_SIZE, compute_data_backing_page_number, offset_to_page_number,
    page_number_to_offset,
};
use crate::hashtree::{HashTree, num_hash_pages};
use crate::header::XvdHeader;

/// Section offsets and hash tree geometry derived from a header.
///
/// Sections follow each other in a fixed order, each starting at the end of
/// the previous one rounded up to a page. The hash tree only takes space
/// while data integrity is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub embedded_xvd_offset: u64,
    pub mutable_data_offset: u64,
    pub hash_tree_offset: u64,
    pub user_data_offset: u64,
    pub xvc_info_offset: u64,
    pub dynamic_header_offset: u64,
    pub drive_data_offset: u64,
    /// Pages of the hash tree, whether or not it is present.
    pub hash_tree_page_count: u64,
    pub hash_tree_levels: u64,
    pub metadata_pages: u64,
    pub hashed_pages: u64,
    resilient: bool,
}

impl Layout {
    #[must_use]
    pub fn new(header: &XvdHeader) -> Self {
        let metadata_pages = header.number_of_metadata_pages();
        let hashed_pages = header.number_of_hashed_pages();
        let resilient = header.is_resiliency_enabled();
        let (hash_tree_page_count, hash_tree_levels) = num_hash_pages(hashed_pages, resilient);

        let embedded_xvd_offset = HEADER_AREA_SIZE;
        let mutable_data_offset =
            embedded_xvd_offset + page_number_to_offset(header.embedded_xvd_page_count());
        let hash_tree_offset = mutable_data_offset
            + page_number_to_offset(header.mutable_data_page_count().into());

        let user_data_offset = if header.is_data_integrity_enabled() {
            hash_tree_offset + page_number_to_offset(hash_tree_page_count)
        } else {
            hash_tree_offset
        };

        let xvc_info_offset =
            user_data_offset + page_number_to_offset(header.user_data_page_count());
        let dynamic_header_offset =
            xvc_info_offset + page_number_to_offset(header.xvc_info_page_count());
        let drive_data_offset =
            dynamic_header_offset + page_number_to_offset(header.dynamic_header_page_count());

        Self {
            embedded_xvd_offset,
            mutable_data_offset,
            hash_tree_offset,
            user_data_offset,
            xvc_info_offset,
            dynamic_header_offset,
            drive_data_offset,
            hash_tree_page_count,
            hash_tree_levels,
            metadata_pages,
            hashed_pages,
            resilient,
        }
    }

    /// Size of the hash tree in bytes, whether or not it is present.
    #[must_use]
    pub const fn hash_tree_len(&self) -> u64 {
        page_number_to_offset(self.hash_tree_page_count)
    }

    /// File page number of user data page `data_page`, counting the hash
    /// tree only while it is present.
    #[must_use]
    pub const fn data_backing_page(&self, data_page: u64) -> u64 {
        compute_data_backing_page_number(
            data_page,
            offset_to_page_number(self.user_data_offset - self.hash_tree_offset),
            offset_to_page_number(self.hash_tree_offset - self.mutable_data_offset),
            offset_to_page_number(self.mutable_data_offset - self.embedded_xvd_offset),
        )
    }

    #[must_use]
    pub const fn hash_tree(&self) -> HashTree {
        HashTree::new(self.hash_tree_offset, self.hashed_pages, self.resilient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{ContentType, VolumeFlags, XvdType};

    fn header() -> XvdHeader {
        let mut header = XvdHeader::new(XvdType::Fixed, ContentType::Application);
        header.set_embedded_xvd_length(0x1800);
        header.set_mutable_data_page_count(1);
        header.set_user_data_length(0x1000);
        header.set_xvc_data_length(0x2100);
        header.set_dynamic_header_length(0);
        header.set_drive_size(0x4000);
        header
    }

    #[test]
    fn offset_chain_with_hash_tree() {
        let layout = Layout::new(&header());

        assert_eq!(layout.embedded_xvd_offset, 0x3000);
        assert_eq!(layout.mutable_data_offset, 0x5000);
        assert_eq!(layout.hash_tree_offset, 0x6000);
        // 4 drive pages + 1 user data page + 3 XVC pages fit one tree page.
        assert_eq!(layout.hashed_pages, 8);
        assert_eq!(layout.hash_tree_page_count, 1);
        assert_eq!(layout.user_data_offset, 0x7000);
        assert_eq!(layout.xvc_info_offset, 0x8000);
        assert_eq!(layout.dynamic_header_offset, 0xB000);
        assert_eq!(layout.drive_data_offset, 0xB000);

        assert_eq!(layout.data_backing_page(0), 7);
        assert_eq!(layout.data_backing_page(4), 11);
    }

    #[test]
    fn offset_chain_without_hash_tree() {
        let mut header = header();
        header.set_volume_flags(VolumeFlags::DATA_INTEGRITY_DISABLED);
        let layout = Layout::new(&header);

        assert_eq!(layout.hash_tree_offset, 0x6000);
        assert_eq!(layout.user_data_offset, 0x6000);
        assert_eq!(layout.drive_data_offset, 0xA000);
        assert_eq!(layout.hash_tree_len(), 0x1000);

        // The tree pages are not counted while the tree is absent.
        assert_eq!(layout.data_backing_page(0), 6);
    }
}
