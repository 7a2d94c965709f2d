//! Page and block arithmetic shared by every XVD structure.
//!
//! All values are byte counts or page/block numbers and never negative, so
//! everything works on `u64`.

/// Size of a page, the unit every XVD section is aligned to.
pub const PAGE_SIZE: u64 = 0x1000;

/// Size of one hash tree entry.
pub const HASH_ENTRY_LENGTH: u64 = 0x18;

/// Size of a level-0 hash entry in an encrypted image. The remaining 4 bytes
/// of the entry hold the XTS data unit number of the page.
pub const HASH_ENTRY_LENGTH_ENCRYPTED: u64 = 0x14;

/// Number of hash entries that fit in a single page (0xAA).
pub const HASH_ENTRIES_IN_PAGE: u64 = PAGE_SIZE / HASH_ENTRY_LENGTH;

/// Number of pages making up one allocation block.
pub const PAGES_PER_BLOCK: u64 = HASH_ENTRIES_IN_PAGE;

/// Size of an allocation block (0xAA000).
pub const BLOCK_SIZE: u64 = PAGE_SIZE * PAGES_PER_BLOCK;

/// Size of the reserved area holding the signature and header.
pub const HEADER_AREA_SIZE: u64 = 0x3000;

/// BAT value marking an unallocated block.
pub const INVALID_SECTOR: u32 = 0xFFFF_FFFF;

#[inline]
#[must_use]
pub const fn page_number_to_offset(page: u64) -> u64 {
    page * PAGE_SIZE
}

#[inline]
#[must_use]
pub const fn block_number_to_offset(block: u64) -> u64 {
    block * BLOCK_SIZE
}

/// Returns the number of pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Returns the number of blocks needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE)
}

#[inline]
#[must_use]
pub const fn pages_to_blocks(pages: u64) -> u64 {
    pages.div_ceil(PAGES_PER_BLOCK)
}

#[inline]
#[must_use]
pub const fn offset_to_page_number(offset: u64) -> u64 {
    offset / PAGE_SIZE
}

#[inline]
#[must_use]
pub const fn offset_to_block_number(offset: u64) -> u64 {
    offset / BLOCK_SIZE
}

#[inline]
#[must_use]
pub const fn in_page_offset(offset: u64) -> u64 {
    offset % PAGE_SIZE
}

#[inline]
#[must_use]
pub const fn in_block_offset(offset: u64) -> u64 {
    offset % BLOCK_SIZE
}

/// Returns the first page of the hashed area that is mapped through the BAT
/// in a dynamic image. Everything before it is metadata, rounded up to a
/// whole block.
#[inline]
#[must_use]
pub const fn query_first_dynamic_page(metadata_pages: u64) -> u64 {
    PAGES_PER_BLOCK * pages_to_blocks(metadata_pages)
}

/// Converts a page number relative to the user data area into an absolute
/// page number within the file.
#[inline]
#[must_use]
pub const fn compute_data_backing_page_number(
    data_page: u64,
    hash_tree_pages: u64,
    mutable_pages: u64,
    embedded_pages: u64,
) -> u64 {
    data_page
        + hash_tree_pages
        + mutable_pages
        + embedded_pages
        + HEADER_AREA_SIZE / PAGE_SIZE
}
