//! Merkle-style hash tree covering the hashed area of an XVD.
//!
//! Each tree page holds 0xAA entries of 0x18 bytes, a truncated SHA-256 of
//! one page of the level below. Page 0 of the tree is the top page and its
//! full SHA-256 is stored in the header. Lower levels follow and level 0,
//! which hashes the data pages themselves, comes last.

use std::io::{self, Read, Seek, Write};

use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, warn};

use crate::geometry::{
    HASH_ENTRIES_IN_PAGE, HASH_ENTRY_LENGTH, HASH_ENTRY_LENGTH_ENCRYPTED, PAGE_SIZE,
    page_number_to_offset,
};
use crate::storage::{read_exact_at, write_all_at};

/// Deepest level the addressing math supports.
pub const MAX_LEVEL: u64 = 3;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("hash tree level {level} is not supported"))]
    UnsupportedLevel { level: u64 },

    #[snafu(display("cannot read hash tree page #{page}"))]
    ReadPage { page: u64, source: io::Error },

    #[snafu(display("cannot read data page at 0x{offset:X}"))]
    ReadData { offset: u64, source: io::Error },

    #[snafu(display("cannot read hash entry at 0x{offset:X}"))]
    ReadEntry { offset: u64, source: io::Error },

    #[snafu(display("cannot write hash entry at 0x{offset:X}"))]
    WriteEntry { offset: u64, source: io::Error },
}

#[inline]
const fn entries_pow(exp: u64) -> u64 {
    HASH_ENTRIES_IN_PAGE.pow(exp as u32)
}

/// Returns the number of tree pages at level `index` for `size` hashed
/// pages.
#[must_use]
pub const fn calc_num_hash_blocks_in_level(size: u64, index: u64, resilient: bool) -> u64 {
    let blocks = size.div_ceil(entries_pow(index + 1));

    if resilient { blocks * 2 } else { blocks }
}

/// Returns `(total_pages, levels)` of a tree covering `hashed_pages` pages.
#[must_use]
pub const fn num_hash_pages(hashed_pages: u64, resilient: bool) -> (u64, u64) {
    let mut pages = hashed_pages.div_ceil(HASH_ENTRIES_IN_PAGE);
    let mut levels = 1;

    if pages > 1 {
        let mut result = 2;

        while result > 1 {
            result = calc_num_hash_blocks_in_level(hashed_pages, levels, false);
            levels += 1;
            pages += result;
        }
    }

    if resilient {
        pages *= 2;
    }

    (pages, levels)
}

/// Location of a hash entry inside the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// Tree page holding the entry, relative to the start of the tree.
    pub page: u64,
    /// Index of the entry within the page.
    pub entry: u64,
}

impl EntryLocation {
    /// Byte offset of the entry relative to the start of the tree.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        page_number_to_offset(self.page) + self.entry * HASH_ENTRY_LENGTH
    }
}

/// Returns where the level-`index` entry covering hashed page `block` lives.
///
/// # Errors
///
/// Returns [`Error::UnsupportedLevel`] for levels above [`MAX_LEVEL`].
pub fn hash_block_num_for_block_num(
    levels: u64,
    hashed_pages: u64,
    block: u64,
    index: u64,
    resilient: bool,
) -> Result<EntryLocation, Error> {
    ensure!(index <= MAX_LEVEL, UnsupportedLevelSnafu { level: index });

    let entry = (block / entries_pow(index)) % HASH_ENTRIES_IN_PAGE;

    if index == MAX_LEVEL {
        return Ok(EntryLocation { page: 0, entry });
    }

    let mut page = block / entries_pow(index + 1);
    let mut remaining = levels.saturating_sub(index + 1);

    if index == 0 && remaining > 0 {
        page += hashed_pages.div_ceil(entries_pow(2));
        remaining -= 1;
    }

    if (index == 0 || index == 1) && remaining > 0 {
        page += hashed_pages.div_ceil(entries_pow(3));
        remaining -= 1;
    }

    if remaining > 0 {
        page += hashed_pages.div_ceil(entries_pow(4));
    }

    if resilient {
        page *= 2;
    }

    Ok(EntryLocation { page, entry })
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Geometry of a hash tree stored at a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashTree {
    offset: u64,
    hashed_pages: u64,
    page_count: u64,
    levels: u64,
    resilient: bool,
}

impl HashTree {
    #[must_use]
    pub const fn new(offset: u64, hashed_pages: u64, resilient: bool) -> Self {
        let (page_count, levels) = num_hash_pages(hashed_pages, resilient);

        Self {
            offset,
            hashed_pages,
            page_count,
            levels,
            resilient,
        }
    }

    /// File offset of the top page.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    #[must_use]
    pub const fn levels(&self) -> u64 {
        self.levels
    }

    #[must_use]
    pub const fn hashed_pages(&self) -> u64 {
        self.hashed_pages
    }

    /// Size of the tree in bytes.
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        page_number_to_offset(self.page_count)
    }

    /// File offset of the level-0 entry for hashed page `page`.
    pub fn data_entry_offset(&self, page: u64) -> Result<u64, Error> {
        let loc =
            hash_block_num_for_block_num(self.levels, self.hashed_pages, page, 0, self.resilient)?;

        Ok(self.offset + loc.offset())
    }

    fn read_tree_page<R: Read + Seek + ?Sized>(
        &self,
        reader: &mut R,
        page: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        read_exact_at(reader, self.offset + page_number_to_offset(page), buf)
            .context(ReadPageSnafu { page })
    }

    /// Checks the top page against `top_hash` and every upper level against
    /// the level above it. Stops at the first mismatch.
    pub fn verify<R: Read + Seek + ?Sized>(
        &self,
        reader: &mut R,
        top_hash: &[u8; 32],
    ) -> Result<bool, Error> {
        let mut page = vec![0u8; PAGE_SIZE as usize];

        self.read_tree_page(reader, 0, &mut page)?;
        if sha256(&page) != *top_hash {
            warn!("Top hash block hash mismatch");
            return Ok(false);
        }

        let mut stored = [0u8; HASH_ENTRY_LENGTH as usize];

        for level in 1..self.levels {
            let step = entries_pow(level);
            let mut block = 0;

            while block < self.hashed_pages {
                let lower = self.location(block, level - 1)?;
                let upper = self.location(block, level)?;

                self.read_tree_page(reader, lower.page, &mut page)?;

                let offset = self.offset + upper.offset();
                read_exact_at(reader, offset, &mut stored).context(ReadEntrySnafu { offset })?;

                if sha256(&page)[..HASH_ENTRY_LENGTH as usize] != stored {
                    warn!(level, page = lower.page, "Hash tree entry mismatch");
                    return Ok(false);
                }

                block += step;
            }
        }

        Ok(true)
    }

    /// Rewrites every upper level from the level below it and returns the new
    /// top hash. Level 0 is left as is.
    pub fn recompute<S: Read + Write + Seek + ?Sized>(
        &self,
        storage: &mut S,
    ) -> Result<[u8; 32], Error> {
        let mut page = vec![0u8; PAGE_SIZE as usize];

        for level in 1..self.levels {
            let step = entries_pow(level);
            let mut block = 0;

            while block < self.hashed_pages {
                let lower = self.location(block, level - 1)?;
                let upper = self.location(block, level)?;

                self.read_tree_page(storage, lower.page, &mut page)?;

                let offset = self.offset + upper.offset();
                let hash = sha256(&page);
                write_all_at(storage, offset, &hash[..HASH_ENTRY_LENGTH as usize])
                    .context(WriteEntrySnafu { offset })?;

                block += step;
            }
        }

        self.read_tree_page(storage, 0, &mut page)?;
        let top = sha256(&page);

        debug!(levels = self.levels, pages = self.page_count, "Recomputed hash tree");

        Ok(top)
    }

    /// Compares every page from `data_offset` to `end` with its level-0
    /// entry and returns the indices of all mismatching pages, relative to
    /// `data_offset`.
    pub fn verify_data<R: Read + Seek + ?Sized>(
        &self,
        reader: &mut R,
        data_offset: u64,
        end: u64,
        encrypted: bool,
    ) -> Result<Vec<u64>, Error> {
        let entry_len = entry_length(encrypted);
        let mut page = vec![0u8; PAGE_SIZE as usize];
        let mut stored = [0u8; HASH_ENTRY_LENGTH as usize];
        let mut invalid = Vec::new();

        for index in 0..self.data_page_count(data_offset, end) {
            let offset = data_offset + page_number_to_offset(index);
            read_exact_at(reader, offset, &mut page).context(ReadDataSnafu { offset })?;

            let entry_offset = self.data_entry_offset(index)?;
            read_exact_at(reader, entry_offset, &mut stored[..entry_len])
                .context(ReadEntrySnafu {
                    offset: entry_offset,
                })?;

            if sha256(&page)[..entry_len] != stored[..entry_len] {
                invalid.push(index);
            }
        }

        if !invalid.is_empty() {
            warn!(count = invalid.len(), "Found pages with invalid data hashes");
        }

        Ok(invalid)
    }

    /// Rewrites the level-0 entries of every page from `data_offset` to
    /// `end` whose hash does not match. Encrypted images only get the hash
    /// part rewritten, keeping the stored data unit numbers.
    ///
    /// Returns the number of rewritten entries.
    pub fn rehash_data<S: Read + Write + Seek + ?Sized>(
        &self,
        storage: &mut S,
        data_offset: u64,
        end: u64,
        encrypted: bool,
    ) -> Result<u64, Error> {
        let entry_len = entry_length(encrypted);
        let mut page = vec![0u8; PAGE_SIZE as usize];
        let mut stored = [0u8; HASH_ENTRY_LENGTH as usize];
        let mut rewritten = 0;

        for index in 0..self.data_page_count(data_offset, end) {
            let offset = data_offset + page_number_to_offset(index);
            read_exact_at(storage, offset, &mut page).context(ReadDataSnafu { offset })?;

            let entry_offset = self.data_entry_offset(index)?;
            read_exact_at(storage, entry_offset, &mut stored[..entry_len])
                .context(ReadEntrySnafu {
                    offset: entry_offset,
                })?;

            let hash = sha256(&page);
            if hash[..entry_len] != stored[..entry_len] {
                write_all_at(storage, entry_offset, &hash[..entry_len]).context(
                    WriteEntrySnafu {
                        offset: entry_offset,
                    },
                )?;
                rewritten += 1;
            }
        }

        debug!(rewritten, "Rehashed data pages");

        Ok(rewritten)
    }

    /// Writes the level-0 entry of hashed page `page` from its contents.
    /// Encrypted images only get the hash part written.
    pub fn write_data_entry<S: Write + Seek + ?Sized>(
        &self,
        storage: &mut S,
        page: u64,
        data: &[u8],
        encrypted: bool,
    ) -> Result<(), Error> {
        let entry_len = entry_length(encrypted);
        let offset = self.data_entry_offset(page)?;

        write_all_at(storage, offset, &sha256(data)[..entry_len])
            .context(WriteEntrySnafu { offset })
    }

    fn location(&self, block: u64, level: u64) -> Result<EntryLocation, Error> {
        hash_block_num_for_block_num(self.levels, self.hashed_pages, block, level, self.resilient)
    }

    /// Pages from `data_offset` to `end`, capped at the number of pages the
    /// tree covers.
    fn data_page_count(&self, data_offset: u64, end: u64) -> u64 {
        let pages = end.saturating_sub(data_offset) / PAGE_SIZE;
        pages.min(self.hashed_pages)
    }
}

const fn entry_length(encrypted: bool) -> usize {
    if encrypted {
        HASH_ENTRY_LENGTH_ENCRYPTED as usize
    } else {
        HASH_ENTRY_LENGTH as usize
    }
}
