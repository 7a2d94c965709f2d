//! A library for parsing, verifying and modifying Xbox One XVD images.
//!
//! XVD is the virtual disk container used by the Xbox One and Xbox Series
//! consoles for games, apps and system volumes. Streamed content (XVC) adds
//! region tables with per-region content keys.
//!
//! # Features
//!
//! - Parse the header, section layout and XVC region tables
//! - Verify the hash tree and per-page data hashes
//! - Decrypt and encrypt user data (header key material or per-region CIKs)
//! - Add and remove the hash tree
//! - Read the logical drive of fixed and dynamic images
//! - Verify and re-sign headers with BCRYPT RSA keys
//!
//! # Example
//!
//! ```no_run
//! use xvd::XvdFile;
//!
//! let file = std::fs::File::open("game.xvd").unwrap();
//! let xvd = XvdFile::open(file).unwrap();
//!
//! println!("Content type: {}", xvd.header().content_type());
//! println!("Drive size:   {} bytes", xvd.header().drive_size());
//! println!("Hash tree:    {}", xvd.is_hash_tree_valid());
//! ```
//!
//! # Mutations
//!
//! Mutating operations rewrite the backing storage in place. [`XvdFile::save()`]
//! recomputes the upper levels of the hash tree but never the level-0 data
//! hashes, so after [`XvdFile::add_hash_tree()`] the tree holds zero entries
//! until [`XvdFile::rehash_data()`] is called. Encrypting and decrypting
//! rewrite the level-0 entries of the pages they transform.

use std::io::{self, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use rand::RngCore;
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, info, warn};

use self::crypto::AesXtsCipher;
use self::geometry::{
    HASH_ENTRY_LENGTH_ENCRYPTED, INVALID_SECTOR, PAGE_SIZE, PAGES_PER_BLOCK, bytes_to_blocks,
    page_number_to_offset, query_first_dynamic_page,
};
use self::guid::Guid;
use self::header::{OdkIndex, VolumeFlags, XvdHeader, XvdType};
use self::keys::{KeyId, KeyStore};
use self::signature::BcryptKey;
use self::storage::{Storage, read_exact_at, write_all_at};
use self::xvc::XvcData;

pub use self::drive::DriveReader;
pub use self::layout::Layout;

use crypt_error::*;
use data_error::*;
use hash_tree_error::*;
use open_error::*;
use save_error::*;
use sign_error::*;

pub mod crypto;
mod drive;
pub mod geometry;
pub mod guid;
pub mod hashtree;
pub mod header;
pub mod keys;
mod layout;
pub mod signature;
pub mod storage;
#[cfg(test)]
mod testutil;
pub mod xvc;

/// Region ID used in the tweak of non-XVC user data.
pub const USER_DATA_REGION_ID: u32 = 1;

const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Options for [`XvdFile::open_with()`].
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Check every data page against its level-0 hash entry.
    pub verify_data: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { verify_data: true }
    }
}

/// An open XVD image.
///
/// The image owns its storage until dropped or [`into_inner()`](Self::into_inner)
/// is called.
#[must_use]
pub struct XvdFile<S: Storage> {
    storage: S,
    header: XvdHeader,
    layout: Layout,
    xvc: Option<XvcData>,
    hash_tree_valid: bool,
    /// `None` until the data hashes have been checked.
    invalid_pages: Option<Vec<u64>>,
}

impl<S: Storage> std::fmt::Debug for XvdFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XvdFile")
            .field("header", &self.header)
            .field("layout", &self.layout)
            .field("hash_tree_valid", &self.hash_tree_valid)
            .field("invalid_pages", &self.invalid_pages.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

impl<S: Storage> XvdFile<S> {
    /// Opens an image with default options.
    pub fn open(storage: S) -> Result<Self, OpenError> {
        Self::open_with(storage, LoadOptions::default())
    }

    /// Opens an image.
    ///
    /// A broken hash tree does not fail the load. Check
    /// [`is_hash_tree_valid()`](Self::is_hash_tree_valid) and
    /// [`invalid_data_pages()`](Self::invalid_data_pages) instead.
    pub fn open_with(mut storage: S, options: LoadOptions) -> Result<Self, OpenError> {
        let len = storage.byte_len().context(GetLengthFailedSnafu)?;
        ensure!(len >= header::HEADER_SIZE as u64, TruncatedSnafu { len });

        let mut raw = vec![0u8; header::HEADER_SIZE];
        read_exact_at(&mut storage, 0, &mut raw).context(ReadHeaderIoFailedSnafu)?;
        let header = XvdHeader::read(&raw).context(ReadHeaderFailedSnafu)?;

        let layout = Layout::new(&header);
        debug!(?layout, "Computed XVD layout");

        ensure!(
            layout.drive_data_offset < len,
            DriveDataOutOfRangeSnafu {
                offset: layout.drive_data_offset,
                len,
            }
        );

        let xvc = if header.has_xvc_info() {
            let data = XvcData::read(
                &mut storage,
                layout.xvc_info_offset,
                header.xvc_data_length().into(),
                layout.mutable_data_offset,
                header.mutable_data_page_count() > 0,
            )
            .context(ReadXvcFailedSnafu)?;
            Some(data)
        } else {
            None
        };

        let mut xvd = Self {
            storage,
            header,
            layout,
            xvc,
            hash_tree_valid: false,
            invalid_pages: None,
        };

        if xvd.header.is_data_integrity_enabled() {
            xvd.hash_tree_valid = xvd.check_hash_tree();

            if options.verify_data {
                xvd.invalid_pages = Some(xvd.check_data_hashes(len));
            }
        }

        Ok(xvd)
    }

    /// Returns the storage, dropping the parsed state.
    pub fn into_inner(self) -> S {
        self.storage
    }

    pub fn header(&self) -> &XvdHeader {
        &self.header
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Returns the XVC tables, if the image has them.
    #[must_use]
    pub fn xvc(&self) -> Option<&XvcData> {
        self.xvc.as_ref()
    }

    /// Returns `true` if the hash tree matched the header when last checked.
    /// Always `false` without a hash tree.
    #[must_use]
    pub fn is_hash_tree_valid(&self) -> bool {
        self.hash_tree_valid
    }

    /// Pages, relative to the user data offset, whose data hash did not
    /// match when last checked. `None` if the data hashes were not checked.
    #[must_use]
    pub fn invalid_data_pages(&self) -> Option<&[u64]> {
        self.invalid_pages.as_deref()
    }

    /// Returns `true` if the data hashes have been checked and all matched.
    #[must_use]
    pub fn is_data_valid(&self) -> bool {
        self.invalid_pages.as_ref().is_some_and(Vec::is_empty)
    }

    pub fn storage_len(&mut self) -> io::Result<u64> {
        self.storage.byte_len()
    }

    fn check_hash_tree(&mut self) -> bool {
        let tree = self.layout.hash_tree();
        let top = *self.header.top_hash_block_hash();

        match tree.verify(&mut self.storage, &top) {
            Ok(valid) => valid,
            Err(e) => {
                warn!("Cannot verify hash tree: {e}");
                false
            }
        }
    }

    fn check_data_hashes(&mut self, len: u64) -> Vec<u64> {
        let tree = self.layout.hash_tree();
        let encrypted = self.header.is_encrypted();

        match tree.verify_data(&mut self.storage, self.layout.user_data_offset, len, encrypted) {
            Ok(invalid) => invalid,
            Err(e) => {
                warn!("Cannot verify data hashes: {e}");
                (0..self.layout.hashed_pages).collect()
            }
        }
    }

    /// Verifies the hash tree against the header again.
    pub fn verify_hash_tree(&mut self) -> bool {
        self.hash_tree_valid =
            self.header.is_data_integrity_enabled() && self.check_hash_tree();
        self.hash_tree_valid
    }

    /// Verifies every data page again and returns the mismatching pages.
    pub fn verify_data_hashes(&mut self) -> Result<&[u64], HashTreeError> {
        ensure!(
            self.header.is_data_integrity_enabled(),
            NoHashTreeSnafu
        );

        let len = self.storage.byte_len().context(IoSnafu)?;
        let tree = self.layout.hash_tree();
        let encrypted = self.header.is_encrypted();

        let invalid = tree
            .verify_data(&mut self.storage, self.layout.user_data_offset, len, encrypted)
            .context(HashFailedSnafu)?;

        Ok(self.invalid_pages.insert(invalid).as_slice())
    }

    /// Writes the XVC tables and the header back to the storage. With data
    /// integrity enabled the upper hash tree levels and the top hash are
    /// recomputed first.
    pub fn save(&mut self) -> Result<(), SaveError> {
        if let Some(xvc) = &self.xvc {
            xvc.write(
                &mut self.storage,
                self.layout.xvc_info_offset,
                self.layout.mutable_data_offset,
            )
            .context(WriteXvcFailedSnafu)?;
        }

        if self.header.is_data_integrity_enabled() {
            let tree = self.layout.hash_tree();
            let top = tree
                .recompute(&mut self.storage)
                .context(RecomputeFailedSnafu)?;

            self.header.set_top_hash_block_hash(top);
            self.hash_tree_valid = true;
        }

        write_all_at(&mut self.storage, 0, self.header.as_bytes())
            .context(WriteHeaderFailedSnafu)?;
        self.storage.flush().context(WriteHeaderFailedSnafu)?;

        debug!("Saved XVD header");

        Ok(())
    }

    /// Rewrites the level-0 hash of every data page, then saves.
    ///
    /// Returns the number of pages whose hash changed.
    pub fn rehash_data(&mut self) -> Result<u64, HashTreeError> {
        ensure!(
            self.header.is_data_integrity_enabled(),
            NoHashTreeSnafu
        );

        let len = self.storage.byte_len().context(IoSnafu)?;
        let tree = self.layout.hash_tree();
        let rewritten = tree
            .rehash_data(
                &mut self.storage,
                self.layout.user_data_offset,
                len,
                self.header.is_encrypted(),
            )
            .context(HashFailedSnafu)?;

        self.save().context(SaveFailedSnafu)?;
        self.invalid_pages = Some(Vec::new());

        info!(rewritten, "Rehashed data pages");

        Ok(rewritten)
    }

    /// Inserts an empty hash tree and enables data integrity.
    ///
    /// Returns `false` if the image already has a hash tree. The level-0
    /// entries are zero until [`rehash_data()`](Self::rehash_data) is called.
    pub fn add_hash_tree(&mut self) -> Result<bool, HashTreeError> {
        if self.header.is_data_integrity_enabled() {
            return Ok(false);
        }

        let offset = self.layout.hash_tree_offset;
        let len = self.layout.hash_tree_len();

        storage::insert_bytes(&mut self.storage, offset, len).context(IoSnafu)?;
        self.shift_after(offset, len, true);

        let mut flags = self.header.volume_flags();
        flags.remove(VolumeFlags::DATA_INTEGRITY_DISABLED);
        self.header.set_volume_flags(flags);
        self.layout = Layout::new(&self.header);
        self.invalid_pages = None;

        self.save().context(SaveFailedSnafu)?;

        info!(
            offset = format_args!("0x{offset:X}"),
            pages = self.layout.hash_tree_page_count,
            "Added hash tree"
        );

        Ok(true)
    }

    /// Removes the hash tree and disables data integrity.
    ///
    /// Returns `false` if the image has no hash tree.
    pub fn remove_hash_tree(&mut self) -> Result<bool, HashTreeError> {
        if !self.header.is_data_integrity_enabled() {
            return Ok(false);
        }

        let offset = self.layout.hash_tree_offset;
        let len = self.layout.hash_tree_len();

        storage::delete_bytes(&mut self.storage, offset, len).context(IoSnafu)?;
        self.shift_after(offset, len, false);

        let mut flags = self.header.volume_flags();
        flags.insert(VolumeFlags::DATA_INTEGRITY_DISABLED);
        self.header.set_volume_flags(flags);
        self.header.set_top_hash_block_hash([0u8; 32]);
        self.layout = Layout::new(&self.header);
        self.hash_tree_valid = false;
        self.invalid_pages = None;

        self.save().context(SaveFailedSnafu)?;

        info!(offset = format_args!("0x{offset:X}"), "Removed hash tree");

        Ok(true)
    }

    /// Moves every XVC offset at or after `offset` by `len` bytes.
    fn shift_after(&mut self, offset: u64, len: u64, insert: bool) {
        let Some(xvc) = &mut self.xvc else {
            return;
        };

        let shift = |value: u64| -> u64 {
            if insert {
                if value >= offset {
                    value.saturating_add(len)
                } else {
                    value
                }
            } else if value >= offset.saturating_add(len) {
                value - len
            } else if value >= offset {
                offset
            } else {
                value
            }
        };

        for region in &mut xvc.regions {
            let start = region.offset();
            let end = start.saturating_add(region.length());

            if start < offset && end > offset {
                // Region spans the hash tree.
                let length = if insert {
                    region.length().saturating_add(len)
                } else {
                    region.length().saturating_sub(len)
                };
                region.set_length(length);
            } else {
                region.set_offset(shift(start));
            }
        }

        for segment in &mut xvc.segments {
            let page_offset = page_number_to_offset(segment.page_num().into());
            segment.set_page_num((shift(page_offset) / PAGE_SIZE) as u32);
        }

        let initial_play = xvc.info.initial_play_offset();
        xvc.info.set_initial_play_offset(shift(initial_play));

        let preview = xvc.info.preview_offset();
        xvc.info.set_preview_offset(shift(preview));
    }

    /// Returns the data unit of the page at `offset` within a section
    /// starting at `section_offset`.
    fn data_unit(&mut self, section_offset: u64, offset: u64) -> Result<u32, CryptError> {
        if !self.header.is_data_integrity_enabled() {
            return Ok(((offset - section_offset) / PAGE_SIZE) as u32);
        }

        let page = (offset - self.layout.user_data_offset) / PAGE_SIZE;
        let entry = self
            .layout
            .hash_tree()
            .data_entry_offset(page)
            .context(LocateDataUnitFailedSnafu)?;

        self.storage
            .seek(io::SeekFrom::Start(entry + HASH_ENTRY_LENGTH_ENCRYPTED))
            .context(TransformIoSnafu)?;

        self.storage
            .read_u32::<LittleEndian>()
            .context(TransformIoSnafu)
    }

    /// Resolves the ciphers of every span to transform, without writing
    /// anything.
    fn plan_crypt<K: KeyStore + ?Sized>(
        &self,
        keys: &K,
        decrypt: bool,
        cik: Option<Guid>,
        odk: OdkIndex,
    ) -> Result<CryptPlan, CryptError> {
        let vduid = self.header.vduid();
        let mut spans = Vec::new();
        let mut key_material = None;

        if let Some(xvc) = &self.xvc {
            let content_key = match (decrypt, cik) {
                (false, Some(guid)) => Some(require_key(keys, &KeyId::Cik(guid))?),
                (false, None) => return MissingCikSnafu.fail(),
                (true, _) => None,
            };

            for (index, region) in xvc.regions.iter().enumerate() {
                if region.id().is_unencrypted_metadata() {
                    continue;
                }
                if decrypt && !region.is_encrypted() {
                    continue;
                }

                ensure!(
                    region.offset() >= self.layout.user_data_offset,
                    RegionOutOfRangeSnafu { index }
                );

                let key = match content_key {
                    Some(key) => key,
                    None => {
                        let key_id = region.key_id();
                        let guid = xvc
                            .key_guid(key_id)
                            .ok_or_else(|| KeyIdNotInTableSnafu { key_id }.build())?;
                        require_key(keys, &KeyId::Cik(guid))?
                    }
                };

                let seed = AesXtsCipher::tweak_seed(region.id().as_u32(), &vduid);
                spans.push(CryptSpan {
                    offset: region.offset(),
                    length: region.length(),
                    cipher: AesXtsCipher::from_content_key(&key, seed),
                });
            }
        } else {
            let odk_key = keys
                .require(&KeyId::Odk(odk))
                .context(ResolveKeyFailedSnafu)?;
            let mut content_key = *self.header.key_material();

            // The header stores the content key encrypted with the ODK.
            let stored = if decrypt {
                crypto::ecb_decrypt(odk_key, &mut content_key).context(CipherSnafu)?;
                content_key
            } else {
                if content_key.iter().all(|&b| b == 0) {
                    rand::thread_rng().fill_bytes(&mut content_key);
                    debug!("Generated new content key");
                }

                let mut wrapped = content_key;
                crypto::ecb_encrypt(odk_key, &mut wrapped).context(CipherSnafu)?;
                wrapped
            };
            key_material = Some(stored);

            let seed = AesXtsCipher::tweak_seed(USER_DATA_REGION_ID, &vduid);
            spans.push(CryptSpan {
                offset: self.layout.user_data_offset,
                length: 0,
                cipher: AesXtsCipher::from_content_key(&content_key, seed),
            });
        }

        debug!(spans = spans.len(), "Planned crypto transform");

        Ok(CryptPlan {
            spans,
            key_material,
        })
    }

    /// Transforms every span page by page. With data integrity enabled the
    /// level-0 entry of each full hashed page is rewritten from the new
    /// contents, keeping the data unit when the result is ciphertext.
    fn apply_crypt(&mut self, plan: &CryptPlan, decrypt: bool) -> Result<(), CryptError> {
        let file_len = self.storage.byte_len().context(TransformIoSnafu)?;
        let mut page = vec![0u8; PAGE_SIZE as usize];
        let tree = self
            .header
            .is_data_integrity_enabled()
            .then(|| self.layout.hash_tree());

        for span in &plan.spans {
            // A zero length means "to the end of the file".
            let end = if span.length == 0 {
                file_len
            } else {
                span.offset.saturating_add(span.length).min(file_len)
            };

            let mut offset = span.offset;

            while offset < end {
                let n = PAGE_SIZE.min(end - offset) as usize;
                let unit = self.data_unit(span.offset, offset)?;

                read_exact_at(&mut self.storage, offset, &mut page[..n])
                    .context(TransformIoSnafu)?;

                if decrypt {
                    span.cipher.decrypt_data_unit(&mut page[..n], unit);
                } else {
                    span.cipher.encrypt_data_unit(&mut page[..n], unit);
                }

                write_all_at(&mut self.storage, offset, &page[..n]).context(TransformIoSnafu)?;

                if let Some(tree) = &tree {
                    let index = (offset - self.layout.user_data_offset) / PAGE_SIZE;
                    if n == PAGE_SIZE as usize && index < self.layout.hashed_pages {
                        tree.write_data_entry(&mut self.storage, index, &page, !decrypt)
                            .context(RehashFailedSnafu)?;
                    }
                }

                offset += n as u64;
            }
        }

        Ok(())
    }

    /// Decrypts the user data.
    ///
    /// Non-XVC images use the header key material, decrypted with the ODK
    /// from the header or `odk_override`. XVC images decrypt each region
    /// with the CIK named by its key ID. Every key is resolved before the
    /// first byte is written.
    pub fn decrypt<K: KeyStore + ?Sized>(
        &mut self,
        keys: &K,
        odk_override: Option<OdkIndex>,
    ) -> Result<(), CryptError> {
        ensure!(self.header.is_encrypted(), AlreadyDecryptedSnafu);

        let odk = odk_override.unwrap_or(self.header.odk_keyslot_id());
        let plan = self.plan_crypt(keys, true, None, odk)?;

        self.apply_crypt(&plan, true)?;

        if let Some(material) = plan.key_material {
            self.header.set_key_material(material);
        }

        let mut flags = self.header.volume_flags();
        flags.insert(VolumeFlags::ENCRYPTION_DISABLED);
        self.header.set_volume_flags(flags);

        self.save().context(SaveSnafu)?;

        info!(spans = plan.spans.len(), "Decrypted XVD");

        Ok(())
    }

    /// Encrypts the user data.
    ///
    /// XVC images need the GUID of a loaded CIK, which is stored as key 0
    /// and used for every content region. Non-XVC images use the header key
    /// material, generated if it is all zero, and store it encrypted with
    /// the ODK.
    pub fn encrypt<K: KeyStore + ?Sized>(
        &mut self,
        keys: &K,
        cik: Option<Guid>,
        odk_override: Option<OdkIndex>,
    ) -> Result<(), CryptError> {
        ensure!(!self.header.is_encrypted(), AlreadyEncryptedSnafu);

        let odk = odk_override.unwrap_or(self.header.odk_keyslot_id());
        let plan = self.plan_crypt(keys, false, cik, odk)?;

        self.apply_crypt(&plan, false)?;

        if let Some(material) = plan.key_material {
            self.header.set_key_material(material);
            self.header.set_odk_keyslot_id(odk);
        }

        if let (Some(xvc), Some(guid)) = (&mut self.xvc, cik) {
            xvc.info.set_key_id(0, guid);
            if xvc.info.key_count() == 0 {
                xvc.info.set_key_count(1);
            }

            for region in &mut xvc.regions {
                if !region.id().is_unencrypted_metadata() {
                    region.set_key_id(0);
                }
            }
        }

        let mut flags = self.header.volume_flags();
        flags.remove(VolumeFlags::ENCRYPTION_DISABLED);
        flags.insert(VolumeFlags::READ_ONLY);
        self.header.set_volume_flags(flags);

        self.save().context(SaveSnafu)?;

        info!(spans = plan.spans.len(), "Encrypted XVD");

        Ok(())
    }

    /// Returns the file offset of hashed page `page`, or `None` if the page
    /// lies in an unallocated block of a dynamic image.
    pub fn resolve_bat_offset(&mut self, page: u64) -> Result<Option<u64>, DataError> {
        ensure!(page < self.layout.hashed_pages, PageOutOfRangeSnafu { page });

        let direct = page_number_to_offset(self.layout.data_backing_page(page));

        if self.header.xvd_type() == XvdType::Fixed {
            return Ok(Some(direct));
        }

        let first_dynamic = query_first_dynamic_page(self.layout.metadata_pages);
        if page < first_dynamic {
            return Ok(Some(direct));
        }

        let block = (page - first_dynamic) / PAGES_PER_BLOCK;
        let page_in_block = (page - first_dynamic) % PAGES_PER_BLOCK;

        ensure!(
            block < bytes_to_blocks(self.header.drive_size()),
            PageOutOfRangeSnafu { page }
        );

        let entry_offset = self.layout.dynamic_header_offset + block * 4;
        self.storage
            .seek(io::SeekFrom::Start(entry_offset))
            .context(ReadSnafu)?;
        let entry = self.storage.read_u32::<LittleEndian>().context(ReadSnafu)?;

        if entry == INVALID_SECTOR {
            return Ok(None);
        }

        Ok(Some(page_number_to_offset(
            self.layout.data_backing_page(u64::from(entry) + page_in_block),
        )))
    }

    /// Returns a reader over the logical drive. Unallocated blocks read as
    /// zeros. Data is returned as stored, so an encrypted image yields
    /// ciphertext.
    pub fn drive_reader(&mut self) -> DriveReader<'_, S> {
        DriveReader::new(self)
    }

    fn read_range(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, DataError> {
        let mut buf = vec![0u8; len as usize];
        read_exact_at(&mut self.storage, offset, &mut buf).context(ReadSnafu)?;
        Ok(buf)
    }

    /// Returns the embedded XVD, empty if there is none.
    pub fn embedded_xvd(&mut self) -> Result<Vec<u8>, DataError> {
        let len = self.header.embedded_xvd_length().into();
        self.read_range(self.layout.embedded_xvd_offset, len)
    }

    /// Returns the user data section.
    pub fn user_data(&mut self) -> Result<Vec<u8>, DataError> {
        let len = self.header.user_data_length().into();
        self.read_range(self.layout.user_data_offset, len)
    }

    /// Copies XVC region `index` to `writer` and returns the number of bytes
    /// written.
    pub fn extract_region<W: Write + ?Sized>(
        &mut self,
        index: usize,
        writer: &mut W,
    ) -> Result<u64, DataError> {
        let region = self
            .xvc
            .as_ref()
            .ok_or_else(|| NoXvcDataSnafu.build())?
            .regions
            .get(index)
            .copied()
            .ok_or_else(|| RegionNotFoundSnafu { index }.build())?;

        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut offset = region.offset();
        let end = offset
            .checked_add(region.length())
            .ok_or_else(|| RegionOutOfBoundsSnafu { index }.build())?;

        while offset < end {
            let n = (COPY_CHUNK_SIZE as u64).min(end - offset) as usize;
            read_exact_at(&mut self.storage, offset, &mut buf[..n]).context(ReadSnafu)?;
            writer.write_all(&buf[..n]).context(WriteSnafu)?;
            offset += n as u64;
        }

        Ok(region.length())
    }

    /// Checks the header signature with the signing key `name`.
    pub fn verify_signature<K: KeyStore + ?Sized>(
        &self,
        keys: &K,
        name: &str,
    ) -> Result<bool, SignError> {
        let key = load_signing_key(keys, name)?;

        Ok(signature::verify(
            &key,
            self.header.signed_data(),
            self.header.signature(),
        ))
    }

    /// Signs the header with the signing key `name` and writes it back.
    pub fn resign<K: KeyStore + ?Sized>(&mut self, keys: &K, name: &str) -> Result<(), SignError> {
        let key = load_signing_key(keys, name)?;
        let signature =
            signature::sign(&key, self.header.signed_data()).context(SignFailedSnafu)?;

        self.header.set_signature(&signature);

        write_all_at(&mut self.storage, 0, self.header.as_bytes())
            .context(WriteHeaderSnafu)?;
        self.storage.flush().context(WriteHeaderSnafu)?;

        info!(key = name, "Re-signed XVD header");

        Ok(())
    }
}

/// Returns a 32-byte content key.
fn require_key<K: KeyStore + ?Sized>(keys: &K, id: &KeyId) -> Result<[u8; 32], CryptError> {
    let data = keys.require(id).context(ResolveKeyFailedSnafu)?;

    data.try_into()
        .map_err(|_| InvalidContentKeySnafu { len: data.len() }.build())
}

fn load_signing_key<K: KeyStore + ?Sized>(keys: &K, name: &str) -> Result<BcryptKey, SignError> {
    let blob = keys
        .require(&KeyId::Signing(name.to_owned()))
        .context(ResolveSigningKeySnafu)?;

    BcryptKey::from_blob(blob).context(ParseKeySnafu)
}

struct CryptSpan {
    offset: u64,
    /// Zero for "to the end of the file".
    length: u64,
    cipher: AesXtsCipher,
}

struct CryptPlan {
    spans: Vec<CryptSpan>,
    /// Header key material to store after the transform.
    key_material: Option<[u8; 32]>,
}

/// Errors for [`XvdFile::open()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot get storage length"))]
    GetLengthFailed { source: io::Error },

    #[snafu(display("image of {len} bytes is too small for an XVD header"))]
    Truncated { len: u64 },

    #[snafu(display("cannot read header"))]
    ReadHeaderIoFailed { source: io::Error },

    #[snafu(display("cannot parse header"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("drive data offset 0x{offset:X} is past the end of the image (0x{len:X})"))]
    DriveDataOutOfRange { offset: u64, len: u64 },

    #[snafu(display("cannot read XVC tables"))]
    ReadXvcFailed { source: xvc::ReadError },
}

/// Errors for [`XvdFile::save()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum SaveError {
    #[snafu(display("cannot write XVC tables"))]
    WriteXvcFailed { source: io::Error },

    #[snafu(display("cannot recompute hash tree"))]
    RecomputeFailed { source: hashtree::Error },

    #[snafu(display("cannot write header"))]
    WriteHeaderFailed { source: io::Error },
}

/// Errors for [`XvdFile::decrypt()`] and [`XvdFile::encrypt()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum CryptError {
    #[snafu(display("image is already decrypted"))]
    AlreadyDecrypted,

    #[snafu(display("image is already encrypted"))]
    AlreadyEncrypted,

    #[snafu(display("encrypting an XVC image requires a CIK"))]
    MissingCik,

    #[snafu(display("key ID {key_id} is not in the XVC key table"))]
    KeyIdNotInTable { key_id: u16 },

    #[snafu(display("cannot resolve key"))]
    ResolveKeyFailed { source: keys::KeyError },

    #[snafu(display("content key must be 32 bytes, found {len}"))]
    InvalidContentKey { len: usize },

    #[snafu(display("cannot use key"))]
    Cipher { source: crypto::CipherError },

    #[snafu(display("region #{index} lies before the user data"))]
    RegionOutOfRange { index: usize },

    #[snafu(display("cannot locate data unit"))]
    LocateDataUnitFailed { source: hashtree::Error },

    #[snafu(display("I/O error while transforming data"))]
    TransformIo { source: io::Error },

    #[snafu(display("cannot update data hash"))]
    RehashFailed { source: hashtree::Error },

    #[snafu(display("cannot save image"))]
    Save { source: SaveError },
}

/// Errors for hash tree operations.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum HashTreeError {
    #[snafu(display("image has no hash tree"))]
    NoHashTree,

    #[snafu(display("cannot resize image"))]
    Io { source: io::Error },

    #[snafu(display("cannot hash data"))]
    HashFailed { source: hashtree::Error },

    #[snafu(display("cannot save image"))]
    SaveFailed { source: SaveError },
}

/// Errors for reading data out of an image.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum DataError {
    #[snafu(display("page #{page} is outside the drive"))]
    PageOutOfRange { page: u64 },

    #[snafu(display("image has no XVC tables"))]
    NoXvcData,

    #[snafu(display("region #{index} does not exist"))]
    RegionNotFound { index: usize },

    #[snafu(display("region #{index} extends past the addressable range"))]
    RegionOutOfBounds { index: usize },

    #[snafu(display("cannot read image"))]
    Read { source: io::Error },

    #[snafu(display("cannot write output"))]
    Write { source: io::Error },
}

/// Errors for header signing.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum SignError {
    #[snafu(display("cannot resolve signing key"))]
    ResolveSigningKey { source: keys::KeyError },

    #[snafu(display("cannot parse signing key"))]
    ParseKey { source: signature::Error },

    #[snafu(display("cannot sign header"))]
    SignFailed { source: signature::Error },

    #[snafu(display("cannot write header"))]
    WriteHeader { source: io::Error },
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use assert_matches::assert_matches;

    use super::*;
    use crate::header::ContentType;
    use crate::keys::MemoryKeyStore;
    use crate::testutil::{self, CIK_GUID, ImageBuilder, page_fill};
    use crate::xvc::{NO_KEY, XvcRegionId};

    type MemoryXvd = XvdFile<Cursor<Vec<u8>>>;

    fn open(image: Vec<u8>) -> MemoryXvd {
        XvdFile::open(Cursor::new(image)).unwrap()
    }

    fn bytes(xvd: MemoryXvd) -> Vec<u8> {
        xvd.into_inner().into_inner()
    }

    fn drive(xvd: &mut MemoryXvd) -> Vec<u8> {
        let mut data = Vec::new();
        xvd.drive_reader().read_to_end(&mut data).unwrap();
        data
    }

    fn expected_drive(pages: u64) -> Vec<u8> {
        (0..pages)
            .flat_map(|p| std::iter::repeat_n(page_fill(p), PAGE_SIZE as usize))
            .collect()
    }

    #[test]
    fn open_plain_image() {
        let mut xvd = open(ImageBuilder::new(8).build());

        assert_eq!(xvd.header().content_type(), ContentType::SystemOs);
        assert!(xvd.xvc().is_none());
        assert!(!xvd.is_hash_tree_valid());
        assert_eq!(xvd.invalid_data_pages(), None);
        assert_eq!(xvd.layout().user_data_offset, 0x3000);
        assert_eq!(xvd.layout().drive_data_offset, 0x4000);

        assert_eq!(xvd.user_data().unwrap(), vec![0xDA; 0x1000]);
        assert!(xvd.embedded_xvd().unwrap().is_empty());
        assert_eq!(drive(&mut xvd), expected_drive(8));
    }

    #[test]
    fn open_xvc_image() {
        let xvd = open(ImageBuilder::new(8).xvc().build());
        let xvc = xvd.xvc().unwrap();

        assert_eq!(xvd.layout().xvc_info_offset, 0x5000);
        assert_eq!(xvd.layout().drive_data_offset, 0x8000);
        assert_eq!(xvc.regions.len(), 3);
        assert_eq!(xvc.regions[0].id(), XvcRegionId::MetadataXvc);
        assert_eq!(xvc.regions[1].offset(), 0x8000);
        assert_eq!(xvc.regions[1].length(), 0x4000);
        assert_eq!(xvc.regions[2].offset(), 0xC000);
        assert_eq!(xvc.presence.len(), 3);
    }

    #[test]
    fn open_errors() {
        assert_matches!(
            XvdFile::open(Cursor::new(vec![0u8; 0x100])),
            Err(OpenError::Truncated { len: 0x100 })
        );

        assert_matches!(
            XvdFile::open(Cursor::new(vec![0u8; 0x3000])),
            Err(OpenError::ReadHeaderFailed { .. })
        );

        let mut image = ImageBuilder::new(8).build();
        image.truncate(0x4000);
        assert_matches!(
            XvdFile::open(Cursor::new(image)),
            Err(OpenError::DriveDataOutOfRange {
                offset: 0x4000,
                len: 0x4000,
            })
        );
    }

    #[test]
    fn add_and_remove_hash_tree() {
        let original = ImageBuilder::new(8).xvc().build();
        let mut xvd = open(original.clone());

        assert!(!xvd.remove_hash_tree().unwrap());
        assert_matches!(xvd.rehash_data(), Err(HashTreeError::NoHashTree));

        assert!(xvd.add_hash_tree().unwrap());
        assert!(!xvd.add_hash_tree().unwrap());

        let tree_len = xvd.layout().hash_tree_len();
        assert_eq!(xvd.layout().user_data_offset, 0x4000 + tree_len);
        assert_eq!(xvd.xvc().unwrap().regions[0].offset(), 0x5000 + tree_len);
        assert_eq!(xvd.xvc().unwrap().regions[1].offset(), 0x8000 + tree_len);

        // Level 0 stays empty until the data is rehashed.
        assert_eq!(xvd.invalid_data_pages(), None);
        assert!(xvd.verify_hash_tree());
        assert!(!xvd.verify_data_hashes().unwrap().is_empty());

        xvd.rehash_data().unwrap();
        assert!(xvd.verify_data_hashes().unwrap().is_empty());

        let mut xvd = open(bytes(xvd));
        assert!(xvd.is_hash_tree_valid());
        assert!(xvd.is_data_valid());
        assert_eq!(drive(&mut xvd), expected_drive(8));

        assert!(xvd.remove_hash_tree().unwrap());
        assert_eq!(bytes(xvd), original);
    }

    #[test]
    fn corrupted_page_is_reported() {
        let mut image = ImageBuilder::new(8).hash_tree().build();
        let xvd = open(image.clone());
        assert!(xvd.is_hash_tree_valid());
        assert!(xvd.is_data_valid());

        let offset = xvd.layout().drive_data_offset as usize;
        image[offset + 5] ^= 0xFF;

        let mut xvd = open(image);
        // Only level 0 is affected.
        assert!(xvd.is_hash_tree_valid());
        assert_eq!(xvd.invalid_data_pages(), Some(&[1u64][..]));

        assert_eq!(xvd.rehash_data().unwrap(), 1);
        assert!(xvd.is_data_valid());
        assert!(xvd.verify_hash_tree());
    }

    #[test]
    fn corrupted_tree_is_tolerated() {
        let mut image = ImageBuilder::new(8).hash_tree().build();
        let xvd = open(image.clone());
        let offset = xvd.layout().hash_tree_offset as usize;
        image[offset] ^= 0xFF;

        let xvd = open(image);
        assert!(!xvd.is_hash_tree_valid());
    }

    #[test]
    fn save_is_idempotent() {
        let image = ImageBuilder::new(8).xvc().hash_tree().build();
        let mut xvd = open(image.clone());

        xvd.save().unwrap();
        assert_eq!(bytes(xvd), image);
    }

    #[test]
    fn encrypt_and_decrypt_with_odk() {
        let keys = testutil::keys();
        let mut xvd = open(ImageBuilder::new(8).build());
        let drive_offset = xvd.layout().drive_data_offset as usize;

        assert_matches!(xvd.decrypt(&keys, None), Err(CryptError::AlreadyDecrypted));

        xvd.encrypt(&keys, None, None).unwrap();
        assert!(xvd.header().is_encrypted());
        assert!(xvd.header().is_read_only());
        assert_ne!(xvd.header().key_material(), &[0u8; 32]);
        assert_matches!(
            xvd.encrypt(&keys, None, None),
            Err(CryptError::AlreadyEncrypted)
        );

        let image = bytes(xvd);
        assert_ne!(image[drive_offset..], expected_drive(8)[..]);

        let mut xvd = open(image);
        xvd.decrypt(&keys, None).unwrap();
        assert!(!xvd.header().is_encrypted());
        assert_eq!(drive(&mut xvd), expected_drive(8));
        assert_eq!(xvd.user_data().unwrap(), vec![0xDA; 0x1000]);
    }

    #[test]
    fn encrypt_and_decrypt_with_hash_tree() {
        let keys = testutil::keys();
        let mut xvd = open(ImageBuilder::new(8).hash_tree().build());

        xvd.encrypt(&keys, None, None).unwrap();
        assert!(xvd.verify_data_hashes().unwrap().is_empty());

        let mut xvd = open(bytes(xvd));
        assert!(xvd.is_hash_tree_valid());
        assert_eq!(xvd.invalid_data_pages(), Some(&[][..]));

        xvd.decrypt(&keys, None).unwrap();
        assert_eq!(drive(&mut xvd), expected_drive(8));

        let xvd = open(bytes(xvd));
        assert!(!xvd.header().is_encrypted());
        assert!(xvd.is_hash_tree_valid());
        assert_eq!(xvd.invalid_data_pages(), Some(&[][..]));
    }

    #[test]
    fn crypt_round_trip_restores_hash_tree() {
        let keys = testutil::keys();
        let original = ImageBuilder::new(8).hash_tree().build();
        let mut xvd = open(original.clone());

        xvd.encrypt(&keys, None, None).unwrap();
        let mut xvd = open(bytes(xvd));
        xvd.decrypt(&keys, None).unwrap();

        let tree = xvd.layout().hash_tree_offset as usize;
        let user_data = xvd.layout().user_data_offset as usize;
        let image = bytes(xvd);
        assert_eq!(image[tree..user_data], original[tree..user_data]);
    }

    #[test]
    fn missing_key_leaves_image_untouched() {
        let image = ImageBuilder::new(8).build();
        let mut xvd = open(image.clone());

        assert_matches!(
            xvd.encrypt(&MemoryKeyStore::new(), None, None),
            Err(CryptError::ResolveKeyFailed { .. })
        );
        assert_eq!(bytes(xvd), image);

        let image = ImageBuilder::new(8).xvc().build();
        let mut xvd = open(image.clone());
        let unknown = "00000000-0000-0000-0000-000000000001".parse().unwrap();

        assert_matches!(
            xvd.encrypt(&testutil::keys(), Some(unknown), None),
            Err(CryptError::ResolveKeyFailed { .. })
        );
        assert_matches!(
            xvd.encrypt(&testutil::keys(), None, None),
            Err(CryptError::MissingCik)
        );
        assert_eq!(bytes(xvd), image);
    }

    #[test]
    fn encrypt_and_decrypt_xvc_regions() {
        let keys = testutil::keys();
        let cik: Guid = CIK_GUID.parse().unwrap();
        let mut xvd = open(ImageBuilder::new(8).xvc().build());

        xvd.encrypt(&keys, Some(cik), None).unwrap();

        let xvc = xvd.xvc().unwrap();
        assert_eq!(xvc.key_guid(0), Some(cik));
        assert_eq!(xvc.regions[0].key_id(), NO_KEY);
        assert_eq!(xvc.regions[1].key_id(), 0);
        assert_eq!(xvc.regions[2].key_id(), 0);

        let mut region = Vec::new();
        xvd.extract_region(1, &mut region).unwrap();
        assert_ne!(region, expected_drive(4));

        let mut xvd = open(bytes(xvd));
        assert!(xvd.header().is_encrypted());
        xvd.decrypt(&keys, None).unwrap();

        assert_eq!(drive(&mut xvd), expected_drive(8));
        assert_eq!(xvd.xvc().unwrap().regions[1].key_id(), 0);
    }

    #[test]
    fn extract_region() {
        let mut xvd = open(ImageBuilder::new(8).xvc().build());

        let mut out = Vec::new();
        assert_eq!(xvd.extract_region(2, &mut out).unwrap(), 0x4000);
        assert_eq!(out, expected_drive(8)[0x4000..]);

        assert_matches!(
            xvd.extract_region(3, &mut out),
            Err(DataError::RegionNotFound { index: 3 })
        );

        let mut plain = open(ImageBuilder::new(2).build());
        assert_matches!(
            plain.extract_region(0, &mut out),
            Err(DataError::NoXvcData)
        );
    }

    #[test]
    fn region_near_u64_max() {
        let mut xvd = open(ImageBuilder::new(8).xvc().build());
        let region = &mut xvd.xvc.as_mut().unwrap().regions[2];
        region.set_offset(u64::MAX - 0x10);

        let mut out = Vec::new();
        assert_matches!(
            xvd.extract_region(2, &mut out),
            Err(DataError::RegionOutOfBounds { index: 2 })
        );
        assert!(out.is_empty());

        // Offsets past the tree saturate instead of wrapping.
        assert!(xvd.add_hash_tree().unwrap());
        assert_eq!(xvd.xvc().unwrap().regions[2].offset(), u64::MAX);
        assert!(xvd.remove_hash_tree().unwrap());
    }

    #[test]
    fn resign_and_verify() {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let mut keys = MemoryKeyStore::new();
        keys.load(
            KeyId::Signing("test".to_owned()),
            &BcryptKey::Private(key).to_blob(),
        )
        .unwrap();

        let mut xvd = open(ImageBuilder::new(4).build());
        assert!(!xvd.verify_signature(&keys, "test").unwrap());

        xvd.resign(&keys, "test").unwrap();
        assert!(xvd.verify_signature(&keys, "test").unwrap());

        let xvd = open(bytes(xvd));
        assert!(xvd.verify_signature(&keys, "test").unwrap());
        assert_matches!(
            xvd.verify_signature(&keys, "missing"),
            Err(SignError::ResolveSigningKey { .. })
        );
    }
}
