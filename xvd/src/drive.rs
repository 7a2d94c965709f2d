use std::io::{self, Read, Seek, SeekFrom};

use crate::geometry::{PAGE_SIZE, in_page_offset, offset_to_page_number};
use crate::storage::{Storage, read_exact_at};
use crate::XvdFile;

/// A cursor over the logical drive of an XVD, implementing [`Read`] and
/// [`Seek`].
///
/// Created via [`XvdFile::drive_reader()`].
pub struct DriveReader<'a, S: Storage> {
    xvd: &'a mut XvdFile<S>,
    pos: u64,
}

impl<'a, S: Storage> DriveReader<'a, S> {
    pub(crate) fn new(xvd: &'a mut XvdFile<S>) -> Self {
        Self { xvd, pos: 0 }
    }

    /// Size of the logical drive.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.xvd.header.drive_size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Storage> std::fmt::Debug for DriveReader<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveReader")
            .field("len", &self.len())
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Read for DriveReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let drive_size = self.len();

        if buf.is_empty() || self.pos >= drive_size {
            return Ok(0);
        }

        // Reads never cross a page since neighbouring pages may live in
        // different blocks.
        let in_page = in_page_offset(self.pos);
        let n = (PAGE_SIZE - in_page)
            .min(drive_size - self.pos)
            .min(buf.len() as u64) as usize;

        let page = self.xvd.layout.metadata_pages + offset_to_page_number(self.pos);
        let backing = self.xvd.resolve_bat_offset(page).map_err(io::Error::other)?;

        match backing {
            Some(offset) => read_exact_at(&mut self.xvd.storage, offset + in_page, &mut buf[..n])?,
            None => buf[..n].fill(0),
        }

        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: Storage> Seek for DriveReader<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.len().checked_add_signed(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
        };

        let Some(new_pos) = new_pos else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            ));
        };

        self.pos = new_pos;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::geometry::{BLOCK_SIZE, PAGES_PER_BLOCK};
    use crate::testutil::{ImageBuilder, dynamic_image, page_fill};

    #[test]
    fn fixed_drive_reads() {
        let mut xvd = XvdFile::open(Cursor::new(ImageBuilder::new(4).build())).unwrap();
        let mut reader = xvd.drive_reader();
        assert_eq!(reader.len(), 0x4000);

        // Crosses a page boundary.
        let mut buf = [0u8; 0x20];
        reader.seek(SeekFrom::Start(0x1FF0)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf[..0x10], [page_fill(1); 0x10]);
        assert_eq!(buf[0x10..], [page_fill(2); 0x10]);

        reader.seek(SeekFrom::End(-1)).unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], page_fill(3));
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        assert!(reader.seek(SeekFrom::Current(-0x5000)).is_err());
    }

    #[test]
    fn seek_past_u64_range_is_rejected() {
        let mut xvd = XvdFile::open(Cursor::new(ImageBuilder::new(4).build())).unwrap();
        let mut reader = xvd.drive_reader();

        assert_eq!(reader.seek(SeekFrom::Start(u64::MAX - 1)).unwrap(), u64::MAX - 1);
        let err = reader.seek(SeekFrom::Current(i64::MAX)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(reader.stream_position().unwrap(), u64::MAX - 1);

        // Past the end reads nothing.
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        assert!(reader.seek(SeekFrom::End(i64::MIN)).is_err());
        assert_eq!(reader.seek(SeekFrom::End(i64::MAX)).unwrap(), 0x4000 + i64::MAX as u64);
        assert!(reader.seek(SeekFrom::Current(i64::MAX)).is_err());
    }

    #[test]
    fn dynamic_drive_reads() {
        let mut xvd = XvdFile::open(Cursor::new(dynamic_image())).unwrap();
        let direct_pages = PAGES_PER_BLOCK - xvd.layout().metadata_pages;

        let mut data = Vec::new();
        xvd.drive_reader().read_to_end(&mut data).unwrap();
        assert_eq!(data.len() as u64, 2 * BLOCK_SIZE);

        let allocated = direct_pages + PAGES_PER_BLOCK;

        for (page, chunk) in data.chunks_exact(PAGE_SIZE as usize).enumerate() {
            let page = page as u64;
            let expected = if page < allocated { page_fill(page) } else { 0 };
            assert!(chunk.iter().all(|&b| b == expected), "page {page}");
        }
    }

    #[test]
    fn unallocated_block_has_no_backing() {
        let mut xvd = XvdFile::open(Cursor::new(dynamic_image())).unwrap();
        let last_page = xvd.layout().hashed_pages - 1;

        assert_eq!(xvd.resolve_bat_offset(last_page).unwrap(), None);
        assert!(xvd.resolve_bat_offset(last_page + 1).is_err());
        assert_eq!(
            xvd.resolve_bat_offset(0).unwrap(),
            Some(xvd.layout().user_data_offset)
        );
    }
}
