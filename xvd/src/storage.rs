use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Buffer size used when shifting bytes inside a storage.
const SHIFT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Backing store of an XVD image.
///
/// An XVD owns its storage exclusively. Adding or removing the hash tree
/// changes the length of the storage, so plain `Read + Write + Seek` is not
/// enough.
pub trait Storage: Read + Write + Seek {
    /// Truncates or extends the storage. New bytes are zero.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Returns the current length of the storage.
    fn byte_len(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::End(0))
    }
}

impl Storage for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn byte_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(io::Error::other)?;
        self.get_mut().resize(len, 0);
        Ok(())
    }

    fn byte_len(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }

    fn byte_len(&mut self) -> io::Result<u64> {
        (**self).byte_len()
    }
}

/// Reads exactly `buf.len()` bytes at `offset`.
pub(crate) fn read_exact_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf)
}

/// Writes all of `buf` at `offset`.
pub(crate) fn write_all_at<W: Write + Seek + ?Sized>(
    writer: &mut W,
    offset: u64,
    buf: &[u8],
) -> io::Result<()> {
    writer.seek(SeekFrom::Start(offset))?;
    writer.write_all(buf)
}

/// Inserts `len` zero bytes at `offset`, moving everything after it towards
/// the end.
pub fn insert_bytes<S: Storage + ?Sized>(storage: &mut S, offset: u64, len: u64) -> io::Result<()> {
    let old_len = storage.byte_len()?;

    if offset > old_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("insert offset 0x{offset:X} past end 0x{old_len:X}"),
        ));
    }

    storage.set_len(old_len + len)?;

    let mut buf = vec![0u8; SHIFT_CHUNK_SIZE.min(old_len - offset) as usize];
    let mut end = old_len;

    // Back to front so no unread byte is overwritten.
    while end > offset {
        let n = SHIFT_CHUNK_SIZE.min(end - offset);
        let start = end - n;
        let chunk = &mut buf[..n as usize];

        read_exact_at(storage, start, chunk)?;
        write_all_at(storage, start + len, chunk)?;

        end = start;
    }

    let zeros = vec![0u8; SHIFT_CHUNK_SIZE.min(len) as usize];
    let mut pos = offset;

    while pos < offset + len {
        let n = SHIFT_CHUNK_SIZE.min(offset + len - pos);
        write_all_at(storage, pos, &zeros[..n as usize])?;
        pos += n;
    }

    Ok(())
}

/// Removes `len` bytes at `offset`, moving everything after them towards the
/// start and truncating the storage.
pub fn delete_bytes<S: Storage + ?Sized>(storage: &mut S, offset: u64, len: u64) -> io::Result<()> {
    let old_len = storage.byte_len()?;

    if offset + len > old_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("delete range 0x{offset:X}+0x{len:X} past end 0x{old_len:X}"),
        ));
    }

    let tail = old_len - offset - len;
    let mut buf = vec![0u8; SHIFT_CHUNK_SIZE.min(tail) as usize];
    let mut pos = offset + len;

    while pos < old_len {
        let n = SHIFT_CHUNK_SIZE.min(old_len - pos);
        let chunk = &mut buf[..n as usize];

        read_exact_at(storage, pos, chunk)?;
        write_all_at(storage, pos - len, chunk)?;

        pos += n;
    }

    storage.set_len(old_len - len)
}
