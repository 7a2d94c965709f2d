use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing::{debug, info};
use xbfs::Xbfs;
use xvd::XvdFile;
use xvd::storage::Storage;

use crate::progress::ExtractProgress;

/// Errors that can occur during extraction.
#[derive(Debug, Snafu)]
pub enum ExtractError {
    #[snafu(display("cannot create directory {}: {source}", path.display()))]
    CreateDirectoryFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot create file {}: {source}", path.display()))]
    CreateFileFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write to {}: {source}", path.display()))]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot read {what} from XVD: {source}"))]
    ReadXvdFailed {
        what: String,
        source: xvd::DataError,
    },

    #[snafu(display("cannot read logical drive: {source}"))]
    ReadDriveFailed { source: std::io::Error },

    #[snafu(display("cannot extract {name} from XBFS: {source}"))]
    ExtractXbfsFailed {
        name: String,
        source: xbfs::ExtractError,
    },
}

const CHUNK_SIZE: usize = 1024 * 1024;

/// Extracts the sections of an XVD image to a directory.
///
/// The output holds `embedded.xvd` (when present), `user_data.bin`,
/// `drive.bin` with the logical drive and, for XVC images, one
/// `region_<index>_<id>.bin` per region. Data is written as stored, so
/// encrypted images produce ciphertext.
pub struct XvdExtractor<'a, S: Storage, P: ExtractProgress> {
    xvd: &'a mut XvdFile<S>,
    progress: P,
    overwrite: bool,
}

impl<'a, S: Storage, P: ExtractProgress> XvdExtractor<'a, S, P> {
    pub fn new(xvd: &'a mut XvdFile<S>, progress: P) -> Self {
        Self {
            xvd,
            progress,
            overwrite: true,
        }
    }

    /// Fails instead of replacing files that already exist.
    pub fn no_overwrite(mut self) -> Self {
        self.overwrite = false;
        self
    }

    /// Extracts everything to `output` and returns the number of files
    /// written.
    pub fn extract(&mut self, output: impl AsRef<Path>) -> Result<usize, ExtractError> {
        let output = output.as_ref();
        create_dir_all(output).context(CreateDirectoryFailedSnafu { path: output })?;

        let mut files = 0;

        let embedded = self
            .xvd
            .embedded_xvd()
            .context(ReadXvdFailedSnafu { what: "embedded XVD" })?;
        if !embedded.is_empty() {
            self.write_buffer(&output.join("embedded.xvd"), &embedded)?;
            files += 1;
        }

        let user_data = self
            .xvd
            .user_data()
            .context(ReadXvdFailedSnafu { what: "user data" })?;
        self.write_buffer(&output.join("user_data.bin"), &user_data)?;
        files += 1;

        self.extract_drive(&output.join("drive.bin"))?;
        files += 1;

        files += self.extract_regions(output)?;

        info!(files, "Extracted XVD to {}", output.display());
        self.progress.completed(files);

        Ok(files)
    }

    /// Writes the logical drive to `path`.
    pub fn extract_drive(&mut self, path: &Path) -> Result<u64, ExtractError> {
        let name = file_name(path);
        let mut dest = self.create(path)?;
        let mut reader = self.xvd.drive_reader();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;

        self.progress.file_start(&name, reader.len());

        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context(ReadDriveFailedSnafu),
            };

            dest.write_all(&buffer[..read])
                .context(WriteFailedSnafu { path })?;

            written += read as u64;
            self.progress.bytes_written(read as u64);
        }

        self.progress.file_completed(&name);

        Ok(written)
    }

    /// Writes every XVC region to `output`. Images without XVC data have
    /// nothing to write.
    pub fn extract_regions(&mut self, output: &Path) -> Result<usize, ExtractError> {
        let regions: Vec<_> = match self.xvd.xvc() {
            Some(xvc) => xvc.regions.iter().map(|r| (r.id(), r.length())).collect(),
            None => return Ok(0),
        };

        for (index, (id, len)) in regions.iter().enumerate() {
            let path = output.join(format!("region_{index}_{:08X}.bin", id.as_u32()));
            let name = file_name(&path);
            let mut dest = self.create(&path)?;

            self.progress.file_start(&name, *len);

            let mut writer = ProgressWriter {
                inner: &mut dest,
                progress: &self.progress,
            };
            self.xvd
                .extract_region(index, &mut writer)
                .context(ReadXvdFailedSnafu {
                    what: format!("region #{index}"),
                })?;

            debug!(index, %id, len, "Extracted region");
            self.progress.file_completed(&name);
        }

        Ok(regions.len())
    }

    fn write_buffer(&self, path: &Path, data: &[u8]) -> Result<(), ExtractError> {
        let name = file_name(path);
        self.progress.file_start(&name, data.len() as u64);

        let mut dest = self.create(path)?;
        for chunk in data.chunks(CHUNK_SIZE) {
            dest.write_all(chunk).context(WriteFailedSnafu { path })?;
            self.progress.bytes_written(chunk.len() as u64);
        }

        self.progress.file_completed(&name);

        Ok(())
    }

    fn create(&self, path: &Path) -> Result<File, ExtractError> {
        create_output(path, self.overwrite)
    }
}

/// Writes every present file of the newest XBFS header to `output` as
/// `<index>_<name>`. Returns the number of files written.
pub fn extract_xbfs<R: AsRef<[u8]>, P: ExtractProgress>(
    xbfs: &Xbfs<R>,
    output: impl AsRef<Path>,
    progress: &P,
) -> Result<usize, ExtractError> {
    let output = output.as_ref();
    create_dir_all(output).context(CreateDirectoryFailedSnafu { path: output })?;

    let mut files = 0;

    for file in xbfs.files() {
        // Several slots share a name.
        let name = format!("{:02}_{}", file.index, file.name);
        let path = output.join(&name);
        let mut dest = create_output(&path, true)?;

        progress.file_start(&name, file.entry.byte_len());

        let mut writer = ProgressWriter {
            inner: &mut dest,
            progress,
        };
        xbfs.extract(&file, &mut writer)
            .context(ExtractXbfsFailedSnafu { name: &name })?;

        progress.file_completed(&name);
        files += 1;
    }

    info!(files, "Extracted XBFS to {}", output.display());
    progress.completed(files);

    Ok(files)
}

fn create_output(path: &Path, overwrite: bool) -> Result<File, ExtractError> {
    let mut opts = OpenOptions::new();
    opts.write(true);

    if overwrite {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }

    opts.open(path).context(CreateFileFailedSnafu { path })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Forwards writes and reports them as progress.
struct ProgressWriter<'a, W: Write, P: ExtractProgress> {
    inner: &'a mut W,
    progress: &'a P,
}

impl<W: Write, P: ExtractProgress> Write for ProgressWriter<'_, W, P> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.progress.bytes_written(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
