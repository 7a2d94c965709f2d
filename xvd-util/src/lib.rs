//! Library behind the `xvd-util` command line tool.
//!
//! Provides helpers to open XVD images and XBFS NAND dumps from disk, load
//! key files into a [`MemoryKeyStore`](xvd::keys::MemoryKeyStore), and
//! extract image contents to a directory.
//!
//! # Example
//!
//! ```no_run
//! use xvd_util::{SilentProgress, XvdExtractor, open_xvd};
//!
//! let mut xvd = open_xvd("game.xvd".as_ref(), false, Default::default()).unwrap();
//! let mut extractor = XvdExtractor::new(&mut xvd, SilentProgress);
//! extractor.extract("output/").unwrap();
//! ```

pub mod extract;
pub mod keyfile;
pub mod progress;

pub use self::extract::{ExtractError, XvdExtractor, extract_xbfs};
pub use self::keyfile::{KeyFileError, KeyFiles};
pub use self::progress::{ExtractProgress, SilentProgress};

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing::info;
use xvd::{LoadOptions, XvdFile};

/// Errors when opening an XVD image from disk.
#[derive(Debug, Snafu)]
pub enum OpenXvdError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to parse XVD"))]
    ParseXvd { source: xvd::OpenError },
}

/// Errors when opening an XBFS NAND dump from disk.
#[derive(Debug, Snafu)]
pub enum OpenXbfsError {
    #[snafu(display("failed to open file"))]
    OpenXbfsFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("failed to parse XBFS"))]
    ParseXbfs { source: xbfs::LoadError },
}

/// Errors when preparing the file a mutating command works on.
#[derive(Debug, Snafu)]
pub enum PrepareOutputError {
    #[snafu(display("cannot copy {} to {}", input.display(), output.display()))]
    CopyFailed {
        input: PathBuf,
        output: PathBuf,
        source: std::io::Error,
    },
}

/// Opens an XVD image, read-only unless `writable` is set.
pub fn open_xvd(
    path: &Path,
    writable: bool,
    options: LoadOptions,
) -> Result<XvdFile<File>, OpenXvdError> {
    let file = OpenOptions::new()
        .read(true)
        .write(writable)
        .open(path)
        .context(OpenFileSnafu)?;

    XvdFile::open_with(file, options).context(ParseXvdSnafu)
}

/// Returns the path a mutating command should modify: `input` itself, or a
/// fresh copy of it at `output`.
pub fn prepare_output(input: &Path, output: Option<&Path>) -> Result<PathBuf, PrepareOutputError> {
    let Some(output) = output else {
        return Ok(input.to_path_buf());
    };

    std::fs::copy(input, output).context(CopyFailedSnafu { input, output })?;
    info!("Copied {} to {}", input.display(), output.display());

    Ok(output.to_path_buf())
}

/// Opens an XBFS NAND dump using a memory-mapped read.
///
/// # Safety
///
/// This function uses `unsafe` internally to create a memory map. The caller
/// must ensure the file is not modified or truncated while the returned
/// [`Xbfs`](xbfs::Xbfs) is in use.
pub unsafe fn open_xbfs(path: &Path) -> Result<xbfs::Xbfs<memmap2::Mmap>, OpenXbfsError> {
    let file = File::open(path).context(OpenXbfsFileSnafu)?;
    let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu)? };
    xbfs::Xbfs::new(raw).context(ParseXbfsSnafu)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn prepare_output_copies() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.xvd");
        std::fs::write(&input, b"data").unwrap();

        assert_eq!(prepare_output(&input, None).unwrap(), input);

        let output = dir.path().join("out.xvd");
        assert_eq!(prepare_output(&input, Some(&output)).unwrap(), output);
        assert_eq!(std::fs::read(&output).unwrap(), b"data");

        let missing = dir.path().join("missing.xvd");
        assert_matches!(
            prepare_output(&missing, Some(&output)),
            Err(PrepareOutputError::CopyFailed { .. })
        );
    }

    #[test]
    fn open_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.xvd");
        std::fs::write(&path, [0u8; 16]).unwrap();

        assert_matches!(
            open_xvd(&path, false, LoadOptions::default()),
            Err(OpenXvdError::ParseXvd { .. })
        );
        assert_matches!(
            open_xvd(&dir.path().join("missing"), false, LoadOptions::default()),
            Err(OpenXvdError::OpenFile { .. })
        );
        assert_matches!(
            unsafe { open_xbfs(&path) },
            Err(OpenXbfsError::ParseXbfs { .. })
        );
    }
}
