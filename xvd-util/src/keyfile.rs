//! Loading key files from disk into a key store.

use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;
use xvd::guid::Guid;
use xvd::header::OdkIndex;
use xvd::keys::{KeyId, MemoryKeyStore};

/// Size of an ODK file.
pub const ODK_FILE_SIZE: usize = 0x20;

/// Errors when loading key files.
#[derive(Debug, Snafu)]
pub enum KeyFileError {
    #[snafu(display("cannot read key file {}", path.display()))]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("ODK file {} must be {ODK_FILE_SIZE} bytes, found {len}", path.display()))]
    InvalidOdkFile { path: PathBuf, len: usize },

    #[snafu(display("cannot load key file {}", path.display()))]
    LoadFailed {
        path: PathBuf,
        source: xvd::keys::KeyError,
    },

    #[snafu(display("invalid ODK slot '{value}'"))]
    InvalidOdkSlot { value: String },
}

/// Key files given on the command line.
#[derive(Debug, Default, Clone)]
pub struct KeyFiles {
    /// ODK file and the slot it is loaded into.
    pub odk: Option<(OdkIndex, PathBuf)>,
    pub ciks: Vec<PathBuf>,
    pub sign_key: Option<PathBuf>,
}

/// Keys loaded from [`KeyFiles`].
#[derive(Debug, Default)]
pub struct LoadedKeys {
    pub store: MemoryKeyStore,
    /// GUIDs of the loaded CIK files, in order.
    pub ciks: Vec<Guid>,
    /// Name of the loaded signing key.
    pub sign_key: Option<String>,
}

impl KeyFiles {
    pub fn load(&self) -> Result<LoadedKeys, KeyFileError> {
        let mut keys = LoadedKeys::default();

        if let Some((index, path)) = &self.odk {
            let data = read(path)?;
            snafu::ensure!(
                data.len() == ODK_FILE_SIZE,
                InvalidOdkFileSnafu {
                    path,
                    len: data.len(),
                }
            );

            keys.store
                .load(KeyId::Odk(*index), &data)
                .context(LoadFailedSnafu { path })?;
        }

        for path in &self.ciks {
            let data = read(path)?;
            let guid = keys
                .store
                .load_cik_file(&data)
                .context(LoadFailedSnafu { path })?;

            debug!(%guid, "Loaded CIK file {}", path.display());
            keys.ciks.push(guid);
        }

        if let Some(path) = &self.sign_key {
            let name = signing_key_name(path);
            let data = read(path)?;

            keys.store
                .load(KeyId::Signing(name.clone()), &data)
                .context(LoadFailedSnafu { path })?;
            keys.sign_key = Some(name);
        }

        Ok(keys)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, KeyFileError> {
    std::fs::read(path).context(ReadFailedSnafu { path })
}

/// Names a signing key after its file.
fn signing_key_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "signing-key".to_owned())
}

/// Parses an ODK slot given by name (`standard`, `green`, `red`) or number.
pub fn parse_odk_slot(value: &str) -> Result<OdkIndex, KeyFileError> {
    let index = match value.to_ascii_lowercase().as_str() {
        "standard" => OdkIndex::STANDARD,
        "green" => OdkIndex::GREEN,
        "red" => OdkIndex::RED,
        other => {
            let number = match other.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => other.parse(),
            };

            OdkIndex(number.ok().context(InvalidOdkSlotSnafu { value })?)
        }
    };

    Ok(index)
}
