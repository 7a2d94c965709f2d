//! Key storage for XVD cryptography.
//!
//! Keys are addressed by [`KeyId`]. A store may know about a key without
//! having its bytes, so lookups are tri-state.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};
use snafu::{Snafu, ensure};
use tracing::debug;

use crate::guid::Guid;
use crate::header::OdkIndex;

/// Size of a CIK file: the key GUID followed by the 32-byte key.
pub const CIK_FILE_SIZE: usize = 0x30;

/// Errors when resolving or loading keys.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum KeyError {
    #[snafu(display("unknown key: {id}"))]
    Unknown { id: KeyId },

    #[snafu(display("key is known but not loaded: {id}"))]
    NotLoaded { id: KeyId },

    #[snafu(display("key data does not match the expected hash: {id}"))]
    HashMismatch { id: KeyId },

    #[snafu(display("invalid key length {len} for {id}"))]
    InvalidLength { id: KeyId, len: usize },

    #[snafu(display("CIK file must be {CIK_FILE_SIZE} bytes, found {len}"))]
    InvalidCikFile { len: usize },
}

/// Identifies a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyId {
    /// Offline distribution key, keyed by header slot.
    Odk(OdkIndex),
    /// Content instance key, keyed by GUID.
    Cik(Guid),
    /// RSA key used to sign headers, keyed by name.
    Signing(String),
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Odk(index) => write!(f, "ODK {index}"),
            Self::Cik(guid) => write!(f, "CIK {guid}"),
            Self::Signing(name) => write!(f, "signing key '{name}'"),
        }
    }
}

/// Result of looking up a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookup<'a> {
    Unknown,
    NotLoaded,
    Loaded(&'a [u8]),
}

/// Read access to a set of keys.
pub trait KeyStore {
    fn lookup(&self, id: &KeyId) -> KeyLookup<'_>;

    /// Returns the key bytes, or an error if the key is unknown or has no
    /// data.
    fn require(&self, id: &KeyId) -> Result<&[u8], KeyError> {
        match self.lookup(id) {
            KeyLookup::Loaded(data) => Ok(data),
            KeyLookup::NotLoaded => NotLoadedSnafu { id: id.clone() }.fail(),
            KeyLookup::Unknown => UnknownSnafu { id: id.clone() }.fail(),
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    expected_hash: Option<[u8; 32]>,
    data: Option<Vec<u8>>,
}

/// In-memory [`KeyStore`].
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: HashMap<KeyId, Entry>,
}

impl fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key bytes.
        f.debug_struct("MemoryKeyStore")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a key known without loading it. If `expected_hash` is set, data
    /// loaded later must hash to it.
    pub fn register(&mut self, id: KeyId, expected_hash: Option<[u8; 32]>) {
        self.entries.entry(id).or_default().expected_hash = expected_hash;
    }

    /// Loads key bytes, registering the key if needed.
    pub fn load(&mut self, id: KeyId, data: &[u8]) -> Result<(), KeyError> {
        let valid_len = match id {
            KeyId::Odk(_) => matches!(data.len(), 16 | 32),
            KeyId::Cik(_) => data.len() == 32,
            KeyId::Signing(_) => !data.is_empty(),
        };
        ensure!(
            valid_len,
            InvalidLengthSnafu {
                id: id.clone(),
                len: data.len(),
            }
        );

        let entry = self.entries.entry(id.clone()).or_default();

        if let Some(expected) = &entry.expected_hash {
            let actual: [u8; 32] = Sha256::digest(data).into();
            ensure!(actual == *expected, HashMismatchSnafu { id: id.clone() });
        }

        debug!(%id, "Loaded key");
        entry.data = Some(data.to_vec());

        Ok(())
    }

    /// Loads a CIK file and returns the GUID of the key it contains.
    pub fn load_cik_file(&mut self, data: &[u8]) -> Result<Guid, KeyError> {
        ensure!(
            data.len() == CIK_FILE_SIZE,
            InvalidCikFileSnafu { len: data.len() }
        );

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&data[..16]);
        let guid = Guid::from_bytes(guid);

        self.load(KeyId::Cik(guid), &data[16..])?;

        Ok(guid)
    }

    /// Returns the IDs of every key with loaded data.
    pub fn loaded_keys(&self) -> impl Iterator<Item = &KeyId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.data.is_some())
            .map(|(id, _)| id)
    }
}

impl KeyStore for MemoryKeyStore {
    fn lookup(&self, id: &KeyId) -> KeyLookup<'_> {
        match self.entries.get(id) {
            Some(Entry {
                data: Some(data), ..
            }) => KeyLookup::Loaded(data),
            Some(_) => KeyLookup::NotLoaded,
            None => KeyLookup::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn tri_state_lookup() {
        let mut keys = MemoryKeyStore::new();
        let odk = KeyId::Odk(OdkIndex::RED);

        assert_eq!(keys.lookup(&odk), KeyLookup::Unknown);
        assert_matches!(keys.require(&odk), Err(KeyError::Unknown { .. }));

        keys.register(odk.clone(), None);
        assert_eq!(keys.lookup(&odk), KeyLookup::NotLoaded);
        assert_matches!(keys.require(&odk), Err(KeyError::NotLoaded { .. }));

        keys.load(odk.clone(), &[7u8; 32]).unwrap();
        assert_eq!(keys.require(&odk).unwrap(), &[7u8; 32]);
    }

    #[test]
    fn expected_hash_is_enforced() {
        let mut keys = MemoryKeyStore::new();
        let id = KeyId::Odk(OdkIndex::STANDARD);
        let good = [0x42u8; 16];

        keys.register(id.clone(), Some(Sha256::digest(good).into()));

        assert_matches!(
            keys.load(id.clone(), &[0x43u8; 16]),
            Err(KeyError::HashMismatch { .. })
        );
        assert_eq!(keys.lookup(&id), KeyLookup::NotLoaded);

        keys.load(id.clone(), &good).unwrap();
        assert_eq!(keys.lookup(&id), KeyLookup::Loaded(&good));
    }

    #[test]
    fn cik_file() {
        let guid: Guid = "11223344-5566-7788-99aa-bbccddeeff00".parse().unwrap();
        let mut file = guid.to_bytes().to_vec();
        file.extend_from_slice(&[0x5A; 32]);

        let mut keys = MemoryKeyStore::new();
        assert_eq!(keys.load_cik_file(&file).unwrap(), guid);
        assert_eq!(keys.require(&KeyId::Cik(guid)).unwrap(), &[0x5A; 32]);
        assert_eq!(keys.loaded_keys().count(), 1);

        assert_matches!(
            keys.load_cik_file(&file[..0x20]),
            Err(KeyError::InvalidCikFile { len: 0x20 })
        );
    }

    #[test]
    fn key_lengths() {
        let mut keys = MemoryKeyStore::new();

        assert_matches!(
            keys.load(KeyId::Odk(OdkIndex::GREEN), &[0u8; 24]),
            Err(KeyError::InvalidLength { len: 24, .. })
        );
        assert_matches!(
            keys.load(KeyId::Cik(Guid::NIL), &[0u8; 16]),
            Err(KeyError::InvalidLength { len: 16, .. })
        );
    }
}
