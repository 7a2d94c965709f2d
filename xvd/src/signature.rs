//! RSA signing of XVD headers.
//!
//! The header body (everything after the signature area) is signed with
//! RSA-PSS over SHA-256. Signing keys come as Windows BCRYPT RSA key blobs.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;

use crate::header::SIGNATURE_SIZE;

/// `RSA1`: public key.
pub const BCRYPT_RSAPUBLIC_MAGIC: u32 = 0x3141_5352;
/// `RSA2`: private key without the CRT parameters and private exponent.
pub const BCRYPT_RSAPRIVATE_MAGIC: u32 = 0x3241_5352;
/// `RSA3`: full private key.
pub const BCRYPT_RSAFULLPRIVATE_MAGIC: u32 = 0x3341_5352;

const BLOB_HEADER_SIZE: usize = 24;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("key blob is truncated"))]
    Truncated { source: std::io::Error },

    #[snafu(display("unknown key blob magic 0x{magic:08X}"))]
    InvalidMagic { magic: u32 },

    #[snafu(display("key blob does not describe a valid RSA key"))]
    InvalidKey { source: rsa::errors::Error },

    #[snafu(display("signing requires a full private key"))]
    PrivateKeyRequired,

    #[snafu(display("{bits}-bit signature does not fit the header"))]
    KeyTooLarge { bits: usize },

    #[snafu(display("failed to sign header"))]
    Sign { source: rsa::errors::Error },
}

/// RSA key decoded from a BCRYPT blob.
#[derive(Debug, Clone)]
pub enum BcryptKey {
    Public(RsaPublicKey),
    Private(RsaPrivateKey),
}

fn read_field<R: Read>(reader: &mut R, len: u32) -> Result<BigUint, Error> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).context(TruncatedSnafu)?;
    Ok(BigUint::from_bytes_be(&buf))
}

fn write_field(out: &mut Vec<u8>, value: &BigUint, len: usize) {
    let bytes = value.to_bytes_be();
    out.resize(out.len() + len.saturating_sub(bytes.len()), 0);
    out.extend_from_slice(&bytes);
}

impl BcryptKey {
    /// Parses a `RSA1`, `RSA2` or `RSA3` blob.
    ///
    /// `RSA2` blobs carry no private exponent, so only their public part is
    /// used.
    pub fn from_blob(data: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(data);

        let magic = reader.read_u32::<LittleEndian>().context(TruncatedSnafu)?;
        let bit_length = reader.read_u32::<LittleEndian>().context(TruncatedSnafu)?;
        let cb_public_exp = reader.read_u32::<LittleEndian>().context(TruncatedSnafu)?;
        let cb_modulus = reader.read_u32::<LittleEndian>().context(TruncatedSnafu)?;
        let cb_prime1 = reader.read_u32::<LittleEndian>().context(TruncatedSnafu)?;
        let cb_prime2 = reader.read_u32::<LittleEndian>().context(TruncatedSnafu)?;

        ensure!(
            matches!(
                magic,
                BCRYPT_RSAPUBLIC_MAGIC | BCRYPT_RSAPRIVATE_MAGIC | BCRYPT_RSAFULLPRIVATE_MAGIC
            ),
            InvalidMagicSnafu { magic }
        );

        debug!(bit_length, magic = format_args!("0x{magic:08X}"), "Parsing key blob");

        let e = read_field(&mut reader, cb_public_exp)?;
        let n = read_field(&mut reader, cb_modulus)?;

        if magic != BCRYPT_RSAFULLPRIVATE_MAGIC {
            let key = RsaPublicKey::new(n, e).context(InvalidKeySnafu)?;
            return Ok(Self::Public(key));
        }

        let p = read_field(&mut reader, cb_prime1)?;
        let q = read_field(&mut reader, cb_prime2)?;
        // CRT parameters are recomputed by the rsa crate.
        let _dp = read_field(&mut reader, cb_prime1)?;
        let _dq = read_field(&mut reader, cb_prime2)?;
        let _qinv = read_field(&mut reader, cb_prime1)?;
        let d = read_field(&mut reader, cb_modulus)?;

        let key = RsaPrivateKey::from_components(n, e, d, vec![p, q]).context(InvalidKeySnafu)?;
        key.validate().context(InvalidKeySnafu)?;

        Ok(Self::Private(key))
    }

    /// Encodes the key as a `RSA1` or `RSA3` blob.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let public = self.public_key();
        let e = public.e().to_bytes_be();
        let n_len = public.size();

        let (magic, primes) = match self {
            Self::Public(_) => (BCRYPT_RSAPUBLIC_MAGIC, None),
            Self::Private(key) => (BCRYPT_RSAFULLPRIVATE_MAGIC, Some(key)),
        };

        let (p_len, q_len) = primes
            .map(|k| {
                let p = &k.primes()[0];
                let q = &k.primes()[1];
                (p.to_bytes_be().len(), q.to_bytes_be().len())
            })
            .unwrap_or((0, 0));

        let mut out = Vec::with_capacity(BLOB_HEADER_SIZE + e.len() + n_len * 4);

        for value in [
            magic,
            (n_len * 8) as u32,
            e.len() as u32,
            n_len as u32,
            p_len as u32,
            q_len as u32,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }

        out.extend_from_slice(&e);
        write_field(&mut out, public.n(), n_len);

        if let Some(key) = primes {
            let p = &key.primes()[0];
            let q = &key.primes()[1];
            let one = BigUint::from(1u32);
            let two = BigUint::from(2u32);

            let dp = key.d() % (p - &one);
            let dq = key.d() % (q - &one);
            // p is prime, so q^(p-2) is the inverse of q mod p.
            let qinv = q.modpow(&(p - &two), p);

            write_field(&mut out, p, p_len);
            write_field(&mut out, q, q_len);
            write_field(&mut out, &dp, p_len);
            write_field(&mut out, &dq, q_len);
            write_field(&mut out, &qinv, p_len);
            write_field(&mut out, key.d(), n_len);
        }

        out
    }

    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        match self {
            Self::Public(key) => key.clone(),
            Self::Private(key) => key.to_public_key(),
        }
    }

    #[must_use]
    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        match self {
            Self::Public(_) => None,
            Self::Private(key) => Some(key),
        }
    }
}

/// Signs `body` and returns the signature padded to the size of the header
/// signature area.
pub fn sign(key: &BcryptKey, body: &[u8]) -> Result<[u8; SIGNATURE_SIZE], Error> {
    let key = key.private_key().ok_or_else(|| PrivateKeyRequiredSnafu.build())?;
    ensure!(
        key.size() <= SIGNATURE_SIZE,
        KeyTooLargeSnafu {
            bits: key.size() * 8
        }
    );

    let digest = Sha256::digest(body);
    let signature = key
        .sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), &digest)
        .context(SignSnafu)?;

    let mut out = [0u8; SIGNATURE_SIZE];
    out[..signature.len()].copy_from_slice(&signature);

    Ok(out)
}

/// Checks `signature` against `body`.
#[must_use]
pub fn verify(key: &BcryptKey, body: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
    let public = key.public_key();
    let size = public.size();

    if size > SIGNATURE_SIZE {
        return false;
    }

    let digest = Sha256::digest(body);

    public
        .verify(Pss::new::<Sha256>(), &digest, &signature[..size])
        .is_ok()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn test_key() -> BcryptKey {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        BcryptKey::Private(key)
    }

    #[test]
    fn blob_round_trip() {
        let key = test_key();
        let blob = key.to_blob();
        assert_eq!(&blob[..4], b"RSA3");

        let parsed = BcryptKey::from_blob(&blob).unwrap();
        assert_eq!(parsed.public_key(), key.public_key());
        assert!(parsed.private_key().is_some());

        let public = BcryptKey::Public(key.public_key()).to_blob();
        assert_eq!(&public[..4], b"RSA1");
        assert_matches!(BcryptKey::from_blob(&public), Ok(BcryptKey::Public(_)));
    }

    #[test]
    fn blob_errors() {
        assert_matches!(BcryptKey::from_blob(&[0u8; 8]), Err(Error::Truncated { .. }));

        let mut blob = test_key().to_blob();
        blob[0] = b'X';
        assert_matches!(BcryptKey::from_blob(&blob), Err(Error::InvalidMagic { .. }));

        let blob = test_key().to_blob();
        assert_matches!(
            BcryptKey::from_blob(&blob[..blob.len() - 1]),
            Err(Error::Truncated { .. })
        );
    }

    #[test]
    fn sign_and_verify() {
        let key = test_key();
        let body = vec![0x5Au8; 0xC00];

        let signature = sign(&key, &body).unwrap();
        assert!(signature[0x80..].iter().all(|&b| b == 0));
        assert!(verify(&key, &body, &signature));

        let mut tampered = body.clone();
        tampered[0x10] ^= 1;
        assert!(!verify(&key, &tampered, &signature));

        let public = BcryptKey::Public(key.public_key());
        assert!(verify(&public, &body, &signature));
        assert_matches!(sign(&public, &body), Err(Error::PrivateKeyRequired));
    }
}
