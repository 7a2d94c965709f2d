//! Ciphers used by XVD images.
//!
//! Page data is encrypted with XTS keyed per region. The tweak is derived
//! from a 16-byte seed holding the data unit number, the region ID and the
//! first eight bytes of the VDUID, so only the 32-bit data unit changes from
//! one page to the next.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use snafu::Snafu;

use crate::guid::Guid;

const AES_BLOCK_SIZE: usize = 16;

/// Errors when constructing a cipher.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CipherError {
    #[snafu(display("invalid AES key length {len}"))]
    InvalidKeyLength { len: usize },
}

/// XTS cipher operating on whole data units (pages).
pub struct AesXtsCipher {
    data: Aes128,
    tweak: Aes128,
    seed: [u8; 16],
}

impl std::fmt::Debug for AesXtsCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesXtsCipher").finish_non_exhaustive()
    }
}

impl AesXtsCipher {
    pub fn new(data_key: &[u8; 16], tweak_key: &[u8; 16], seed: [u8; 16]) -> Self {
        Self {
            data: Aes128::new(GenericArray::from_slice(data_key)),
            tweak: Aes128::new(GenericArray::from_slice(tweak_key)),
            seed,
        }
    }

    /// Creates a cipher from a 32-byte content key: the tweak key is the
    /// first half and the data key the second half.
    pub fn from_content_key(key: &[u8; 32], seed: [u8; 16]) -> Self {
        let (tweak_key, data_key) = key.split_at(16);
        Self {
            data: Aes128::new(GenericArray::from_slice(data_key)),
            tweak: Aes128::new(GenericArray::from_slice(tweak_key)),
            seed,
        }
    }

    /// Builds the tweak seed for a region. Bytes 0..4 are left for the data
    /// unit.
    #[must_use]
    pub fn tweak_seed(region_id: u32, vduid: &Guid) -> [u8; 16] {
        let mut seed = [0u8; 16];
        seed[4..8].copy_from_slice(&region_id.to_le_bytes());
        seed[8..16].copy_from_slice(&vduid.to_bytes()[..8]);
        seed
    }

    pub fn encrypt_data_unit(&self, buf: &mut [u8], data_unit: u32) {
        self.transform(buf, data_unit, true);
    }

    pub fn decrypt_data_unit(&self, buf: &mut [u8], data_unit: u32) {
        self.transform(buf, data_unit, false);
    }

    /// Processes `buf` in 16-byte blocks. A trailing partial block is left
    /// untouched.
    fn transform(&self, buf: &mut [u8], data_unit: u32, encrypt: bool) {
        let mut tweak = self.seed;
        tweak[..4].copy_from_slice(&data_unit.to_le_bytes());
        self.tweak
            .encrypt_block(GenericArray::from_mut_slice(&mut tweak));

        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            xor_in_place(block, &tweak);

            let block_ga = GenericArray::from_mut_slice(block);
            if encrypt {
                self.data.encrypt_block(block_ga);
            } else {
                self.data.decrypt_block(block_ga);
            }

            xor_in_place(block, &tweak);
            gf_double(&mut tweak);
        }
    }
}

fn xor_in_place(block: &mut [u8], tweak: &[u8; 16]) {
    for (b, t) in block.iter_mut().zip(tweak) {
        *b ^= t;
    }
}

/// Multiplies the tweak by `x` in GF(2^128), little-endian byte order.
fn gf_double(tweak: &mut [u8; 16]) {
    let carry = tweak[15] >> 7;

    for i in (1..16).rev() {
        tweak[i] = (tweak[i] << 1) | (tweak[i - 1] >> 7);
    }

    tweak[0] <<= 1;

    if carry != 0 {
        tweak[0] ^= 0x87;
    }
}

/// AES-ECB encryption without padding. `key` must be 16 or 32 bytes.
pub fn ecb_encrypt(key: &[u8], data: &mut [u8]) -> Result<(), CipherError> {
    match key.len() {
        16 => {
            let cipher = Aes128::new(GenericArray::from_slice(key));
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                cipher.encrypt_block(GenericArray::from_mut_slice(block));
            }
        }
        32 => {
            let cipher = Aes256::new(GenericArray::from_slice(key));
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                cipher.encrypt_block(GenericArray::from_mut_slice(block));
            }
        }
        len => return InvalidKeyLengthSnafu { len }.fail(),
    }

    Ok(())
}

/// AES-ECB decryption without padding. `key` must be 16 or 32 bytes.
pub fn ecb_decrypt(key: &[u8], data: &mut [u8]) -> Result<(), CipherError> {
    match key.len() {
        16 => {
            let cipher = Aes128::new(GenericArray::from_slice(key));
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }
        32 => {
            let cipher = Aes256::new(GenericArray::from_slice(key));
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }
        len => return InvalidKeyLengthSnafu { len }.fail(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // FIPS-197 appendix C.1 and C.3.
    #[test]
    fn ecb_aes128_known_answer() {
        let key: Vec<u8> = (0..16).collect();
        let plain = hex("00112233445566778899aabbccddeeff");
        let mut data = plain.clone();

        ecb_encrypt(&key, &mut data).unwrap();
        assert_eq!(data, hex("69c4e0d86a7b0430d8cdb78070b4c55a"));

        ecb_decrypt(&key, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn ecb_aes256_known_answer() {
        let key: Vec<u8> = (0..32).collect();
        let mut data = hex("00112233445566778899aabbccddeeff");

        ecb_encrypt(&key, &mut data).unwrap();
        assert_eq!(data, hex("8ea2b7ca516745bfeafc49904b496089"));
    }

    #[test]
    fn ecb_multiple_blocks() {
        let key: Vec<u8> = (0..16).collect();
        let mut data = *b"HELLO, XBOX ONE XVD TEST VECTOR!";

        ecb_encrypt(&key, &mut data).unwrap();
        assert_eq!(
            data.to_vec(),
            hex("bb3cf6dabba02deca7605746851d16328aa34fe23472195760e573b029ba99bf")
        );

        ecb_decrypt(&key, &mut data).unwrap();
        assert_eq!(&data, b"HELLO, XBOX ONE XVD TEST VECTOR!");
    }

    #[test]
    fn ecb_rejects_bad_key() {
        let mut data = [0u8; 16];
        assert_matches!(
            ecb_encrypt(&[0u8; 24], &mut data),
            Err(CipherError::InvalidKeyLength { len: 24 })
        );
    }

    fn content_key() -> [u8; 32] {
        core::array::from_fn(|i| (i * 7) as u8)
    }

    fn test_cipher() -> AesXtsCipher {
        let vduid: Guid = "ab3f50c9-0d1b-4e26-9b7a-00ff12345678".parse().unwrap();
        let seed = AesXtsCipher::tweak_seed(0x4000_0007, &vduid);

        assert_eq!(seed.to_vec(), hex("0000000007000040c9503fab1b0d264e"));

        AesXtsCipher::from_content_key(&content_key(), seed)
    }

    // Expected values come from standard AES-XTS with key (data || tweak)
    // and tweak value (unit | region | VDUID[..8]).
    #[test]
    fn xts_known_answer() {
        let cipher = test_cipher();
        let plain: Vec<u8> = (0..64).collect();

        let mut data = plain.clone();
        cipher.encrypt_data_unit(&mut data, 5);
        assert_eq!(
            data,
            hex(concat!(
                "b2e9ac3e1244fc7e70fc30131a90998ad79e881765fdeac424ad70169ac27d92",
                "88ff223458dad36c7c572c2f8c73d331872c1f62a5939d7a71ee99490859f5bc",
            ))
        );

        cipher.decrypt_data_unit(&mut data, 5);
        assert_eq!(data, plain);
    }

    #[test]
    fn xts_split_keys_match_content_key() {
        let key = content_key();
        let seed = AesXtsCipher::tweak_seed(1, &Guid::NIL);
        let tweak_key: [u8; 16] = key[..16].try_into().unwrap();
        let data_key: [u8; 16] = key[16..].try_into().unwrap();

        let mut a: Vec<u8> = (0..64).collect();
        let mut b = a.clone();
        AesXtsCipher::from_content_key(&key, seed).encrypt_data_unit(&mut a, 3);
        AesXtsCipher::new(&data_key, &tweak_key, seed).encrypt_data_unit(&mut b, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn xts_data_unit_changes_output() {
        let cipher = test_cipher();
        let plain: Vec<u8> = (0..64).collect();

        let mut unit5 = plain.clone();
        cipher.encrypt_data_unit(&mut unit5, 5);

        let mut unit6 = plain.clone();
        cipher.encrypt_data_unit(&mut unit6, 6);
        assert_eq!(
            unit6,
            hex(concat!(
                "18a75d62caac53f7a8054459e2ae242d44cb8e580c511b90fbb183f7207844d1",
                "11a15e479663fbd27e5761536429ccc7baa52bbb50b040e0c2b1d162dbd46abc",
            ))
        );
        assert_ne!(unit5, unit6);

        // Off-by-one data unit yields garbage, not the plaintext.
        let mut wrong = unit5.clone();
        cipher.decrypt_data_unit(&mut wrong, 6);
        assert_ne!(wrong, plain);
        assert_ne!(wrong, unit5);
    }

    #[test]
    fn xts_round_trip_page() {
        let key: [u8; 32] = core::array::from_fn(|i| (i * 7) as u8);
        let cipher = AesXtsCipher::from_content_key(&key, AesXtsCipher::tweak_seed(1, &Guid::NIL));
        let plain: Vec<u8> = (0..0x1000).map(|i| (i % 251) as u8).collect();

        for unit in [0, 1, 0x1234, u32::MAX] {
            let mut data = plain.clone();
            cipher.encrypt_data_unit(&mut data, unit);
            assert_ne!(data, plain);
            cipher.decrypt_data_unit(&mut data, unit);
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn gf_double_carries() {
        let mut tweak = [0u8; 16];
        tweak[15] = 0x80;
        gf_double(&mut tweak);
        let mut expected = [0u8; 16];
        expected[0] = 0x87;
        assert_eq!(tweak, expected);

        let mut tweak = [0u8; 16];
        tweak[0] = 0x80;
        gf_double(&mut tweak);
        assert_eq!(tweak[1], 1);
        assert_eq!(tweak[0], 0);
    }
}
