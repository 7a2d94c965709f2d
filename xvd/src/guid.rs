use std::fmt;
use std::str::FromStr;

use snafu::Snafu;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Error when parsing a [`Guid`] from its string form.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseGuidError {
    #[snafu(display("GUID must have 32 hex digits, found {len}"))]
    InvalidLength { len: usize },

    #[snafu(display("invalid hex digit {ch:?} in GUID"))]
    InvalidDigit { ch: char },
}

/// A GUID in its on-disk (mixed-endian) byte order.
///
/// The first three groups are stored little-endian, the last two as-is, so
/// `{u32}-{u16}-{u16}-{2 bytes}-{6 bytes}` renders the same text Windows tools
/// print for the same bytes.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct Guid([u8; 16]);

impl Guid {
    pub const NIL: Self = Self([0u8; 16]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        let d1 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let d2 = u16::from_le_bytes([b[4], b[5]]);
        let d3 = u16::from_le_bytes([b[6], b[7]]);

        write!(f, "{d1:08x}-{d2:04x}-{d3:04x}-{:02x}{:02x}-", b[8], b[9])?;

        for byte in &b[10..] {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

impl FromStr for Guid {
    type Err = ParseGuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<char> = s
            .trim_matches(|c| c == '{' || c == '}')
            .chars()
            .filter(|&c| c != '-')
            .collect();

        snafu::ensure!(
            digits.len() == 32,
            InvalidLengthSnafu { len: digits.len() }
        );

        let mut text = [0u8; 16];

        for (i, pair) in digits.chunks_exact(2).enumerate() {
            let hi = pair[0]
                .to_digit(16)
                .ok_or_else(|| InvalidDigitSnafu { ch: pair[0] }.build())?;
            let lo = pair[1]
                .to_digit(16)
                .ok_or_else(|| InvalidDigitSnafu { ch: pair[1] }.build())?;
            text[i] = (hi << 4 | lo) as u8;
        }

        // Text order is big-endian for the first three groups.
        let mut bytes = text;
        bytes[..4].reverse();
        bytes[4..6].reverse();
        bytes[6..8].reverse();

        Ok(Self(bytes))
    }
}
