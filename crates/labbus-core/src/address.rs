//! GPIB addressing and line-termination primitives.

use crate::error::{GpibError, Result};
use serde::Deserialize;

/// Number of primary GPIB addresses on a bus (0 through 30).
pub const PRIMARY_ADDRESS_COUNT: usize = 31;

/// A validated primary GPIB address in the range 0..=30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpibAddress(u8);

impl GpibAddress {
    pub fn new(address: i64) -> Result<Self> {
        if (0..PRIMARY_ADDRESS_COUNT as i64).contains(&address) {
            Ok(Self(address as u8))
        } else {
            Err(GpibError::illegal_argument(
                "",
                format!(
                    "GPIB address {} is outside the allowed range of 0 to {}",
                    address,
                    PRIMARY_ADDRESS_COUNT - 1
                ),
            ))
        }
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Iterate over every primary address on the bus.
    pub fn all() -> impl Iterator<Item = GpibAddress> {
        (0..PRIMARY_ADDRESS_COUNT as u8).map(GpibAddress)
    }
}

impl TryFrom<u8> for GpibAddress {
    type Error = GpibError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value as i64)
    }
}

impl TryFrom<i64> for GpibAddress {
    type Error = GpibError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl std::fmt::Display for GpibAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A line terminator of zero, one, or two bytes.
///
/// Stored in the packed form used in configuration files, where each byte
/// of the pattern occupies eight bits: `0x0a` is LF, `0x0d0a` is CR LF,
/// and `0` means "no terminator". Adapters that only understand single-byte
/// EOS characters reject longer patterns through [`Termination::single_byte`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Termination(u32);

impl Termination {
    pub const NONE: Termination = Termination(0);
    pub const LF: Termination = Termination(0x0a);
    pub const CR: Termination = Termination(0x0d);
    pub const CRLF: Termination = Termination(0x0d0a);
    pub const LFCR: Termination = Termination(0x0a0d);

    pub fn from_pattern(pattern: u32) -> Result<Self> {
        if pattern > 0xffff {
            return Err(GpibError::illegal_argument(
                "",
                format!("line terminator pattern {pattern:#x} is longer than two bytes"),
            ));
        }
        Ok(Self(pattern))
    }

    pub fn pattern(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// The terminator as a byte sequence, high byte first.
    pub fn bytes(&self) -> Vec<u8> {
        match self.0 {
            0 => Vec::new(),
            p if p <= 0xff => vec![p as u8],
            p => vec![(p >> 8) as u8, (p & 0xff) as u8],
        }
    }

    /// The final byte of the pattern, the one actually on the wire last.
    pub fn last_byte(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some((self.0 & 0xff) as u8)
        }
    }

    /// The pattern as a single byte, for adapters whose EOS register only
    /// holds one character.
    pub fn single_byte(&self) -> Result<Option<u8>> {
        match self.0 {
            0 => Ok(None),
            p if p <= 0xff => Ok(Some(p as u8)),
            p => Err(GpibError::illegal_argument(
                "",
                format!("EOS terminator {p:#x} must be only one byte long"),
            )),
        }
    }
}

impl Default for Termination {
    fn default() -> Self {
        Termination::LF
    }
}

/// Per-call transfer flags: the NOWAIT / DEBUG pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFlags {
    /// Use the adapter's asynchronous transfer variant where one exists.
    pub nowait: bool,
    /// Log the exchanged bytes at debug level.
    pub debug: bool,
}

impl TransferFlags {
    pub const NONE: TransferFlags = TransferFlags {
        nowait: false,
        debug: false,
    };

    pub fn debug() -> Self {
        TransferFlags {
            nowait: false,
            debug: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpibErrorKind;

    #[test]
    fn address_range_is_enforced() {
        assert!(GpibAddress::new(0).is_ok());
        assert!(GpibAddress::new(30).is_ok());
        let err = GpibAddress::new(31).unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::IllegalArgument);
        assert!(GpibAddress::new(-1).is_err());
    }

    #[test]
    fn all_addresses_covers_the_bus() {
        assert_eq!(GpibAddress::all().count(), PRIMARY_ADDRESS_COUNT);
    }

    #[test]
    fn termination_bytes() {
        assert!(Termination::NONE.bytes().is_empty());
        assert_eq!(Termination::LF.bytes(), vec![0x0a]);
        assert_eq!(Termination::CRLF.bytes(), vec![0x0d, 0x0a]);
        assert_eq!(Termination::CRLF.last_byte(), Some(0x0a));
    }

    #[test]
    fn single_byte_rejects_two_byte_patterns() {
        assert_eq!(Termination::LF.single_byte().unwrap(), Some(0x0a));
        assert_eq!(Termination::NONE.single_byte().unwrap(), None);
        assert!(Termination::CRLF.single_byte().is_err());
    }
}
