//! Image checksums.
//!
//! The algorithm is chosen per product.  Small parts use CRC-32, where the
//! SHA-256 code would cost more than the check is worth; larger parts use
//! SHA-256.  The host always computes the same thing over the same bytes, so
//! the device only has to compare.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChecksumKind {
    Crc32,
    Sha256,
}

impl ChecksumKind {
    /// Size of the digest on the wire.
    pub const fn len(&self) -> usize {
        match self {
            ChecksumKind::Crc32 => 4,
            ChecksumKind::Sha256 => 32,
        }
    }

    pub const fn code(&self) -> u8 {
        match self {
            ChecksumKind::Crc32 => 1,
            ChecksumKind::Sha256 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<ChecksumKind> {
        match code {
            1 => Some(ChecksumKind::Crc32),
            2 => Some(ChecksumKind::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Checksum {
    Crc32(u32),
    Sha256([u8; 32]),
}

impl Checksum {
    /// Largest digest, in bytes.
    pub const MAX_LEN: usize = 32;

    pub fn kind(&self) -> ChecksumKind {
        match self {
            Checksum::Crc32(_) => ChecksumKind::Crc32,
            Checksum::Sha256(_) => ChecksumKind::Sha256,
        }
    }

    /// Compute the checksum of a buffer.
    pub fn of(kind: ChecksumKind, data: &[u8]) -> Checksum {
        let mut hasher = Hasher::new(kind);
        hasher.update(data);
        hasher.finalize()
    }

    /// Write the digest into `out`, which must be `kind().len()` long.  CRCs
    /// are little endian.
    pub fn write_to(&self, out: &mut [u8]) {
        match self {
            Checksum::Crc32(crc) => out.copy_from_slice(&crc.to_le_bytes()),
            Checksum::Sha256(hash) => out.copy_from_slice(hash),
        }
    }

    pub fn read_from(kind: ChecksumKind, data: &[u8]) -> Result<Checksum> {
        if data.len() != kind.len() {
            return Err(Error::Malformed);
        }
        Ok(match kind {
            ChecksumKind::Crc32 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(data);
                Checksum::Crc32(u32::from_le_bytes(buf))
            }
            ChecksumKind::Sha256 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(data);
                Checksum::Sha256(buf)
            }
        })
    }
}

/// Incremental checksum, fed from flash a buffer at a time.
pub enum Hasher {
    Crc32(Digest<'static, u32>),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(kind: ChecksumKind) -> Hasher {
        match kind {
            ChecksumKind::Crc32 => Hasher::Crc32(CRC32.digest()),
            ChecksumKind::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Crc32(digest) => digest.update(data),
            Hasher::Sha256(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        match self {
            Hasher::Crc32(digest) => Checksum::Crc32(digest.finalize()),
            Hasher::Sha256(hasher) => Checksum::Sha256(hasher.finalize().into()),
        }
    }
}

/// CRC-32 of a buffer.  Also used to seal ledger records.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        let Checksum::Sha256(hash) = Checksum::of(ChecksumKind::Sha256, b"abc") else {
            panic!("wrong kind");
        };
        assert_eq!(&hash[..4], &[0xba, 0x78, 0x16, 0xbf]);
    }

    #[test]
    fn incremental_matches_whole() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        for kind in [ChecksumKind::Crc32, ChecksumKind::Sha256] {
            let mut h = Hasher::new(kind);
            for part in data.chunks(128) {
                h.update(part);
            }
            assert_eq!(h.finalize(), Checksum::of(kind, &data));
        }
    }

    #[test]
    fn wire_form() {
        let sum = Checksum::Crc32(0x1234_5678);
        let mut buf = [0u8; 4];
        sum.write_to(&mut buf);
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(Checksum::read_from(ChecksumKind::Crc32, &buf), Ok(sum));
        assert_eq!(
            Checksum::read_from(ChecksumKind::Sha256, &buf),
            Err(Error::Malformed)
        );
    }
}
