//! Build time configuration.
//!
//! A product fills in one [`Config`] as a static, next to its sector table.
//!
//! ```
//! use resboot::{config::Config, ChecksumKind};
//! use storage::{Region, SectorDescriptor};
//!
//! static SECTORS: [SectorDescriptor; 3] = [
//!     SectorDescriptor::new(0x0800_4000, 0x4000, 1),
//!     SectorDescriptor::new(0x0800_8000, 0x4000, 2),
//!     SectorDescriptor::new(0x0800_c000, 0x4000, 3),
//! ];
//!
//! static CONFIG: Config = Config::new(&SECTORS, Region::new(0x0800_0000, 0x4000))
//!     .backdoor_timeout(1000)
//!     .checksum(ChecksumKind::Sha256);
//! # assert_eq!(CONFIG.backdoor_timeout_ms, 1000);
//! ```

use storage::{Region, SectorDescriptor};

use crate::checksum::{Checksum, ChecksumKind};
use crate::security::SeedKey;

/// How long the backdoor stays open after reset, unless configured.
pub const BACKDOOR_TIMEOUT_MS: u32 = 500;

/// Upper bound on how far a host or board hook may push the backdoor out.
pub const BACKDOOR_MAX_EXTENSION_MS: u32 = 30_000;

/// A connected host that says nothing for this long is dropped.
pub const INACTIVITY_TIMEOUT_MS: u32 = 10_000;

/// Polls of the device before an erase or write is given up on.
pub const NVM_POLL_LIMIT: u32 = 1_000_000;

/// Reported to a host that asks who it is talking to.
pub const STATION_ID: &[u8] = b"resboot";

#[derive(Debug, Copy, Clone)]
pub struct Config {
    /// Sectors the host may erase and program.
    pub sectors: &'static [SectorDescriptor],
    /// The updater's own sectors.  Never erased or written.
    pub protected: Region,
    pub backdoor_timeout_ms: u32,
    pub backdoor_max_extension_ms: u32,
    pub inactivity_timeout_ms: u32,
    pub checksum: ChecksumKind,
    /// Expected checksum of the protected region, checked at every reset.
    pub bootloader_checksum: Option<Checksum>,
    pub nvm_poll_limit: u32,
    pub station_id: &'static [u8],
    /// Seed and key check for programming.  Unlocked when absent.
    pub security: Option<&'static dyn SeedKey>,
}

impl Config {
    pub const fn new(sectors: &'static [SectorDescriptor], protected: Region) -> Config {
        Config {
            sectors,
            protected,
            backdoor_timeout_ms: BACKDOOR_TIMEOUT_MS,
            backdoor_max_extension_ms: BACKDOOR_MAX_EXTENSION_MS,
            inactivity_timeout_ms: INACTIVITY_TIMEOUT_MS,
            checksum: ChecksumKind::Crc32,
            bootloader_checksum: None,
            nvm_poll_limit: NVM_POLL_LIMIT,
            station_id: STATION_ID,
            security: None,
        }
    }

    pub const fn backdoor_timeout(self, ms: u32) -> Config {
        Config {
            backdoor_timeout_ms: ms,
            ..self
        }
    }

    pub const fn backdoor_max_extension(self, ms: u32) -> Config {
        Config {
            backdoor_max_extension_ms: ms,
            ..self
        }
    }

    pub const fn inactivity_timeout(self, ms: u32) -> Config {
        Config {
            inactivity_timeout_ms: ms,
            ..self
        }
    }

    pub const fn checksum(self, kind: ChecksumKind) -> Config {
        Config {
            checksum: kind,
            ..self
        }
    }

    pub const fn bootloader_checksum(self, expected: Checksum) -> Config {
        Config {
            bootloader_checksum: Some(expected),
            ..self
        }
    }

    pub const fn station_id(self, id: &'static [u8]) -> Config {
        Config {
            station_id: id,
            ..self
        }
    }

    pub const fn security(self, check: &'static dyn SeedKey) -> Config {
        Config {
            security: Some(check),
            ..self
        }
    }

    pub const fn nvm_poll_limit(self, polls: u32) -> Config {
        Config {
            nvm_poll_limit: polls,
            ..self
        }
    }
}
