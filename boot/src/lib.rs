//! A resident firmware updater built for embedded rust.
//!
//! The updater lives in the first sectors of a microcontroller's code memory
//! and stays there for the life of the device.  On every reset it decides
//! whether to hand control to the application, or to remain and accept a new
//! image from a host over some byte-oriented [`transport::Transport`].
//!
//! The pieces, from the bottom up:
//!
//! - [`flash::FlashManager`] erases and programs whole sectors of the
//!   application area, and refuses to touch the region the updater itself
//!   lives in.
//! - [`ledger::Ledger`] is a small persistent record of how far the current
//!   update has got, so that a power cut at any point leaves the device in a
//!   state it can recover from.
//! - [`engine::Engine`] is the host protocol state machine.  A product can
//!   put programming behind a seed and key exchange with [`security::SeedKey`].
//! - [`backdoor`] holds the entry decision made at reset, and the window in
//!   which a host can still claim the device before the application starts.
//! - [`bootloader::Bootloader`] ties these into a cooperative main loop.
//!
//! Nothing here blocks on the host or on the flash.  Long flash operations are
//! started and then polled, with the watchdog serviced on every pass.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[macro_use]
mod logging;

pub mod backdoor;
pub mod bootloader;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod critical;
pub mod engine;
pub mod flash;
pub mod ledger;
pub mod nvm;
pub mod protocol;
pub mod security;
pub mod transport;
pub mod watchdog;

pub use backdoor::{BackdoorWindow, BootDecision, EntryInputs, EntryReason};
pub use bootloader::{Bootloader, Platform, Step};
pub use checksum::{Checksum, ChecksumKind};
pub use config::Config;
pub use engine::{Engine, Outcome, SessionState};
pub use ledger::{Ledger, LedgerEntry, LedgerStatus, TargetId};
pub use security::SeedKey;

pub type Result<T> = core::result::Result<T, Error>;

/// Everything that can go wrong.  Each variant has a stable one byte code
/// used when reporting it to the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Connect while an erase or program is running.
    AlreadyBusy,
    /// Another command arrived while an erase or program is running.
    Busy,
    /// Disconnect while an erase or program is running.
    UnsafeToDisconnect,
    /// An erase that does not cover whole sectors.
    UnalignedRegion,
    /// Any part of the request touches the updater's own sectors.
    ProtectedRegion,
    /// Programming outside of what has been erased in this session.
    NotErased,
    /// A chunk that does not continue from the previous one.
    OutOfOrder,
    /// Address or length not a multiple of the device write size.
    Misaligned,
    /// The address is not in code memory at all.
    OutOfBounds,
    /// Finalize before every byte of the image has been committed.
    Incomplete,
    /// Programming before the host has unlocked, or with the wrong key.
    AccessLocked,
    /// A read back request beyond what memory or the link can give.
    OutOfRange,
    /// Unlock without a seed to answer.
    Sequence,
    ChecksumMismatch,
    /// The device failed to erase, program, or read back what was written.
    HardwareFault,
    /// The ledger could not be written.
    Ledger,
    /// The pending operation was cut short by an abort or reset.
    Aborted,
    NotConnected,
    /// A packet that could not be decoded.
    Malformed,
    UnknownCommand,
    /// An internal invariant was broken.  The updater halts.
    Defect,
}

impl Error {
    /// The code sent in an error response.
    pub fn code(&self) -> u8 {
        match self {
            Error::AlreadyBusy => 0x10,
            Error::Busy => 0x11,
            Error::UnsafeToDisconnect => 0x12,
            Error::UnalignedRegion => 0x20,
            Error::ProtectedRegion => 0x21,
            Error::NotErased => 0x22,
            Error::OutOfOrder => 0x23,
            Error::Misaligned => 0x24,
            Error::OutOfBounds => 0x25,
            Error::Incomplete => 0x26,
            Error::AccessLocked => 0x27,
            Error::OutOfRange => 0x28,
            Error::Sequence => 0x29,
            Error::ChecksumMismatch => 0x30,
            Error::HardwareFault => 0x31,
            Error::Ledger => 0x32,
            Error::Aborted => 0x33,
            Error::NotConnected => 0x40,
            Error::Malformed => 0x41,
            Error::UnknownCommand => 0x42,
            Error::Defect => 0x7f,
        }
    }

    pub fn from_code(code: u8) -> Option<Error> {
        let e = match code {
            0x10 => Error::AlreadyBusy,
            0x11 => Error::Busy,
            0x12 => Error::UnsafeToDisconnect,
            0x20 => Error::UnalignedRegion,
            0x21 => Error::ProtectedRegion,
            0x22 => Error::NotErased,
            0x23 => Error::OutOfOrder,
            0x24 => Error::Misaligned,
            0x25 => Error::OutOfBounds,
            0x26 => Error::Incomplete,
            0x27 => Error::AccessLocked,
            0x28 => Error::OutOfRange,
            0x29 => Error::Sequence,
            0x30 => Error::ChecksumMismatch,
            0x31 => Error::HardwareFault,
            0x32 => Error::Ledger,
            0x33 => Error::Aborted,
            0x40 => Error::NotConnected,
            0x41 => Error::Malformed,
            0x42 => Error::UnknownCommand,
            0x7f => Error::Defect,
            _ => return None,
        };
        Some(e)
    }

    /// Errors after which the update in progress can no longer be trusted.
    pub fn is_fatal_to_update(&self) -> bool {
        matches!(self, Error::HardwareFault | Error::Ledger)
    }
}

/// Convert the storage error into our error type.
impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        match e {
            storage::Error::NotAligned => Error::Misaligned,
            storage::Error::OutOfBounds => Error::OutOfBounds,
            storage::Error::NotErased => Error::NotErased,
            storage::Error::Device => Error::HardwareFault,
            storage::Error::Busy => Error::Busy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn codes_are_stable() {
        let all = [
            Error::AlreadyBusy,
            Error::Busy,
            Error::UnsafeToDisconnect,
            Error::UnalignedRegion,
            Error::ProtectedRegion,
            Error::NotErased,
            Error::OutOfOrder,
            Error::Misaligned,
            Error::OutOfBounds,
            Error::Incomplete,
            Error::AccessLocked,
            Error::OutOfRange,
            Error::Sequence,
            Error::ChecksumMismatch,
            Error::HardwareFault,
            Error::Ledger,
            Error::Aborted,
            Error::NotConnected,
            Error::Malformed,
            Error::UnknownCommand,
            Error::Defect,
        ];
        for e in all {
            assert_eq!(Error::from_code(e.code()), Some(e));
        }
        assert_eq!(Error::ProtectedRegion.code(), 0x21);
        assert_eq!(Error::from_code(0x00), None);
    }
}
