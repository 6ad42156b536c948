//! Entry decision.
//!
//! At reset the updater decides, in order:
//!
//! 1. An update to code memory was left in progress, or failed: stay.
//! 2. The board's force-entry pin is held, or the application asked to be
//!    updated: stay.
//! 3. The ledger has no finished image, or the image no longer matches its
//!    checksum: stay.
//! 4. Otherwise open the backdoor window.  A host that connects before it
//!    closes keeps the device in the updater; if none does, the application
//!    is started once the window has run out.
//!
//! Only the first three are made here.  The window is a [`BackdoorWindow`]
//! polled from the main loop.

use crate::clock;
use crate::ledger::LedgerEntry;

/// Things the board knows at reset.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EntryInputs {
    /// The force-entry pin is asserted.
    pub force_entry: bool,
    /// The application left a request to be updated, with the host already
    /// waiting to talk.
    pub connect_request: bool,
}

/// Why the updater is staying.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EntryReason {
    UpdateInProgress,
    UpdateCorrupt,
    ForceEntry,
    ConnectRequest,
    InvalidApplication,
    /// A host connected within the backdoor window.
    HostConnected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootDecision {
    RemainInEngine(EntryReason),
    TransferToApplication { base: u32 },
}

/// Steps one to three.  `None` means the backdoor window applies.
/// `app_valid` is only called if the first two steps pass.
pub fn evaluate<F>(entry: &LedgerEntry, inputs: &EntryInputs, app_valid: F) -> Option<EntryReason>
where
    F: FnOnce(&LedgerEntry) -> bool,
{
    if entry.blocks_boot() {
        return Some(if entry.status.is_active() {
            EntryReason::UpdateInProgress
        } else {
            EntryReason::UpdateCorrupt
        });
    }
    if inputs.connect_request {
        return Some(EntryReason::ConnectRequest);
    }
    if inputs.force_entry {
        return Some(EntryReason::ForceEntry);
    }
    if !app_valid(entry) {
        return Some(EntryReason::InvalidApplication);
    }
    None
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WindowState {
    Open,
    /// The deadline has just passed.  Reported exactly once.
    Expired,
    Closed,
}

/// The time after reset in which a host may still claim the device.
///
/// The deadline is `opened + timeout + extension`.  The extension can be set
/// by the host or by a board hook while the window is open, and is capped.
#[derive(Debug, Copy, Clone)]
pub struct BackdoorWindow {
    opened: u32,
    timeout: u32,
    extension: u32,
    max_extension: u32,
    closed: bool,
}

impl BackdoorWindow {
    pub fn open(now: u32, timeout: u32, max_extension: u32) -> BackdoorWindow {
        debug!("backdoor open for {} ms", timeout);
        BackdoorWindow {
            opened: now,
            timeout,
            extension: 0,
            max_extension,
            closed: false,
        }
    }

    pub fn deadline(&self) -> u32 {
        self.opened.wrapping_add(self.timeout.saturating_add(self.extension))
    }

    pub fn extension(&self) -> u32 {
        self.extension
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Set the extension, replacing any earlier one.
    pub fn extend(&mut self, ms: u32) {
        if self.closed {
            return;
        }
        self.extension = ms.min(self.max_extension);
        debug!("backdoor extended by {} ms", self.extension);
    }

    /// Start the timeout over from `now`, as after a session ends.
    pub fn restart(&mut self, now: u32) {
        if !self.closed {
            self.opened = now;
        }
    }

    /// Has the window run out?  While a host is connected the deadline does
    /// not apply.
    pub fn check(&mut self, now: u32, connected: bool) -> WindowState {
        if self.closed {
            return WindowState::Closed;
        }
        if connected {
            return WindowState::Open;
        }
        let length = self.timeout.saturating_add(self.extension);
        if clock::expired(now, self.opened, length) {
            self.closed = true;
            info!("backdoor closed");
            WindowState::Expired
        } else {
            WindowState::Open
        }
    }
}
