//! Update ledger.
//!
//! The ledger is the one piece of state that has to survive a power cut in
//! the middle of an update.  It records which target is being written, how
//! big the image is, how many bytes have been programmed and verified, and
//! whether the image was finished and checked.  The entry decision at reset
//! reads it to decide whether the application can be trusted.
//!
//! The entry moves through these states:
//!
//! ```text
//! Empty --begin--> InProgress --mark_erased--> EraseComplete
//!                      ^                            |
//!                      +----------commit------------+
//!
//! InProgress/EraseComplete --finalize--> Complete | Corrupt
//! any --mark_corrupt--> Corrupt
//! any --clear--> Empty
//! ```
//!
//! `committed` only grows, and never passes `total_length`.  Asking for
//! either is a defect in the caller rather than a runtime condition.
//!
//! Each change is written as a whole fixed size record:
//!
//! ```text
//! +--------+-----------------------------------------+
//! |  0..4  | magic                                   |
//! |  4..8  | sequence number                         |
//! |  8     | target                                  |
//! |  9     | status                                  |
//! | 10     | checksum kind (0 = none)                |
//! | 11     | reserved                                |
//! | 12..16 | base address                            |
//! | 16..20 | total length                            |
//! | 20..24 | committed length                        |
//! | 24..56 | checksum, zero padded                   |
//! | 56..60 | reserved                                |
//! | 60..64 | CRC-32 of bytes 0..60                   |
//! +--------+-----------------------------------------+
//! ```
//!
//! All fields are little endian.  A record with a bad magic or CRC is treated
//! as absent, so a write torn by a power cut falls back to the previous one.

use byteorder::{ByteOrder, LittleEndian};
use storage::{NvmBackend, Region};

use crate::checksum::{crc32, Checksum, ChecksumKind};
use crate::config::NVM_POLL_LIMIT;
use crate::watchdog::Watchdog;
use crate::{Error, Result};

pub const RECORD_LEN: usize = 64;

const MAGIC: u32 = 0x4c45_4447;
const CRC_OFFSET: usize = RECORD_LEN - 4;

/// Where an image is destined.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TargetId {
    /// A RAM staging area.  Lost on reset, so never blocks a boot.
    InternalRam = 0,
    /// Application code memory.
    FirmwareNvm = 1,
}

impl TargetId {
    pub fn from_u8(value: u8) -> Option<TargetId> {
        match value {
            0 => Some(TargetId::InternalRam),
            1 => Some(TargetId::FirmwareNvm),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LedgerStatus {
    Empty = 0,
    InProgress = 1,
    EraseComplete = 2,
    Complete = 3,
    Corrupt = 4,
}

impl LedgerStatus {
    pub fn from_u8(value: u8) -> Option<LedgerStatus> {
        match value {
            0 => Some(LedgerStatus::Empty),
            1 => Some(LedgerStatus::InProgress),
            2 => Some(LedgerStatus::EraseComplete),
            3 => Some(LedgerStatus::Complete),
            4 => Some(LedgerStatus::Corrupt),
            _ => None,
        }
    }

    /// Still being erased or programmed.
    pub fn is_active(&self) -> bool {
        matches!(self, LedgerStatus::InProgress | LedgerStatus::EraseComplete)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LedgerEntry {
    pub target: TargetId,
    pub status: LedgerStatus,
    pub base: u32,
    pub total_length: u32,
    /// Bytes programmed and verified, from `base`.
    pub committed: u32,
    /// Present once the image has been finalized.
    pub checksum: Option<Checksum>,
}

impl LedgerEntry {
    pub const EMPTY: LedgerEntry = LedgerEntry {
        target: TargetId::FirmwareNvm,
        status: LedgerStatus::Empty,
        base: 0,
        total_length: 0,
        committed: 0,
        checksum: None,
    };

    /// Must the device stay in the updater because of this entry?
    pub fn blocks_boot(&self) -> bool {
        self.target == TargetId::FirmwareNvm
            && (self.status.is_active() || self.status == LedgerStatus::Corrupt)
    }

    pub fn region(&self) -> Option<Region> {
        Region::checked(self.base, self.total_length)
    }

    fn encode(&self, seq: u32) -> [u8; RECORD_LEN] {
        let mut rec = [0u8; RECORD_LEN];
        LittleEndian::write_u32(&mut rec[0..4], MAGIC);
        LittleEndian::write_u32(&mut rec[4..8], seq);
        rec[8] = self.target as u8;
        rec[9] = self.status as u8;
        rec[10] = self.checksum.map_or(0, |c| c.kind().code());
        LittleEndian::write_u32(&mut rec[12..16], self.base);
        LittleEndian::write_u32(&mut rec[16..20], self.total_length);
        LittleEndian::write_u32(&mut rec[20..24], self.committed);
        if let Some(sum) = self.checksum {
            sum.write_to(&mut rec[24..24 + sum.kind().len()]);
        }
        let crc = crc32(&rec[..CRC_OFFSET]);
        LittleEndian::write_u32(&mut rec[CRC_OFFSET..], crc);
        rec
    }

    fn decode(rec: &[u8; RECORD_LEN]) -> Option<(u32, LedgerEntry)> {
        let seq = record_seq(rec)?;
        let checksum = match rec[10] {
            0 => None,
            code => {
                let kind = ChecksumKind::from_code(code)?;
                Some(Checksum::read_from(kind, &rec[24..24 + kind.len()]).ok()?)
            }
        };
        let entry = LedgerEntry {
            target: TargetId::from_u8(rec[8])?,
            status: LedgerStatus::from_u8(rec[9])?,
            base: LittleEndian::read_u32(&rec[12..16]),
            total_length: LittleEndian::read_u32(&rec[16..20]),
            committed: LittleEndian::read_u32(&rec[20..24]),
            checksum,
        };
        if entry.committed > entry.total_length || entry.region().is_none() {
            return None;
        }
        Some((seq, entry))
    }
}

/// Sequence number of a record, if its magic and CRC hold up.
fn record_seq(rec: &[u8; RECORD_LEN]) -> Option<u32> {
    if LittleEndian::read_u32(&rec[0..4]) != MAGIC {
        return None;
    }
    if LittleEndian::read_u32(&rec[CRC_OFFSET..]) != crc32(&rec[..CRC_OFFSET]) {
        return None;
    }
    Some(LittleEndian::read_u32(&rec[4..8]))
}

/// Somewhere to keep ledger records.
pub trait LedgerStore {
    /// Fetch the most recent record.  Returns false if there is none.
    fn load(&mut self, record: &mut [u8; RECORD_LEN]) -> Result<bool>;
    fn store(&mut self, record: &[u8; RECORD_LEN], watchdog: &mut dyn Watchdog) -> Result<()>;
}

impl<T: LedgerStore + ?Sized> LedgerStore for &mut T {
    fn load(&mut self, record: &mut [u8; RECORD_LEN]) -> Result<bool> {
        (**self).load(record)
    }
    fn store(&mut self, record: &[u8; RECORD_LEN], watchdog: &mut dyn Watchdog) -> Result<()> {
        (**self).store(record, watchdog)
    }
}

/// A record kept in RAM.  Survives a reset only if the board places it in
/// memory that is not cleared at startup.  Plain bytes, so whatever that
/// memory holds at power up is a valid slot; it only holds a record once the
/// magic and CRC say so.
#[derive(Debug, Clone)]
pub struct RamSlot {
    record: [u8; RECORD_LEN],
}

impl Default for RamSlot {
    fn default() -> Self {
        RamSlot::new()
    }
}

impl RamSlot {
    pub const fn new() -> RamSlot {
        RamSlot {
            record: [0; RECORD_LEN],
        }
    }

    /// Take over memory as it was found at power up.
    pub const fn from_raw(record: [u8; RECORD_LEN]) -> RamSlot {
        RamSlot { record }
    }

    pub fn raw(&self) -> &[u8; RECORD_LEN] {
        &self.record
    }
}

impl LedgerStore for RamSlot {
    fn load(&mut self, record: &mut [u8; RECORD_LEN]) -> Result<bool> {
        record.copy_from_slice(&self.record);
        Ok(LittleEndian::read_u32(&self.record[0..4]) == MAGIC)
    }

    fn store(&mut self, record: &[u8; RECORD_LEN], _watchdog: &mut dyn Watchdog) -> Result<()> {
        self.record = *record;
        Ok(())
    }
}

/// Records appended to a dedicated sector.  The newest valid record wins.
/// When the sector fills, it is erased and writing starts again at the
/// bottom.
pub struct NvmSlot<B> {
    nvm: B,
    region: Region,
    /// Offset of the first blank record, once scanned.  `None` means full.
    next: Option<u32>,
    scanned: bool,
}

impl<B: NvmBackend> NvmSlot<B> {
    /// `region` must be exactly one erasable sector of `nvm`.
    pub fn new(nvm: B, region: Region) -> Result<NvmSlot<B>> {
        let write_size = nvm.write_size();
        if write_size == 0
            || RECORD_LEN % write_size != 0
            || region.len() < RECORD_LEN as u32
            || region.len() % RECORD_LEN as u32 != 0
        {
            return Err(Error::Ledger);
        }
        Ok(NvmSlot {
            nvm,
            region,
            next: None,
            scanned: false,
        })
    }

    pub fn nvm(&self) -> &B {
        &self.nvm
    }

    pub fn nvm_mut(&mut self) -> &mut B {
        &mut self.nvm
    }

    pub fn into_inner(self) -> B {
        self.nvm
    }

    fn wait(&mut self, watchdog: &mut dyn Watchdog) -> Result<()> {
        for _ in 0..NVM_POLL_LIMIT {
            watchdog.service();
            if self.nvm.is_operation_done().map_err(|_| Error::Ledger)? {
                return Ok(());
            }
        }
        Err(Error::Ledger)
    }

    fn scan(&mut self, latest: &mut [u8; RECORD_LEN]) -> Result<bool> {
        let erased = self.nvm.erased_value();
        let mut found: Option<u32> = None;
        let mut buf = [0u8; RECORD_LEN];
        let mut off = 0;
        self.next = None;
        while off < self.region.len() {
            self.nvm
                .read(self.region.start() + off, &mut buf)
                .map_err(|_| Error::Ledger)?;
            if buf.iter().all(|&b| b == erased) {
                self.next = Some(off);
                break;
            }
            if let Some(seq) = record_seq(&buf) {
                if found.map_or(true, |best| seq > best) {
                    latest.copy_from_slice(&buf);
                    found = Some(seq);
                }
            }
            off += RECORD_LEN as u32;
        }
        self.scanned = true;
        Ok(found.is_some())
    }
}

impl<B: NvmBackend> LedgerStore for NvmSlot<B> {
    fn load(&mut self, record: &mut [u8; RECORD_LEN]) -> Result<bool> {
        self.scan(record)
    }

    fn store(&mut self, record: &[u8; RECORD_LEN], watchdog: &mut dyn Watchdog) -> Result<()> {
        if !self.scanned {
            let mut scratch = [0u8; RECORD_LEN];
            self.scan(&mut scratch)?;
        }
        let off = match self.next {
            Some(off) => off,
            None => {
                debug!("ledger sector full, erasing");
                self.nvm
                    .erase(self.region.start(), self.region.len())
                    .map_err(|_| Error::Ledger)?;
                self.wait(watchdog)?;
                0
            }
        };
        self.nvm
            .write(self.region.start() + off, record)
            .map_err(|_| Error::Ledger)?;
        self.wait(watchdog)?;
        let after = off + RECORD_LEN as u32;
        self.next = if after < self.region.len() {
            Some(after)
        } else {
            None
        };
        Ok(())
    }
}

/// The ledger itself, over some store.
pub struct Ledger<S> {
    store: S,
    entry: LedgerEntry,
    seq: u32,
}

impl<S: LedgerStore> Ledger<S> {
    /// Load the newest record from the store.  A store holding nothing valid
    /// gives an empty ledger.
    pub fn open(mut store: S) -> Result<Ledger<S>> {
        let mut rec = [0u8; RECORD_LEN];
        let (seq, entry) = if store.load(&mut rec)? {
            match LedgerEntry::decode(&rec) {
                Some(found) => found,
                None => {
                    warn!("ledger record invalid, treating as empty");
                    (0, LedgerEntry::EMPTY)
                }
            }
        } else {
            (0, LedgerEntry::EMPTY)
        };
        info!(
            "ledger: {:?} base {:#x} {}/{}",
            entry.status, entry.base, entry.committed, entry.total_length
        );
        Ok(Ledger { store, entry, seq })
    }

    pub fn read(&self) -> LedgerEntry {
        self.entry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn write(&mut self, entry: LedgerEntry, watchdog: &mut dyn Watchdog) -> Result<()> {
        let seq = self.seq.wrapping_add(1);
        let rec = entry.encode(seq);
        self.store.store(&rec, watchdog).map_err(|e| {
            error!("ledger write failed: {:?}", e);
            Error::Ledger
        })?;
        self.seq = seq;
        self.entry = entry;
        Ok(())
    }

    fn require_active(&self) -> Result<()> {
        if self.entry.status.is_active() {
            Ok(())
        } else {
            error!("ledger not active: {:?}", self.entry.status);
            Err(Error::Defect)
        }
    }

    /// Start a new update, replacing whatever was there.
    pub fn begin(
        &mut self,
        target: TargetId,
        base: u32,
        total_length: u32,
        watchdog: &mut dyn Watchdog,
    ) -> Result<()> {
        if Region::checked(base, total_length).is_none() {
            return Err(Error::Defect);
        }
        let entry = LedgerEntry {
            target,
            status: LedgerStatus::InProgress,
            base,
            total_length,
            committed: 0,
            checksum: None,
        };
        self.write(entry, watchdog)
    }

    /// Grow the current update by a further contiguous erase.
    pub fn extend(&mut self, additional: u32, watchdog: &mut dyn Watchdog) -> Result<()> {
        self.require_active()?;
        let mut entry = self.entry;
        entry.total_length = entry
            .total_length
            .checked_add(additional)
            .ok_or(Error::Defect)?;
        if entry.region().is_none() {
            return Err(Error::Defect);
        }
        entry.status = LedgerStatus::InProgress;
        self.write(entry, watchdog)
    }

    pub fn mark_erased(&mut self, watchdog: &mut dyn Watchdog) -> Result<()> {
        self.require_active()?;
        let mut entry = self.entry;
        entry.status = LedgerStatus::EraseComplete;
        self.write(entry, watchdog)
    }

    /// Record `n` more bytes as programmed and verified.
    pub fn commit(&mut self, n: u32, watchdog: &mut dyn Watchdog) -> Result<()> {
        self.require_active()?;
        let mut entry = self.entry;
        entry.committed = match entry.committed.checked_add(n) {
            Some(c) if c <= entry.total_length => c,
            _ => {
                error!(
                    "commit of {} past end: {}/{}",
                    n, entry.committed, entry.total_length
                );
                return Err(Error::Defect);
            }
        };
        entry.status = LedgerStatus::InProgress;
        self.write(entry, watchdog)
    }

    /// Close out the update once every byte has been committed.
    pub fn finalize(
        &mut self,
        success: bool,
        checksum: Checksum,
        watchdog: &mut dyn Watchdog,
    ) -> Result<()> {
        self.require_active()?;
        if self.entry.committed != self.entry.total_length {
            return Err(Error::Defect);
        }
        let mut entry = self.entry;
        if success {
            entry.status = LedgerStatus::Complete;
            entry.checksum = Some(checksum);
        } else {
            entry.status = LedgerStatus::Corrupt;
            entry.checksum = None;
        }
        self.write(entry, watchdog)
    }

    pub fn mark_corrupt(&mut self, watchdog: &mut dyn Watchdog) -> Result<()> {
        let mut entry = self.entry;
        entry.status = LedgerStatus::Corrupt;
        entry.checksum = None;
        self.write(entry, watchdog)
    }

    pub fn clear(&mut self, watchdog: &mut dyn Watchdog) -> Result<()> {
        self.write(LedgerEntry::EMPTY, watchdog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::NoWatchdog;
    use simflash::SimFlash;
    use storage::SectorDescriptor;

    fn slot_flash() -> SimFlash {
        SimFlash::new(&SectorDescriptor::uniform::<2>(0x0040_0000, 256, 0), 8).unwrap()
    }

    #[test]
    fn record_round_trip() {
        let entry = LedgerEntry {
            target: TargetId::FirmwareNvm,
            status: LedgerStatus::Complete,
            base: 0x0800_4000,
            total_length: 0xc000,
            committed: 0xc000,
            checksum: Some(Checksum::Crc32(0xdead_beef)),
        };
        let mut rec = entry.encode(7);
        assert_eq!(LedgerEntry::decode(&rec), Some((7, entry)));
        rec[13] ^= 0x40;
        assert_eq!(LedgerEntry::decode(&rec), None);
    }

    #[test]
    fn lifecycle() {
        let mut wdg = NoWatchdog;
        let mut ledger = Ledger::open(RamSlot::new()).unwrap();
        assert_eq!(ledger.read(), LedgerEntry::EMPTY);
        assert!(!ledger.read().blocks_boot());

        ledger.begin(TargetId::FirmwareNvm, 0x0800_4000, 0x8000, &mut wdg).unwrap();
        assert!(ledger.read().blocks_boot());
        ledger.mark_erased(&mut wdg).unwrap();
        assert_eq!(ledger.read().status, LedgerStatus::EraseComplete);
        ledger.commit(0x4000, &mut wdg).unwrap();
        assert_eq!(ledger.read().status, LedgerStatus::InProgress);
        assert_eq!(
            ledger.finalize(true, Checksum::Crc32(1), &mut wdg),
            Err(Error::Defect)
        );
        ledger.commit(0x4000, &mut wdg).unwrap();
        assert_eq!(ledger.commit(1, &mut wdg), Err(Error::Defect));
        ledger.finalize(true, Checksum::Crc32(1), &mut wdg).unwrap();
        assert_eq!(ledger.read().status, LedgerStatus::Complete);
        assert!(!ledger.read().blocks_boot());
        assert_eq!(ledger.commit(0, &mut wdg), Err(Error::Defect));

        // Reopening the same store gives the same entry.
        let store = ledger.into_store();
        let ledger = Ledger::open(store).unwrap();
        assert_eq!(ledger.read().checksum, Some(Checksum::Crc32(1)));
    }

    #[test]
    fn ram_slot_from_power_up_contents() {
        let mut wdg = NoWatchdog;
        let ledger = Ledger::open(RamSlot::from_raw([0x5a; RECORD_LEN])).unwrap();
        assert_eq!(ledger.read(), LedgerEntry::EMPTY);

        let mut ledger = Ledger::open(RamSlot::default()).unwrap();
        ledger.begin(TargetId::FirmwareNvm, 0x0800_4000, 0x4000, &mut wdg).unwrap();
        let mut raw = *ledger.store().raw();
        let ledger = Ledger::open(RamSlot::from_raw(raw)).unwrap();
        assert!(ledger.read().blocks_boot());

        // Right magic, broken CRC.
        raw[20] ^= 1;
        let ledger = Ledger::open(RamSlot::from_raw(raw)).unwrap();
        assert_eq!(ledger.read(), LedgerEntry::EMPTY);
    }

    #[test]
    fn staging_does_not_block() {
        let mut wdg = NoWatchdog;
        let mut ledger = Ledger::open(RamSlot::new()).unwrap();
        ledger.begin(TargetId::InternalRam, 0x2000_0000, 0x1000, &mut wdg).unwrap();
        assert!(!ledger.read().blocks_boot());
    }

    #[test]
    fn nvm_slot_appends_and_wraps() {
        let mut wdg = NoWatchdog;
        let slot = NvmSlot::new(slot_flash(), Region::new(0x0040_0100, 256)).unwrap();
        let mut ledger = Ledger::open(slot).unwrap();

        // Four records fit, the fifth forces an erase.
        ledger.begin(TargetId::FirmwareNvm, 0x1000, 0x400, &mut wdg).unwrap();
        for _ in 0..4 {
            ledger.commit(0x100, &mut wdg).unwrap();
        }
        let flash = ledger.store().nvm();
        assert_eq!(flash.stats().erases, vec![0x0040_0100]);
        assert!(!flash.is_blank(0x0040_0100, 64));
        assert!(flash.is_blank(0x0040_0140, 64));

        let ledger = Ledger::open(ledger.into_store()).unwrap();
        assert_eq!(ledger.read().committed, 0x400);
        assert_eq!(ledger.read().status, LedgerStatus::InProgress);
    }

    #[test]
    fn torn_record_falls_back() {
        let mut wdg = NoWatchdog;
        let slot = NvmSlot::new(slot_flash(), Region::new(0x0040_0000, 256)).unwrap();
        let mut ledger = Ledger::open(slot).unwrap();
        ledger.begin(TargetId::FirmwareNvm, 0x1000, 0x400, &mut wdg).unwrap();
        ledger.commit(0x100, &mut wdg).unwrap();

        // Half of a third record, as if power failed mid write.
        let mut flash = ledger.into_store().into_inner();
        flash.install(0x0040_0080, &[0x47, 0x44, 0x45, 0x4c, 9, 0, 0, 0]).unwrap();

        let slot = NvmSlot::new(flash, Region::new(0x0040_0000, 256)).unwrap();
        let mut ledger = Ledger::open(slot).unwrap();
        assert_eq!(ledger.read().committed, 0x100);

        // The next record goes after the torn one.
        ledger.commit(0x100, &mut wdg).unwrap();
        let flash = ledger.into_store().into_inner();
        assert!(!flash.is_blank(0x0040_00c0, 64));
    }

    #[test]
    fn slot_geometry() {
        assert!(NvmSlot::new(slot_flash(), Region::new(0x0040_0000, 100)).is_err());
        let pages = SimFlash::new(&SectorDescriptor::uniform::<1>(0, 512, 0), 128).unwrap();
        assert!(NvmSlot::new(pages, Region::new(0, 512)).is_err());
    }
}
