//! Flash programming.
//!
//! The [`FlashManager`] is the only thing that erases or writes code memory.
//! It works in whole sectors from the configured table, and every request is
//! checked against the protected region first, so the updater can never
//! erase itself no matter what a host asks for.
//!
//! Operations come in two halves.  `start_*` issues the erase or write with
//! interrupts masked, and [`FlashManager::poll`] reports when the device has
//! finished.  The blocking forms just loop on the poll, servicing the
//! watchdog each time around.

use storage::{NvmBackend, Region, SectorDescriptor, SectorMap, SectorSpan};

use crate::checksum::{Checksum, ChecksumKind, Hasher};
use crate::config::Config;
use crate::critical::{InterruptControl, Nesting, NoInterrupts};
use crate::watchdog::Watchdog;
use crate::{Error, Result};

/// Size of reads when checking or hashing flash contents.
const BUFFER_SIZE: usize = 128;

pub struct FlashManager<B, I = NoInterrupts> {
    nvm: B,
    map: SectorMap<'static>,
    protected: Region,
    critical: Nesting<I>,
    poll_limit: u32,
}

impl<B: NvmBackend> FlashManager<B> {
    /// The device write size has to be a power of two.
    pub fn new(nvm: B, config: &Config) -> Result<FlashManager<B>> {
        if !nvm.write_size().is_power_of_two() {
            return Err(Error::Defect);
        }
        let map = SectorMap::new(config.sectors).map_err(|_| Error::Defect)?;
        Ok(FlashManager {
            nvm,
            map,
            protected: config.protected,
            critical: Nesting::new(NoInterrupts),
            poll_limit: config.nvm_poll_limit,
        })
    }
}

impl<B: NvmBackend, I: InterruptControl> FlashManager<B, I> {
    /// Use board interrupt control around erases and writes.
    pub fn with_interrupts<J: InterruptControl>(self, irq: J) -> FlashManager<B, J> {
        FlashManager {
            nvm: self.nvm,
            map: self.map,
            protected: self.protected,
            critical: Nesting::new(irq),
            poll_limit: self.poll_limit,
        }
    }

    pub fn init(&mut self) -> Result<()> {
        Ok(self.nvm.init()?)
    }

    pub fn map(&self) -> &SectorMap<'static> {
        &self.map
    }

    pub fn sector(&self, position: usize) -> Option<&'static SectorDescriptor> {
        self.map.get(position)
    }

    pub fn write_size(&self) -> usize {
        self.nvm.write_size()
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

    /// Does any part of this range touch the updater's own sectors?  A range
    /// that wraps the address space is treated as protected.
    pub fn is_protected(&self, address: u32, length: u32) -> bool {
        match Region::checked(address, length) {
            Some(region) => region.overlaps(&self.protected),
            None => true,
        }
    }

    /// Turn an erase request into whole sectors.  The protected check comes
    /// first, so a request that is both protected and unaligned reports
    /// protected.
    pub fn resolve(&self, region: &Region) -> Result<SectorSpan> {
        if self.is_protected(region.start(), region.len()) {
            return Err(Error::ProtectedRegion);
        }
        self.map.resolve(region).map_err(|_| Error::UnalignedRegion)
    }

    fn sector_checked(&self, position: usize) -> Result<&'static SectorDescriptor> {
        let sector = self.map.get(position).ok_or(Error::OutOfBounds)?;
        if self.is_protected(sector.base, sector.size) {
            return Err(Error::ProtectedRegion);
        }
        Ok(sector)
    }

    pub fn start_erase_sector(&mut self, position: usize) -> Result<()> {
        let sector = self.sector_checked(position)?;
        debug!("erase sector {} at {:#x}", sector.index, sector.base);
        let _cs = self.critical.enter();
        Ok(self.nvm.erase(sector.base, sector.size)?)
    }

    /// Start programming `bytes`, which must lie within a single sector.
    pub fn start_program(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        let length = u32::try_from(bytes.len()).map_err(|_| Error::OutOfBounds)?;
        if self.is_protected(address, length) {
            return Err(Error::ProtectedRegion);
        }
        storage::check_write(&self.nvm, address, bytes.len())?;
        let first = self.map.find(address).ok_or(Error::OutOfBounds)?;
        if bytes.is_empty() || !self.map.sectors()[first].region().contains(address + length - 1) {
            return Err(Error::OutOfBounds);
        }
        let _cs = self.critical.enter();
        Ok(self.nvm.write(address, bytes)?)
    }

    /// Has the last erase or write finished?
    pub fn poll(&mut self) -> Result<bool> {
        self.nvm.is_operation_done().map_err(|e| match e {
            storage::Error::Busy => Error::Busy,
            _ => Error::HardwareFault,
        })
    }

    pub fn poll_limit(&self) -> u32 {
        self.poll_limit
    }

    /// Wait for the device, giving up after the configured number of polls.
    pub fn wait<W: Watchdog + ?Sized>(&mut self, watchdog: &mut W) -> Result<()> {
        for _ in 0..self.poll_limit {
            watchdog.service();
            if self.poll()? {
                return Ok(());
            }
        }
        error!("flash operation did not complete");
        Err(Error::HardwareFault)
    }

    /// Erase one sector, by position in the table, and check that it reads
    /// back blank.
    pub fn erase_sector<W: Watchdog + ?Sized>(
        &mut self,
        position: usize,
        watchdog: &mut W,
    ) -> Result<()> {
        self.start_erase_sector(position)?;
        self.wait(watchdog)?;
        self.check_erased(position, watchdog)
    }

    /// Check a sector erased by [`FlashManager::start_erase_sector`].
    pub fn check_erased<W: Watchdog + ?Sized>(
        &mut self,
        position: usize,
        watchdog: &mut W,
    ) -> Result<()> {
        let sector = self.sector_checked(position)?;
        if self.is_blank(&sector.region(), watchdog)? {
            Ok(())
        } else {
            error!("sector {} not blank after erase", sector.index);
            Err(Error::HardwareFault)
        }
    }

    pub fn is_blank<W: Watchdog + ?Sized>(
        &mut self,
        region: &Region,
        watchdog: &mut W,
    ) -> Result<bool> {
        let erased = self.nvm.erased_value();
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut pos = region.start();
        while pos < region.end() {
            let todo = ((region.end() - pos) as usize).min(buffer.len());
            let buf = &mut buffer[..todo];
            self.nvm.read(pos, buf).map_err(|_| Error::HardwareFault)?;
            if buf.iter().any(|&b| b != erased) {
                return Ok(false);
            }
            pos += todo as u32;
            watchdog.service();
        }
        Ok(true)
    }

    /// Program and wait.  Does not read back.
    pub fn program<W: Watchdog + ?Sized>(
        &mut self,
        address: u32,
        bytes: &[u8],
        watchdog: &mut W,
    ) -> Result<()> {
        self.start_program(address, bytes)?;
        self.wait(watchdog)
    }

    /// Read code memory, the protected region included.
    pub fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<()> {
        Ok(self.nvm.read(address, bytes)?)
    }

    /// Read back and compare.
    pub fn verify(&mut self, address: u32, bytes: &[u8]) -> Result<bool> {
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut pos = address;
        for expected in bytes.chunks(BUFFER_SIZE) {
            let buf = &mut buffer[..expected.len()];
            self.nvm.read(pos, buf).map_err(|_| Error::HardwareFault)?;
            if buf != expected {
                return Ok(false);
            }
            pos += expected.len() as u32;
        }
        Ok(true)
    }

    /// Checksum a region as it currently reads from the device.
    pub fn checksum<W: Watchdog + ?Sized>(
        &mut self,
        kind: ChecksumKind,
        region: &Region,
        watchdog: &mut W,
    ) -> Result<Checksum> {
        let mut hasher = Hasher::new(kind);
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut pos = region.start();
        while pos < region.end() {
            let todo = ((region.end() - pos) as usize).min(buffer.len());
            let buf = &mut buffer[..todo];
            self.nvm.read(pos, buf).map_err(|_| Error::HardwareFault)?;
            hasher.update(buf);
            pos += todo as u32;
            watchdog.service();
        }
        Ok(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::NoWatchdog;
    use simflash::styles::STM32F4;
    use simflash::SimFlash;

    fn config() -> Config {
        Config::new(STM32F4.application, STM32F4.protected()).nvm_poll_limit(10)
    }

    fn manager() -> FlashManager<SimFlash> {
        FlashManager::new(STM32F4.build().unwrap(), &config()).unwrap()
    }

    #[test]
    fn protection() {
        let m = manager();
        assert!(m.is_protected(0x0800_0000, 0x800));
        assert!(m.is_protected(0x0800_3fff, 2));
        assert!(!m.is_protected(0x0800_4000, 0x4000));
        assert!(!m.is_protected(0x0800_0000, 0));
        assert!(m.is_protected(0xffff_ff00, 0x200));

        // Protected wins over unaligned.
        assert_eq!(
            m.resolve(&Region::new(0x0800_0000, 0x800)),
            Err(Error::ProtectedRegion)
        );
        assert_eq!(
            m.resolve(&Region::new(0x0800_4000, 0x100)),
            Err(Error::UnalignedRegion)
        );
        assert_eq!(
            m.resolve(&Region::new(0x0800_4000, 0xc000)),
            Ok(SectorSpan { first: 0, last: 2 })
        );
    }

    #[test]
    fn erase_and_program() {
        let mut m = manager();
        let mut wdg = NoWatchdog;
        m.nvm_mut().install(0x0800_4000, &[0; 16]).unwrap();
        m.erase_sector(0, &mut wdg).unwrap();
        assert!(m.nvm().is_blank(0x0800_4000, 0x4000));

        m.program(0x0800_4000, &[1, 2, 3, 4, 5, 6, 7, 8], &mut wdg).unwrap();
        assert_eq!(m.verify(0x0800_4000, &[1, 2, 3, 4, 5, 6, 7, 8]), Ok(true));
        assert_eq!(m.verify(0x0800_4000, &[1, 2, 3, 4, 5, 6, 7, 9]), Ok(false));

        assert_eq!(
            m.program(0x0800_4012, &[0; 4], &mut wdg),
            Err(Error::Misaligned)
        );
        assert_eq!(
            m.program(0x0800_7ffc, &[0; 8], &mut wdg),
            Err(Error::OutOfBounds)
        );
        assert_eq!(
            m.program(0x0800_3ffc, &[0; 4], &mut wdg),
            Err(Error::ProtectedRegion)
        );
    }

    #[test]
    fn bad_erase_is_a_fault() {
        let mut m = manager();
        let mut wdg = NoWatchdog;
        m.nvm_mut().faults_mut().erase_leaves_residue_at = Some(0x0800_8000);
        assert_eq!(m.erase_sector(1, &mut wdg), Err(Error::HardwareFault));
        m.nvm_mut().faults_mut().erase_fails_at = Some(0x0800_c000);
        assert_eq!(m.erase_sector(2, &mut wdg), Err(Error::HardwareFault));
    }

    #[test]
    fn slow_device_times_out() {
        let flash = STM32F4.build().unwrap().with_latency(100);
        let mut m = FlashManager::new(flash, &config()).unwrap();
        let mut count = 0;
        let mut wdg = crate::watchdog::WatchdogHook(|| count += 1);
        assert_eq!(m.erase_sector(0, &mut wdg), Err(Error::HardwareFault));
        drop(wdg);
        assert_eq!(count, 10);
    }

    #[test]
    fn reads_anywhere_on_the_device() {
        let mut m = manager();
        m.nvm_mut().install(0x0800_0000, &[0xa5; 8]).unwrap();
        let mut buf = [0u8; 8];
        m.read(0x0800_0000, &mut buf).unwrap();
        assert_eq!(buf, [0xa5; 8]);
        assert_eq!(m.read(0x0900_0000, &mut buf), Err(Error::OutOfBounds));
    }

    /// Three byte writes cannot be reported to a host.
    struct OddDevice;

    impl storage::ReadNvm for OddDevice {
        fn read(&mut self, _address: u32, _bytes: &mut [u8]) -> storage::Result<()> {
            Ok(())
        }
    }

    impl NvmBackend for OddDevice {
        fn write_size(&self) -> usize {
            3
        }
        fn erase(&mut self, _address: u32, _length: u32) -> storage::Result<()> {
            Ok(())
        }
        fn write(&mut self, _address: u32, _bytes: &[u8]) -> storage::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn odd_write_size_refused() {
        assert!(matches!(
            FlashManager::new(OddDevice, &config()),
            Err(Error::Defect)
        ));
    }

    #[test]
    fn checksum_over_region() {
        let mut m = manager();
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        m.nvm_mut().install(0x0800_4000, &data).unwrap();
        let region = Region::new(0x0800_4000, 300);
        for kind in [ChecksumKind::Crc32, ChecksumKind::Sha256] {
            assert_eq!(
                m.checksum(kind, &region, &mut NoWatchdog),
                Ok(Checksum::of(kind, &data))
            );
        }
    }
}
