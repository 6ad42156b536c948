//! Backends for code memory.
//!
//! [`InternalFlash`] puts any embedded-storage `NorFlash` driver behind
//! [`NvmBackend`], translating between the driver's offsets and the addresses
//! the host uses.  [`NvmRouter`] sends one address window to an external
//! device (an SPI part, say) and everything else to internal flash, so that
//! the engine sees a single address space.

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use storage::{Error, NvmBackend, ReadNvm, Region, Result};

fn convert<E: NorFlashError>(e: E) -> Error {
    match e.kind() {
        NorFlashErrorKind::NotAligned => Error::NotAligned,
        NorFlashErrorKind::OutOfBounds => Error::OutOfBounds,
        _ => Error::Device,
    }
}

/// A `NorFlash` driver mapped at `base`.
pub struct InternalFlash<F> {
    flash: F,
    base: u32,
}

impl<F: NorFlash> InternalFlash<F> {
    /// Drivers that need aligned reads are not supported, as the engine reads
    /// back arbitrary runs of bytes.
    pub fn new(flash: F, base: u32) -> Result<InternalFlash<F>> {
        if F::READ_SIZE != 1 {
            return Err(Error::NotAligned);
        }
        Ok(InternalFlash { flash, base })
    }

    pub fn inner(&self) -> &F {
        &self.flash
    }

    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    fn offset(&self, address: u32, length: usize) -> Result<u32> {
        let off = address.checked_sub(self.base).ok_or(Error::OutOfBounds)?;
        let length = u32::try_from(length).map_err(|_| Error::OutOfBounds)?;
        match off.checked_add(length) {
            Some(end) if end as usize <= self.flash.capacity() => Ok(off),
            _ => Err(Error::OutOfBounds),
        }
    }
}

impl<F: NorFlash> ReadNvm for InternalFlash<F> {
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<()> {
        let off = self.offset(address, bytes.len())?;
        ReadNorFlash::read(&mut self.flash, off, bytes).map_err(convert)
    }
}

impl<F: NorFlash> NvmBackend for InternalFlash<F> {
    fn write_size(&self) -> usize {
        F::WRITE_SIZE
    }

    fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        let off = self.offset(address, length as usize)?;
        self.flash.erase(off, off + length).map_err(convert)
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        let off = self.offset(address, bytes.len())?;
        self.flash.write(off, bytes).map_err(convert)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Device {
    Internal,
    External,
}

/// Route an address window to an external device, with internal flash
/// handling the rest.
pub struct NvmRouter<E, I> {
    external: E,
    window: Region,
    internal: I,
    last: Device,
}

impl<E: NvmBackend, I: NvmBackend> NvmRouter<E, I> {
    /// Both devices must read back the same erased value.
    pub fn new(external: E, window: Region, internal: I) -> Result<NvmRouter<E, I>> {
        if external.erased_value() != internal.erased_value() {
            return Err(Error::Device);
        }
        Ok(NvmRouter {
            external,
            window,
            internal,
            last: Device::Internal,
        })
    }

    pub fn external(&self) -> &E {
        &self.external
    }

    pub fn internal(&self) -> &I {
        &self.internal
    }

    pub fn into_parts(self) -> (E, I) {
        (self.external, self.internal)
    }

    /// Requests may not straddle the edge of the window.
    fn route(&self, address: u32, length: usize) -> Result<Device> {
        let length = u32::try_from(length).map_err(|_| Error::OutOfBounds)?;
        let region = Region::checked(address, length).ok_or(Error::OutOfBounds)?;
        if self.window.contains_region(&region) {
            Ok(Device::External)
        } else if self.window.overlaps(&region) {
            Err(Error::OutOfBounds)
        } else {
            Ok(Device::Internal)
        }
    }
}

impl<E: NvmBackend, I: NvmBackend> ReadNvm for NvmRouter<E, I> {
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<()> {
        match self.route(address, bytes.len())? {
            Device::External => self.external.read(address, bytes),
            Device::Internal => self.internal.read(address, bytes),
        }
    }
}

impl<E: NvmBackend, I: NvmBackend> NvmBackend for NvmRouter<E, I> {
    fn init(&mut self) -> Result<()> {
        self.internal.init()?;
        self.external.init()
    }

    /// Both write sizes are powers of two, so the larger satisfies both.
    fn write_size(&self) -> usize {
        self.external.write_size().max(self.internal.write_size())
    }

    fn erased_value(&self) -> u8 {
        self.internal.erased_value()
    }

    fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        self.last = self.route(address, length as usize)?;
        match self.last {
            Device::External => self.external.erase(address, length),
            Device::Internal => self.internal.erase(address, length),
        }
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        self.last = self.route(address, bytes.len())?;
        match self.last {
            Device::External => self.external.write(address, bytes),
            Device::Internal => self.internal.write(address, bytes),
        }
    }

    fn is_operation_done(&mut self) -> Result<bool> {
        match self.last {
            Device::External => self.external.is_operation_done(),
            Device::Internal => self.internal.is_operation_done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflash::{NorSim, SimFlash};
    use storage::SectorDescriptor;

    #[test]
    fn internal_flash_addresses() {
        let nor = NorSim::<4, 1024>::new(4).unwrap();
        let mut f = InternalFlash::new(nor, 0x0800_0000).unwrap();
        f.erase(0x0800_0400, 0x400).unwrap();
        f.write(0x0800_0400, &[1, 2, 3, 4]).unwrap();
        let mut back = [0u8; 4];
        f.read(0x0800_0400, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);
        assert_eq!(f.inner().inner().stats().erases, vec![0x400]);

        assert_eq!(f.read(0x07ff_ffff, &mut back), Err(Error::OutOfBounds));
        assert_eq!(f.read(0x0800_0ffe, &mut back), Err(Error::OutOfBounds));
        assert_eq!(f.write(0x0800_0402, &[0; 4]), Err(Error::NotAligned));
    }

    #[test]
    fn router_splits_by_window() {
        let internal = SimFlash::new(&SectorDescriptor::uniform::<4>(0x0800_0000, 0x400, 0), 4)
            .unwrap();
        let external = SimFlash::new(&SectorDescriptor::uniform::<4>(0x9000_0000, 0x1000, 0), 8)
            .unwrap()
            .with_latency(3);
        let mut r = NvmRouter::new(external, Region::new(0x9000_0000, 0x4000), internal).unwrap();
        assert_eq!(r.write_size(), 8);

        r.erase(0x9000_1000, 0x1000).unwrap();
        assert_eq!(r.is_operation_done(), Ok(false));
        assert_eq!(r.is_operation_done(), Ok(false));
        assert_eq!(r.is_operation_done(), Ok(true));

        r.write(0x0800_0000, &[7; 8]).unwrap();
        assert_eq!(r.is_operation_done(), Ok(true));

        assert_eq!(r.read(0x8fff_fffc, &mut [0; 8]), Err(Error::OutOfBounds));
        let (external, internal) = r.into_parts();
        assert_eq!(external.stats().erases, vec![0x9000_1000]);
        assert_eq!(internal.contents(0x0800_0000, 8), &[7; 8]);
    }
}
