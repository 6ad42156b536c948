//! A simulated device behind the embedded-storage NOR traits.
//!
//! The NorFlash traits describe a device by constant READ_SIZE, WRITE_SIZE and
//! ERASE_SIZE, with offsets from the start of the device.  This only fits
//! uniform parts, so [`NorSim`] is always built from equally sized sectors
//! starting at offset zero.

use embedded_storage::nor_flash::{
    self, ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use storage::{NvmBackend, ReadNvm, SectorDescriptor};

use crate::SimFlash;

/// The richer error type used in the simulator.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SimError {
    Inner(NorFlashErrorKind),
    Storage(storage::Error),
}

impl From<NorFlashErrorKind> for SimError {
    fn from(inner: NorFlashErrorKind) -> Self {
        SimError::Inner(inner)
    }
}

impl From<storage::Error> for SimError {
    fn from(e: storage::Error) -> Self {
        SimError::Storage(e)
    }
}

impl NorFlashError for SimError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            SimError::Inner(inner) => *inner,
            SimError::Storage(storage::Error::NotAligned) => NorFlashErrorKind::NotAligned,
            SimError::Storage(storage::Error::OutOfBounds) => NorFlashErrorKind::OutOfBounds,
            SimError::Storage(_) => NorFlashErrorKind::Other,
        }
    }
}

type Result<T> = core::result::Result<T, SimError>;

pub struct NorSim<const WRITE_SIZE: usize, const ERASE_SIZE: usize> {
    inner: SimFlash,
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> NorSim<WRITE_SIZE, ERASE_SIZE> {
    pub fn new(sectors: usize) -> anyhow::Result<Self> {
        let table: Vec<SectorDescriptor> = (0..sectors)
            .map(|i| SectorDescriptor::new((i * ERASE_SIZE) as u32, ERASE_SIZE as u32, i as u16))
            .collect();
        Ok(NorSim {
            inner: SimFlash::new(&table, WRITE_SIZE)?,
        })
    }

    pub fn inner(&self) -> &SimFlash {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SimFlash {
        &mut self.inner
    }
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> ErrorType for NorSim<WRITE_SIZE, ERASE_SIZE> {
    type Error = SimError;
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> ReadNorFlash for NorSim<WRITE_SIZE, ERASE_SIZE> {
    const READ_SIZE: usize = 1;
    fn capacity(&self) -> usize {
        self.inner.region().len() as usize
    }
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<()> {
        nor_flash::check_read(self, offset, bytes.len())?;
        Ok(self.inner.read(offset, bytes)?)
    }
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> NorFlash for NorSim<WRITE_SIZE, ERASE_SIZE> {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = ERASE_SIZE;
    fn erase(&mut self, from: u32, to: u32) -> Result<()> {
        nor_flash::check_erase(self, from, to)?;
        Ok(self.inner.erase(from, to - from)?)
    }
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        nor_flash::check_write(self, offset, bytes.len())?;
        Ok(self.inner.write(offset, bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nor_traits() {
        let mut f = NorSim::<4, 1024>::new(8).unwrap();
        assert_eq!(f.capacity(), 8 * 1024);
        NorFlash::erase(&mut f, 1024, 3072).unwrap();
        NorFlash::write(&mut f, 1024, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        ReadNorFlash::read(&mut f, 1024, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(
            NorFlash::write(&mut f, 1026, &[0; 4]).unwrap_err().kind(),
            NorFlashErrorKind::NotAligned
        );
        assert_eq!(
            NorFlash::erase(&mut f, 0, 100).unwrap_err().kind(),
            NorFlashErrorKind::NotAligned
        );
        assert_eq!(f.inner().stats().erases, vec![1024, 2048]);
    }
}
