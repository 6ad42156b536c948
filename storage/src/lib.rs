//! Storage types.
//!
//! Code memory is described by an ordered table of [`SectorDescriptor`]s and
//! reached through the [`NvmBackend`] trait.  The trait is address based rather
//! than offset based: the bootloader works in terms of the addresses the host
//! sends, and a backend decides how those map onto its device.  Internal flash,
//! an off-chip SPI part, or a simulator all look the same from above.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod sector;

pub use sector::{Region, SectorDescriptor, SectorMap, SectorSpan};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotErased,
    /// The device reported a failure while erasing or programming.
    Device,
    /// An earlier operation has not completed yet.
    Busy,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Read only interface into non-volatile memory.
pub trait ReadNvm {
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<()>;
}

/// Non-volatile memory that can be erased and programmed.
///
/// Erase and write may return before the device has finished.  Callers poll
/// [`NvmBackend::is_operation_done`] until it reports completion before
/// starting anything else on the same device.  Blocking devices simply
/// report done immediately.
pub trait NvmBackend: ReadNvm {
    /// Bring the device up.  Called once before the first erase or write.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write size (alignment and size multiple).
    fn write_size(&self) -> usize;

    /// The value every byte reads back as after an erase.
    fn erased_value(&self) -> u8 {
        0xff
    }

    fn erase(&mut self, address: u32, length: u32) -> Result<()>;
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<()>;

    /// Returns `Ok(true)` once the last erase or write has finished, or the
    /// error the device reported for it.
    fn is_operation_done(&mut self) -> Result<bool> {
        Ok(true)
    }
}

impl<T: ReadNvm + ?Sized> ReadNvm for &mut T {
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<()> {
        (**self).read(address, bytes)
    }
}

impl<T: NvmBackend + ?Sized> NvmBackend for &mut T {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }
    fn write_size(&self) -> usize {
        (**self).write_size()
    }
    fn erased_value(&self) -> u8 {
        (**self).erased_value()
    }
    fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        (**self).erase(address, length)
    }
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        (**self).write(address, bytes)
    }
    fn is_operation_done(&mut self) -> Result<bool> {
        (**self).is_operation_done()
    }
}

// Argument checks, in the spirit of the ones in embedded-storage.
pub fn check_write<T: NvmBackend + ?Sized>(
    nvm: &T,
    address: u32,
    length: usize,
) -> Result<()> {
    check_slice(nvm.write_size(), address, length)
}

pub fn check_slice(align: usize, address: u32, length: usize) -> Result<()> {
    let length = u32::try_from(length).map_err(|_| Error::OutOfBounds)?;
    if address.checked_add(length).is_none() {
        return Err(Error::OutOfBounds);
    }
    let align = align as u32;
    if align == 0 || address % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_alignment() {
        assert_eq!(check_slice(8, 0x0800_4000, 64), Ok(()));
        assert_eq!(check_slice(8, 0x0800_4004, 64), Err(Error::NotAligned));
        assert_eq!(check_slice(8, 0x0800_4000, 63), Err(Error::NotAligned));
        assert_eq!(check_slice(8, 0xffff_fff8, 16), Err(Error::OutOfBounds));
        // Byte programmable devices take anything.
        assert_eq!(check_slice(1, 0x0800_4003, 5), Ok(()));
    }
}
