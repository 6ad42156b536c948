//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differ quite a bit in terms
//! of capabilities provided.  This simulator attempts to capture the diversity
//! of these devices, and to fail in the ways that real parts fail, so that the
//! bootloader can be driven through its error paths on a host.
//!
//! A [`SimFlash`] is described by a sector table, which need not be uniform
//! (the STM32F4 family mixes 16k, 64k and 128k sectors), and a write size.
//! The usual NOR rules are enforced:
//!
//! - Erase works on whole sectors and sets every byte to 0xff.
//! - Writes must be aligned to, and a multiple of, the write size.
//! - A byte can only be programmed once after an erase.  Programming a byte
//!   that is not blank is an error rather than the silent AND that some parts
//!   perform, as the bootloader is never supposed to do it.
//!
//! The device can also be made slow.  With a latency set, erases and writes
//! only report completion after being polled a number of times, which is how
//! an off-chip part behind the NVM hooks behaves.
//!
//! [`NorSim`] wraps a uniform device behind the embedded-storage `NorFlash`
//! traits, for exercising code written against those.

use anyhow::{anyhow, bail, Result};
use storage::{Error, NvmBackend, ReadNvm, Region, SectorDescriptor, SectorMap};

pub mod gen;
pub mod nor;
pub mod styles;

pub use nor::NorSim;

/// Faults to inject.  Each is keyed by an address, and stays armed until
/// cleared.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Erasing the sector starting at this address reports a device error.
    pub erase_fails_at: Option<u32>,
    /// Erasing the sector starting at this address claims success, but leaves
    /// a programmed byte behind.
    pub erase_leaves_residue_at: Option<u32>,
    /// A write covering this address reports a device error.
    pub write_fails_at: Option<u32>,
    /// A write covering this address claims success, but stores a flipped bit.
    pub write_corrupts_at: Option<u32>,
}

/// Record of what has been done to the device.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Base address of every sector erased, in order.
    pub erases: Vec<u32>,
    pub writes: usize,
    pub bytes_written: usize,
}

pub struct SimFlash {
    base: u32,
    data: Vec<u8>,
    sectors: Vec<SectorDescriptor>,
    write_size: usize,
    latency: u32,
    pending: u32,
    initialized: bool,
    faults: Faults,
    stats: Stats,
}

impl SimFlash {
    /// Build a blank device.  The sector table must be contiguous.
    pub fn new(sectors: &[SectorDescriptor], write_size: usize) -> Result<SimFlash> {
        if sectors.is_empty() {
            bail!("no sectors");
        }
        SectorMap::new(sectors).map_err(|e| anyhow!("bad sector table: {:?}", e))?;
        for pair in sectors.windows(2) {
            if pair[0].end() != pair[1].base {
                bail!("gap in sector table at 0x{:x}", pair[0].end());
            }
        }
        if write_size == 0 || !write_size.is_power_of_two() {
            bail!("write size {} is not a power of two", write_size);
        }
        if let Some(s) = sectors.iter().find(|s| s.size as usize % write_size != 0) {
            bail!("sector at 0x{:x} is not a multiple of the write size", s.base);
        }

        let base = sectors[0].base;
        let len = (sectors[sectors.len() - 1].end() - base) as usize;

        Ok(SimFlash {
            base,
            data: vec![0xff; len],
            sectors: sectors.to_vec(),
            write_size,
            latency: 0,
            pending: 0,
            initialized: false,
            faults: Faults::default(),
            stats: Stats::default(),
        })
    }

    /// Make erases and writes take `polls` calls to `is_operation_done`
    /// before completing.
    pub fn with_latency(mut self, polls: u32) -> SimFlash {
        self.latency = polls;
        self
    }

    pub fn region(&self) -> Region {
        Region::new(self.base, self.data.len() as u32)
    }

    pub fn sectors(&self) -> &[SectorDescriptor] {
        &self.sectors
    }

    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Place data directly into the device, the way a debug probe would.  The
    /// NOR rules do not apply, and nothing is counted.
    pub fn install(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let off = self
            .offset(address, data.len())
            .map_err(|e| anyhow!("install at 0x{:x}: {:?}", address, e))?;
        self.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// View the current contents.  Panics when out of range, this is for
    /// tests to look at.
    pub fn contents(&self, address: u32, len: usize) -> &[u8] {
        let off = self.offset(address, len).expect("contents out of range");
        &self.data[off..off + len]
    }

    pub fn is_blank(&self, address: u32, len: usize) -> bool {
        self.contents(address, len).iter().all(|&b| b == 0xff)
    }

    fn offset(&self, address: u32, len: usize) -> storage::Result<usize> {
        let off = address.checked_sub(self.base).ok_or(Error::OutOfBounds)? as usize;
        if len > self.data.len() || off > self.data.len() - len {
            return Err(Error::OutOfBounds);
        }
        Ok(off)
    }

    fn start_operation(&mut self) -> storage::Result<()> {
        if self.pending > 0 {
            return Err(Error::Busy);
        }
        self.pending = self.latency;
        Ok(())
    }
}

impl ReadNvm for SimFlash {
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> storage::Result<()> {
        let off = self.offset(address, bytes.len())?;
        bytes.copy_from_slice(&self.data[off..off + bytes.len()]);
        Ok(())
    }
}

impl NvmBackend for SimFlash {
    fn init(&mut self) -> storage::Result<()> {
        // Coming up after a reset: nothing is in flight.
        self.pending = 0;
        self.initialized = true;
        Ok(())
    }

    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase(&mut self, address: u32, length: u32) -> storage::Result<()> {
        let region = Region::checked(address, length).ok_or(Error::OutOfBounds)?;
        let map = SectorMap::new(&self.sectors)?;
        let span = map.resolve(&region)?;
        if self.pending > 0 {
            return Err(Error::Busy);
        }

        for pos in span.positions() {
            let sector = self.sectors[pos];
            if self.faults.erase_fails_at == Some(sector.base) {
                return Err(Error::Device);
            }
            let off = (sector.base - self.base) as usize;
            self.data[off..off + sector.size as usize].fill(0xff);
            if self.faults.erase_leaves_residue_at == Some(sector.base) {
                self.data[off + sector.size as usize / 2] = 0x5a;
            }
            self.stats.erases.push(sector.base);
        }
        self.start_operation()
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> storage::Result<()> {
        storage::check_write(&*self, address, bytes.len())?;
        let off = self.offset(address, bytes.len())?;
        if self.pending > 0 {
            return Err(Error::Busy);
        }
        if self.data[off..off + bytes.len()].iter().any(|&b| b != 0xff) {
            return Err(Error::NotErased);
        }
        let covers = |a: Option<u32>| match a {
            Some(a) => a >= address && ((a - address) as usize) < bytes.len(),
            None => false,
        };
        if covers(self.faults.write_fails_at) {
            return Err(Error::Device);
        }

        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        if let Some(bad) = self.faults.write_corrupts_at.filter(|&a| covers(Some(a))) {
            self.data[(bad - self.base) as usize] ^= 0x01;
        }
        self.stats.writes += 1;
        self.stats.bytes_written += bytes.len();
        self.start_operation()
    }

    fn is_operation_done(&mut self) -> storage::Result<bool> {
        if self.pending > 0 {
            self.pending -= 1;
        }
        Ok(self.pending == 0)
    }
}
