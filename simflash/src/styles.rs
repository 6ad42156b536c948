//! Flash styles
//!
//! Various microcontrollers have various types of flash memories available to
//! them.  Each layout here describes a whole device: the sectors the bootloader
//! itself lives in, followed by the sectors available to the application.

use anyhow::Result;
use storage::{Region, SectorDescriptor};

use crate::SimFlash;

/// The configuration of a single device.
pub struct DeviceLayout {
    pub name: &'static str,
    pub write_size: usize,
    /// Sectors holding the bootloader.  These come first.
    pub bootloader: &'static [SectorDescriptor],
    /// Sectors the bootloader may program.
    pub application: &'static [SectorDescriptor],
}

impl DeviceLayout {
    /// Build a blank device covering both the bootloader and the application
    /// sectors.
    pub fn build(&self) -> Result<SimFlash> {
        let all: Vec<SectorDescriptor> = self
            .bootloader
            .iter()
            .chain(self.application.iter())
            .copied()
            .collect();
        SimFlash::new(&all, self.write_size)
    }

    /// The region the bootloader occupies.
    pub fn protected(&self) -> Region {
        let first = &self.bootloader[0];
        let last = &self.bootloader[self.bootloader.len() - 1];
        Region::new(first.base, last.end() - first.base)
    }

    /// The whole application area.
    pub fn application_region(&self) -> Region {
        let first = &self.application[0];
        let last = &self.application[self.application.len() - 1];
        Region::new(first.base, last.end() - first.base)
    }
}

/// STM32F4-style.
/// These devices have a fairly small number of sectors, of mixed size.  The
/// bootloader takes the first 16k sector.
pub static STM32F4: DeviceLayout = DeviceLayout {
    name: "stm32f4",
    write_size: 4,
    bootloader: &[SectorDescriptor::new(0x0800_0000, 0x4000, 0)],
    application: &[
        SectorDescriptor::new(0x0800_4000, 0x4000, 1),
        SectorDescriptor::new(0x0800_8000, 0x4000, 2),
        SectorDescriptor::new(0x0800_c000, 0x4000, 3),
        SectorDescriptor::new(0x0801_0000, 0x1_0000, 4),
        SectorDescriptor::new(0x0802_0000, 0x2_0000, 5),
        SectorDescriptor::new(0x0804_0000, 0x2_0000, 6),
        SectorDescriptor::new(0x0806_0000, 0x2_0000, 7),
    ],
};

static STM32F1_BOOT: [SectorDescriptor; 3] = SectorDescriptor::uniform(0x0800_0000, 0x2000, 0);
static STM32F1_APP: [SectorDescriptor; 13] = SectorDescriptor::uniform(0x0800_6000, 0x2000, 3);

/// STM32F1-style.
/// Small 1k/2k pages grouped into 8k logical sectors, programmed a half word
/// at a time.  The bootloader takes three sectors.
pub static STM32F1: DeviceLayout = DeviceLayout {
    name: "stm32f1",
    write_size: 2,
    bootloader: &STM32F1_BOOT,
    application: &STM32F1_APP,
};

static K64_BOOT: [SectorDescriptor; 2] = SectorDescriptor::uniform(0, 4 * 1024, 0);
static K64_APP: [SectorDescriptor; 32] = SectorDescriptor::uniform(0x2000, 4 * 1024, 2);

/// K64-style.
/// These devices have small uniform sectors and an 8 byte phrase.
pub static K64: DeviceLayout = DeviceLayout {
    name: "k64",
    write_size: 8,
    bootloader: &K64_BOOT,
    application: &K64_APP,
};

static LPC_BOOT: [SectorDescriptor; 32] = SectorDescriptor::uniform(0, 512, 0);
static LPC_APP: [SectorDescriptor; 128] = SectorDescriptor::uniform(0x4000, 512, 32);

/// Page-style devices.  Based on the LPC55S69, where the write size equals the
/// erase size.
pub static LPC55: DeviceLayout = DeviceLayout {
    name: "lpc55",
    write_size: 512,
    bootloader: &LPC_BOOT,
    application: &LPC_APP,
};

/// All of the device layouts.
pub static ALL_LAYOUTS: [&DeviceLayout; 4] = [&STM32F4, &STM32F1, &K64, &LPC55];

/// An iterator that builds each of the devices on each iteration.
pub fn all_devices() -> impl Iterator<Item = Result<(&'static DeviceLayout, SimFlash)>> {
    ALL_LAYOUTS
        .iter()
        .map(|layout| -> Result<(&'static DeviceLayout, SimFlash)> {
            Ok((*layout, layout.build()?))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::SectorMap;

    #[test]
    fn layouts_are_consistent() {
        for device in all_devices() {
            let (layout, flash) = device.unwrap();
            assert!(SectorMap::new(layout.application).is_ok(), "{}", layout.name);
            assert!(!layout.protected().overlaps(&layout.application_region()));
            assert_eq!(flash.region().start(), layout.protected().start());
            assert_eq!(flash.region().end(), layout.application_region().end());
        }
    }
}
