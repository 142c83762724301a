//! Flash styles
//!
//! Various microcontrollers have various types of flash memories available to
//! them.  Each style here is a single device large enough to hold a complete
//! OTA layout: an update partition, the OTA log, and a few application slots.

use crate::Result;
use crate::SimFlash;

/// Total size of every simulated device.
pub const CAPACITY: usize = 1024 * 1024;

/// The geometry of a single flash device.
pub struct AreaLayout {
    pub name: &'static str,
    pub read_size: usize,
    pub write_size: usize,
    pub erase_size: usize,
    pub sectors: usize,
}

impl AreaLayout {
    pub fn build(&self) -> Result<SimFlash> {
        SimFlash::new(
            self.read_size,
            self.write_size,
            self.erase_size,
            self.sectors,
        )
    }
}

/// ESP32-style SPI NOR.  Small uniform sectors, word writes.
pub static ESP32: AreaLayout = AreaLayout {
    name: "esp32",
    read_size: 1,
    write_size: 4,
    erase_size: 4 * 1024,
    sectors: CAPACITY / (4 * 1024),
};

/// Byte writable SPI NOR.
pub static BYTE: AreaLayout = AreaLayout {
    name: "byte",
    read_size: 1,
    write_size: 1,
    erase_size: 4 * 1024,
    sectors: CAPACITY / (4 * 1024),
};

/// External flash with a large write alignment.
pub static EXT: AreaLayout = AreaLayout {
    name: "ext",
    read_size: 1,
    write_size: 256,
    erase_size: 4 * 1024,
    sectors: CAPACITY / (4 * 1024),
};

/// Page-style devices.  Based on the LPC55S69.
pub static LPC: AreaLayout = AreaLayout {
    name: "lpc",
    read_size: 1,
    write_size: 512,
    erase_size: 512,
    sectors: CAPACITY / 512,
};

/// Large sectors with a large write, based on the STM32H745.  This tends to
/// stress the extreme in terms of sector size, as every partition is a
/// single sector.
pub static STM32H: AreaLayout = AreaLayout {
    name: "stm32h",
    read_size: 1,
    write_size: 32,
    erase_size: 128 * 1024,
    sectors: CAPACITY / (128 * 1024),
};

/// All of the flash devices.
pub static ALL_FLASHES: [&AreaLayout; 5] = [&ESP32, &BYTE, &EXT, &LPC, &STM32H];

/// An iterator that builds each of the devices in turn.
pub fn all_flashes() -> impl Iterator<Item = Result<(&'static str, SimFlash)>> {
    ALL_FLASHES
        .iter()
        .map(|style| style.build().map(|flash| (style.name, flash)))
}
