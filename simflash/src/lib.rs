//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differ quite a bit in terms
//! of capabilities provided.  This simulator attempts to capture the diversity
//! of these devices.
//!
//! A device has a read size, a write size, and an erase size.  We require
//! that the erase size be a multiple of the write size (they can be the
//! same).  At this point in time, the read size is always 1.  Erased flash
//! reads as 0xff, and a write may only land on erased bytes, which catches
//! code that writes the same area twice without an erase in between.
//!
//! Power loss is simulated with [`SimFlash::fail_after`]: once the given
//! number of writes and erases have completed, every further one fails
//! without touching the contents.

use anyhow::{anyhow, Result};
use storage::{Flash, ReadFlash};

pub mod gen;
pub mod styles;

pub const ERASED: u8 = 0xff;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Stats {
    pub reads: usize,
    pub writes: usize,
    pub erases: usize,
    /// Bytes erased, summed over every erase.
    pub erased_bytes: usize,
}

pub struct SimFlash {
    read_size: usize,
    write_size: usize,
    erase_size: usize,
    data: Vec<u8>,
    /// Writes and erases left before the device starts failing.
    budget: Option<usize>,
    stats: Stats,
}

impl SimFlash {
    pub fn new(
        read_size: usize,
        write_size: usize,
        erase_size: usize,
        sectors: usize,
    ) -> Result<SimFlash> {
        if read_size != 1 {
            return Err(anyhow!("Unsupported read size: {}", read_size));
        }
        if write_size == 0 || !write_size.is_power_of_two() {
            return Err(anyhow!("Write size must be a power of two: {}", write_size));
        }
        if erase_size % write_size != 0 {
            return Err(anyhow!(
                "Erase size {} is not a multiple of write size {}",
                erase_size,
                write_size
            ));
        }
        Ok(SimFlash {
            read_size,
            write_size,
            erase_size,
            data: vec![ERASED; erase_size * sectors],
            budget: None,
            stats: Stats::default(),
        })
    }

    /// Program `data` at `offset` directly, as a factory programmer would.
    /// No alignment or erase requirements apply, and the statistics are not
    /// touched.
    pub fn install(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| anyhow!("Install of {} bytes at {:#x} out of range", data.len(), offset))?;
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// A view of the raw contents.
    pub fn contents(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Let `count` more writes or erases succeed, then fail every one.
    pub fn fail_after(&mut self, count: usize) {
        self.budget = Some(count);
    }

    /// Stop injecting failures.
    pub fn heal(&mut self) {
        self.budget = None;
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    fn spend(&mut self) -> storage::Result<()> {
        match self.budget.as_mut() {
            Some(0) => Err(storage::Error::Io),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        self.read_size
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        storage::check_read(self, offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        self.stats.reads += 1;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Flash for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn erase(&mut self, from: usize, to: usize) -> storage::Result<()> {
        storage::check_erase(self, from, to)?;
        self.spend()?;
        self.data[from..to].fill(ERASED);
        self.stats.erases += 1;
        self.stats.erased_bytes += to - from;
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        storage::check_write(self, offset, bytes.len())?;
        let area = &self.data[offset..offset + bytes.len()];
        if area.iter().any(|&b| b != ERASED) {
            return Err(storage::Error::NotErased);
        }
        self.spend()?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.stats.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nor_rules() {
        let mut flash = SimFlash::new(1, 4, 4096, 2).unwrap();
        assert_eq!(flash.capacity(), 8192);
        flash.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(flash.write(0, &[1, 2, 3, 4]), Err(storage::Error::NotErased));
        assert_eq!(flash.write(2, &[1, 2, 3, 4]), Err(storage::Error::NotAligned));
        assert_eq!(flash.write(8192, &[1, 2, 3, 4]), Err(storage::Error::OutOfBounds));
        assert_eq!(flash.erase(0, 100), Err(storage::Error::NotAligned));

        flash.erase(0, 4096).unwrap();
        let mut buf = [0u8; 4];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [ERASED; 4]);
        assert_eq!(flash.stats().erased_bytes, 4096);
    }

    #[test]
    fn injected_failure() {
        let mut flash = SimFlash::new(1, 1, 512, 4).unwrap();
        flash.fail_after(1);
        flash.write(0, b"ok").unwrap();
        assert_eq!(flash.write(2, b"no"), Err(storage::Error::Io));
        assert_eq!(flash.erase(0, 512), Err(storage::Error::Io));
        assert_eq!(flash.contents(0, 4), b"ok\xff\xff");
        flash.heal();
        flash.erase(0, 512).unwrap();
    }

    #[test]
    fn bad_geometry() {
        assert!(SimFlash::new(1, 3, 4096, 1).is_err());
        assert!(SimFlash::new(1, 256, 100, 1).is_err());
        assert!(SimFlash::new(2, 4, 4096, 1).is_err());
    }
}
