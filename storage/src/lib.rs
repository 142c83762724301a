//! Storage types.
//!
//! The update pipeline sees a single addressable flash device.  Reads may be
//! of any size, writes and erases have device specific granularity.  All
//! addresses handed to these traits are byte offsets from the start of the
//! device.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotWritten,
    NotErased,
    /// The underlying driver reported a failure.
    Io,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotAligned => "access not aligned",
            Error::OutOfBounds => "access out of bounds",
            Error::NotWritten => "area not written",
            Error::NotErased => "area not erased",
            Error::Io => "driver failure",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Read only interface into flash.
pub trait ReadFlash {
    /// What is the read size (alignment and size multiple).
    fn read_size(&self) -> usize;
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
    fn capacity(&self) -> usize;
}

/// Flash that can be written to.
pub trait Flash: ReadFlash {
    /// Write size (alignment and size multiple).
    fn write_size(&self) -> usize;
    /// Erase size (alignment and size multiple).
    fn erase_size(&self) -> usize;

    fn erase(&mut self, from: usize, to: usize) -> Result<()>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
}

impl<T: ReadFlash + ?Sized> ReadFlash for &mut T {
    fn read_size(&self) -> usize {
        (**self).read_size()
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        (**self).read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }
}

impl<T: Flash + ?Sized> Flash for &mut T {
    fn write_size(&self) -> usize {
        (**self).write_size()
    }

    fn erase_size(&self) -> usize {
        (**self).erase_size()
    }

    fn erase(&mut self, from: usize, to: usize) -> Result<()> {
        (**self).erase(from, to)
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        (**self).write(offset, bytes)
    }
}

/// A contiguous area of the flash device, such as a partition or a slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Region {
    pub addr: usize,
    pub size: usize,
}

impl Region {
    pub const fn new(addr: usize, size: usize) -> Region {
        Region { addr, size }
    }

    /// One past the last byte, or None if the region wraps the address space.
    pub fn end(&self) -> Option<usize> {
        self.addr.checked_add(self.size)
    }

    /// Does `[offset, offset + len)`, relative to this region, fit inside it.
    pub fn fits(&self, offset: usize, len: usize) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.size,
            None => false,
        }
    }

    /// Do the two regions share any byte.
    pub fn overlaps(&self, other: &Region) -> bool {
        if self.size == 0 || other.size == 0 {
            return false;
        }
        match (self.end(), other.end()) {
            (Some(a_end), Some(b_end)) => self.addr < b_end && other.addr < a_end,
            _ => true,
        }
    }

    /// Is the region aligned to `align` at both ends.
    pub fn is_aligned(&self, align: usize) -> bool {
        self.addr % align == 0 && self.size % align == 0
    }
}

/// Round `value` up to the next multiple of `align`.
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return None;
    }
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}

/// Erase the whole of `region`, which must be erase aligned.
pub fn erase_region<F: Flash + ?Sized>(flash: &mut F, region: &Region) -> Result<()> {
    let end = region.end().ok_or(Error::OutOfBounds)?;
    flash.erase(region.addr, end)
}

// Utilities taken from embedded-storage for validating arguments.
pub fn check_read<T: ReadFlash + ?Sized>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.read_size(), offset, length)
}

pub fn check_erase<T: Flash + ?Sized>(
    flash: &T,
    from: usize,
    to: usize,
) -> Result<()> {
    if from > to || to > flash.capacity() {
        return Err(Error::OutOfBounds);
    }
    if from % flash.erase_size() != 0 || to % flash.erase_size() != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_write<T: Flash + ?Sized>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.write_size(), offset, length)
}

pub fn check_slice<T: ReadFlash + ?Sized>(
    flash: &T,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length > flash.capacity() || offset > flash.capacity() - length {
        return Err(Error::OutOfBounds);
    }
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_fits() {
        let r = Region::new(0x1000, 0x100);
        assert!(r.fits(0, 0x100));
        assert!(r.fits(0xff, 1));
        assert!(!r.fits(0xff, 2));
        assert!(!r.fits(usize::MAX, 2));
    }

    #[test]
    fn region_overlap() {
        let a = Region::new(0x1000, 0x1000);
        assert!(a.overlaps(&Region::new(0x1fff, 1)));
        assert!(!a.overlaps(&Region::new(0x2000, 0x1000)));
        assert!(!a.overlaps(&Region::new(0x0, 0x1000)));
        assert!(!a.overlaps(&Region::new(0x1800, 0)));
    }

    #[test]
    fn align() {
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(1, 4096), Some(4096));
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(usize::MAX, 4096), None);
        assert_eq!(align_up(5, 0), None);
    }
}
