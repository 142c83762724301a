//! Update configuration.
//!
//! Build time tunables live in [`sizes`].  The flash layout and policy are
//! supplied by the board, and [`UpdateConfig`] is the addressing state of a
//! single update attempt.

use storage::Region;

pub mod sizes {
    /// Bytes pulled from the update partition per source read.  The watchdog
    /// is fed once per read.
    pub const SOURCE_CHUNK: usize = 4 * 1024;

    /// Chunk used to digest the payload and CRC the base image.
    pub const DIGEST_CHUNK: usize = 4 * 1024;

    /// Working buffer of the ddelta engine.  Diff bytes are combined with
    /// the base image this many at a time.
    pub const DELTA_BLOCK: usize = 1024;

    /// Largest flash write granularity the store engine can buffer for.
    pub const MAX_WRITE_SIZE: usize = 512;

    /// Maximum number of OTA slots in a layout.
    pub const MAX_SLOTS: usize = 16;

    /// Memory the xz decoder may allocate.  Covers streams packed with a
    /// dictionary of up to 64 KiB, as the packaging tool produces.
    pub const XZ_MEMLIMIT: u64 = 256 * 1024;

    pub type SlotVec<T> = heapless::Vec<T, MAX_SLOTS>;
}

/// Board policy, normally fixed by the build.
#[derive(Debug, Clone, Copy, Default)]
pub struct Policy {
    /// Refuse updates whose signature cannot be verified.
    pub require_signature: bool,
    /// Mark freshly written images as `New` so the application must confirm
    /// them, instead of `Undefined`.
    pub rollback: bool,
}

/// Where things live in flash.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    /// The partition holding a pending update (header + payload).
    pub update: Region,
    /// Two erase sectors holding the redundant OTA log.
    pub otadata: Region,
    pub factory: Option<Region>,
    pub test: Option<Region>,
    /// The OTA application slots, in index order.
    pub slots: sizes::SlotVec<Region>,
}

impl Layout {
    pub fn new(update: Region, otadata: Region) -> Layout {
        Layout {
            update,
            otadata,
            factory: None,
            test: None,
            slots: sizes::SlotVec::new(),
        }
    }

    pub fn factory(mut self, region: Region) -> Self {
        self.factory = Some(region);
        self
    }

    pub fn test(mut self, region: Region) -> Self {
        self.test = Some(region);
        self
    }

    /// Add an OTA slot.  Slots beyond `MAX_SLOTS` are ignored.
    pub fn slot(mut self, region: Region) -> Self {
        if self.slots.push(region).is_err() {
            log::warn!("layout: too many slots, ignoring {:#x}", region.addr);
        }
        self
    }
}

/// A region together with a cursor into it.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Window {
    pub addr: usize,
    pub size: usize,
    pub offset: usize,
}

impl Window {
    pub fn new(region: Region) -> Window {
        Window {
            addr: region.addr,
            size: region.size,
            offset: 0,
        }
    }

    pub fn region(&self) -> Region {
        Region::new(self.addr, self.size)
    }

    /// Bytes left between the cursor and the end of the window.
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.offset)
    }
}

/// Addressing for one update attempt, built fresh each time with every
/// cursor at zero.  Stages move the cursors as they consume and produce
/// bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateConfig {
    /// The update partition.  The cursor counts payload bytes read.
    pub src: Window,
    /// The slot being written.
    pub dst: Window,
    /// The running image, used as the base when a diff is applied.
    pub base: Option<Window>,
}

impl UpdateConfig {
    pub fn new(src: Region, dst: Region, base: Option<Region>) -> UpdateConfig {
        UpdateConfig {
            src: Window::new(src),
            dst: Window::new(dst),
            base: base.map(Window::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_builder() {
        let layout = Layout::new(Region::new(0x1000, 0x1000), Region::new(0x2000, 0x2000))
            .factory(Region::new(0x10000, 0x10000))
            .slot(Region::new(0x20000, 0x10000))
            .slot(Region::new(0x30000, 0x10000));
        assert_eq!(layout.slots.len(), 2);
        assert_eq!(layout.slots[1].addr, 0x30000);
        assert!(layout.test.is_none());
    }

    #[test]
    fn window_cursor() {
        let mut config = UpdateConfig::new(
            Region::new(0, 0x100),
            Region::new(0x100, 0x100),
            Some(Region::new(0x200, 0x100)),
        );
        assert_eq!(config.dst.remaining(), 0x100);
        config.dst.offset = 0xf0;
        assert_eq!(config.dst.remaining(), 0x10);
        config.dst.offset = 0x110;
        assert_eq!(config.dst.remaining(), 0);
        assert_eq!(config.base.unwrap().region(), Region::new(0x200, 0x100));
    }
}
