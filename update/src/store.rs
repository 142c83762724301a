//! Storage stage
//!
//! The last stage of the chain, writing the reconstructed image into the
//! destination slot.  Flushes arrive with arbitrary lengths, so bytes that do
//! not fill a whole write unit are held back until the next flush, and the
//! final partial unit is padded with the erased value on `finish`.

use heapless::Vec;
use storage::Flash;

use crate::config::sizes;
use crate::engine::{Context, Engine, EngineDescriptor, EngineKind};
use crate::{Error, Result};

/// Value of erased NOR flash, used to pad the last write.
pub const ERASED: u8 = 0xff;

pub enum Store {
    Flash(FlashStore),
}

impl Store {
    pub fn new(engine: &EngineDescriptor) -> Result<Store> {
        match engine.kind {
            EngineKind::Flash => Ok(Store::Flash(FlashStore::new())),
            _ => Err(Error::EngineNotSupported {
                stage: crate::Stage::Storage,
                tag: engine.tag,
            }),
        }
    }
}

impl<F: Flash> Engine<F> for Store {
    fn init(&mut self, ctx: &Context<'_, F>) -> Result<()> {
        match self {
            Store::Flash(s) => s.init(ctx),
        }
    }

    fn input(&mut self, ctx: &mut Context<'_, F>, buf: &[u8]) -> Result<usize> {
        match self {
            Store::Flash(s) => s.input(ctx, buf),
        }
    }

    fn finish(&mut self, ctx: &mut Context<'_, F>) -> Result<()> {
        match self {
            Store::Flash(s) => s.finish(ctx),
        }
    }
}

/// Writes sequentially from the start of the destination window.  The
/// window's cursor counts bytes accepted, including those still held back.
pub struct FlashStore {
    write_size: usize,
    pending: Vec<u8, { sizes::MAX_WRITE_SIZE }>,
}

impl FlashStore {
    pub fn new() -> FlashStore {
        FlashStore {
            write_size: 1,
            pending: Vec::new(),
        }
    }

    fn init<F: Flash>(&mut self, ctx: &Context<'_, F>) -> Result<()> {
        let write_size = ctx.flash.write_size();
        if write_size == 0 || write_size > sizes::MAX_WRITE_SIZE {
            log::error!("flash write size {} not supported", write_size);
            return Err(Error::InvalidLayout);
        }
        if ctx.config.dst.addr % write_size != 0 {
            log::error!("slot {:#x} not write aligned", ctx.config.dst.addr);
            return Err(Error::InvalidLayout);
        }
        self.write_size = write_size;
        self.pending.clear();
        Ok(())
    }

    fn input<F: Flash>(&mut self, ctx: &mut Context<'_, F>, buf: &[u8]) -> Result<usize> {
        let dst = ctx.config.dst;
        if buf.len() > dst.remaining() {
            log::warn!(
                "store: {} bytes at {:#x} overflow slot of {}, dropped",
                buf.len(),
                dst.offset,
                dst.size
            );
            return Ok(buf.len());
        }

        // Flash address of the first byte still held back.
        let mut addr = dst.addr + dst.offset - self.pending.len();
        let mut data = buf;

        if !self.pending.is_empty() {
            let take = (self.write_size - self.pending.len()).min(data.len());
            extend(&mut self.pending, &data[..take])?;
            data = &data[take..];
            if self.pending.len() == self.write_size {
                ctx.flash.write(addr, &self.pending)?;
                addr += self.write_size;
                self.pending.clear();
            }
        }

        let whole = data.len() - data.len() % self.write_size;
        if whole > 0 {
            ctx.flash.write(addr, &data[..whole])?;
            data = &data[whole..];
        }
        extend(&mut self.pending, data)?;

        ctx.config.dst.offset += buf.len();
        Ok(buf.len())
    }

    fn finish<F: Flash>(&mut self, ctx: &mut Context<'_, F>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let addr = ctx.config.dst.addr + ctx.config.dst.offset - self.pending.len();
        while self.pending.len() < self.write_size {
            extend(&mut self.pending, &[ERASED])?;
        }
        ctx.flash.write(addr, &self.pending)?;
        self.pending.clear();
        log::debug!("store: wrote {} bytes", ctx.config.dst.offset);
        Ok(())
    }
}

impl Default for FlashStore {
    fn default() -> Self {
        FlashStore::new()
    }
}

// The held back bytes never exceed one write unit.
fn extend(pending: &mut Vec<u8, { sizes::MAX_WRITE_SIZE }>, data: &[u8]) -> Result<()> {
    pending
        .extend_from_slice(data)
        .map_err(|_| Error::InvalidLayout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateConfig;
    use crate::header::{self, UpdateHeader};
    use crate::Region;
    use simflash::SimFlash;

    fn header() -> UpdateHeader {
        UpdateHeader::parse(&header::tests::encode(1, 0, 0, b"", None)).unwrap()
    }

    fn store_in(flash: &mut SimFlash, dst: Region, flushes: &[&[u8]]) -> Result<usize> {
        let mut dog = ();
        let config = UpdateConfig::new(Region::new(0, 0), dst, None);
        let mut ctx = Context::new(flash, &mut dog, config, header());
        let mut store = Store::Flash(FlashStore::new());
        store.init(&ctx)?;
        for buf in flushes {
            assert_eq!(store.input(&mut ctx, buf)?, buf.len());
        }
        store.finish(&mut ctx)?;
        Ok(ctx.config.dst.offset)
    }

    #[test]
    fn odd_flushes() {
        let data: std::vec::Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        for write_size in [1, 4, 16, 256] {
            let mut flash = SimFlash::new(1, write_size, 4096, 4).unwrap();
            let dst = Region::new(4096, 8192);
            let flushes = [&data[..3], &data[3..300], &data[300..301], &data[301..]];
            assert_eq!(store_in(&mut flash, dst, &flushes), Ok(1000));
            let written = flash.contents(dst.addr, dst.size);
            assert_eq!(&written[..1000], &data[..]);
            assert!(written[1000..].iter().all(|&b| b == ERASED));
        }
    }

    #[test]
    fn overflow_is_dropped() {
        let mut flash = SimFlash::new(1, 4, 4096, 2).unwrap();
        let dst = Region::new(0, 4096);
        let big = [0x11u8; 4000];
        let past = [0x22u8; 200];
        // The second flush does not fit and is discarded whole.
        assert_eq!(store_in(&mut flash, dst, &[&big, &past]), Ok(4000));
        let written = flash.contents(0, 4096);
        assert!(written[..4000].iter().all(|&b| b == 0x11));
        assert!(written[4000..].iter().all(|&b| b == ERASED));
    }

    #[test]
    fn unaligned_slot() {
        let mut flash = SimFlash::new(1, 16, 4096, 2).unwrap();
        assert_eq!(
            store_in(&mut flash, Region::new(8, 1024), &[b"abc"]),
            Err(Error::InvalidLayout)
        );
    }
}
