//! Pipeline engines
//!
//! An update flows through three stages: decompression, diff and storage.
//! Each stage has a small table of interchangeable engines, selected by the
//! type tags in the update header.  Lookup is an exact match on the tag; an
//! unknown tag fails the whole update before anything is erased.

use storage::Flash;

use crate::config::UpdateConfig;
use crate::header::{self, UpdateHeader};
use crate::{Error, Fault, Result, Watchdog};

/// Only one storage engine exists, it is not selected by the header.
pub const STORAGE_FLASH: u8 = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    Decompress,
    Diff,
    Storage,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EngineKind {
    NoneCompress,
    #[cfg(feature = "xz")]
    Xz,
    NoneDiff,
    #[cfg(feature = "ddelta")]
    DDelta,
    Flash,
}

impl EngineKind {
    /// The stage this engine can be used in.
    pub fn stage(&self) -> Stage {
        match self {
            EngineKind::NoneCompress => Stage::Decompress,
            #[cfg(feature = "xz")]
            EngineKind::Xz => Stage::Decompress,
            EngineKind::NoneDiff => Stage::Diff,
            #[cfg(feature = "ddelta")]
            EngineKind::DDelta => Stage::Diff,
            EngineKind::Flash => Stage::Storage,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EngineDescriptor {
    pub tag: u8,
    pub kind: EngineKind,
    pub name: &'static str,
}

static DECOMPRESSORS: &[EngineDescriptor] = &[
    EngineDescriptor {
        tag: header::COMPRESS_NONE,
        kind: EngineKind::NoneCompress,
        name: "none",
    },
    #[cfg(feature = "xz")]
    EngineDescriptor {
        tag: header::COMPRESS_XZ,
        kind: EngineKind::Xz,
        name: "xz",
    },
];

static DIFFERS: &[EngineDescriptor] = &[
    EngineDescriptor {
        tag: header::DIFF_NONE,
        kind: EngineKind::NoneDiff,
        name: "none",
    },
    #[cfg(feature = "ddelta")]
    EngineDescriptor {
        tag: header::DIFF_DDELTA,
        kind: EngineKind::DDelta,
        name: "ddelta",
    },
];

static STORES: &[EngineDescriptor] = &[EngineDescriptor {
    tag: STORAGE_FLASH,
    kind: EngineKind::Flash,
    name: "flash",
}];

/// The engine tables, one per stage.
#[derive(Debug, Clone, Copy)]
pub struct Registry {
    decompress: &'static [EngineDescriptor],
    diff: &'static [EngineDescriptor],
    storage: &'static [EngineDescriptor],
}

impl Registry {
    /// Every engine enabled in this build.
    pub const fn builtin() -> Registry {
        Registry {
            decompress: DECOMPRESSORS,
            diff: DIFFERS,
            storage: STORES,
        }
    }

    pub const fn new(
        decompress: &'static [EngineDescriptor],
        diff: &'static [EngineDescriptor],
        storage: &'static [EngineDescriptor],
    ) -> Registry {
        Registry { decompress, diff, storage }
    }

    pub fn engines(&self, stage: Stage) -> &'static [EngineDescriptor] {
        match stage {
            Stage::Decompress => self.decompress,
            Stage::Diff => self.diff,
            Stage::Storage => self.storage,
        }
    }

    /// Find the engine registered for `tag` in `stage`.
    pub fn resolve(&self, stage: Stage, tag: u8) -> Result<&'static EngineDescriptor> {
        self.engines(stage)
            .iter()
            .find(|e| e.tag == tag && e.kind.stage() == stage)
            .ok_or_else(|| {
                log::warn!("no {:?} engine for type {}", stage, tag);
                Error::EngineNotSupported { stage, tag }
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::builtin()
    }
}

/// State shared by every stage of one update attempt.  Passed by reference
/// through each call, so stages never hold on to it.
pub struct Context<'a, F> {
    pub flash: &'a mut F,
    pub watchdog: &'a mut dyn Watchdog,
    pub config: UpdateConfig,
    pub header: UpdateHeader,
}

impl<'a, F: Flash> Context<'a, F> {
    pub fn new(
        flash: &'a mut F,
        watchdog: &'a mut dyn Watchdog,
        config: UpdateConfig,
        header: UpdateHeader,
    ) -> Context<'a, F> {
        Context {
            flash,
            watchdog,
            config,
            header,
        }
    }

    /// Pull the next payload bytes from the update partition into `buf`.
    /// Returns the number of bytes read, zero once the payload is exhausted.
    /// The watchdog is fed on every call.
    pub fn read_source(&mut self, buf: &mut [u8]) -> Result<usize> {
        let total = self.header.length as usize;
        let len = total.saturating_sub(self.config.src.offset).min(buf.len());
        if len > 0 {
            let addr = self.config.src.addr + self.header.size() + self.config.src.offset;
            log::debug!("read source {:#x}, len {}", addr, len);
            self.flash.read(addr, &mut buf[..len])?;
            self.config.src.offset += len;
        }
        self.watchdog.feed();
        Ok(len)
    }

    /// Read from the base image at `pos`.  Reads outside the base slot are
    /// a corrupt patch.
    pub fn read_base(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let base = self.config.base.as_mut().ok_or(Error::InvalidLayout)?;
        let pos = usize::try_from(pos).map_err(|_| Error::PatchFatal(Fault::SeekOutOfRange))?;
        if !base.region().fits(pos, buf.len()) {
            return Err(Error::PatchFatal(Fault::SeekOutOfRange));
        }
        self.flash.read(base.addr + pos, buf)?;
        base.offset = pos + buf.len();
        Ok(())
    }
}

/// The uniform stage contract.  `input` consumes a whole flush, transforms
/// it, and pushes the result into the next stage.  An error unwinds the
/// whole chain.
pub trait Engine<F: Flash> {
    /// Called once per attempt, before the destination is erased.
    fn init(&mut self, ctx: &Context<'_, F>) -> Result<()>;

    /// Returns the number of bytes of `buf` consumed.
    fn input(&mut self, ctx: &mut Context<'_, F>, buf: &[u8]) -> Result<usize>;

    /// Called once the source is exhausted.
    fn finish(&mut self, ctx: &mut Context<'_, F>) -> Result<()>;
}
