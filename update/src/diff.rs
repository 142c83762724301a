//! Diff stage
//!
//! Either passes data straight through, or applies a ddelta patch against the
//! running image, feeding the reconstructed bytes to the storage stage.

use storage::Flash;

use crate::engine::{Context, Engine, EngineDescriptor, EngineKind};
use crate::{Error, Result, Stage};

#[cfg(feature = "ddelta")]
use crate::delta::{PatchIo, PatchState};

pub enum Differ {
    None,
    #[cfg(feature = "ddelta")]
    DDelta(PatchState),
}

pub struct DiffStage<N> {
    differ: Differ,
    next: N,
}

impl<N> DiffStage<N> {
    pub fn new(engine: &EngineDescriptor, next: N) -> Result<DiffStage<N>> {
        let differ = match engine.kind {
            EngineKind::NoneDiff => Differ::None,
            #[cfg(feature = "ddelta")]
            EngineKind::DDelta => Differ::DDelta(PatchState::new()),
            _ => {
                return Err(Error::EngineNotSupported {
                    stage: Stage::Diff,
                    tag: engine.tag,
                })
            }
        };
        Ok(DiffStage { differ, next })
    }

    pub fn next(&self) -> &N {
        &self.next
    }
}

impl<F: Flash, N: Engine<F>> Engine<F> for DiffStage<N> {
    fn init(&mut self, ctx: &Context<'_, F>) -> Result<()> {
        match &mut self.differ {
            Differ::None => (),
            #[cfg(feature = "ddelta")]
            Differ::DDelta(state) => {
                if ctx.config.base.is_none() {
                    log::error!("diff update without a base image");
                    return Err(Error::InvalidLayout);
                }
                *state = PatchState::new();
            }
        }
        self.next.init(ctx)
    }

    fn input(&mut self, ctx: &mut Context<'_, F>, buf: &[u8]) -> Result<usize> {
        match &mut self.differ {
            Differ::None => self.next.input(ctx, buf),
            #[cfg(feature = "ddelta")]
            Differ::DDelta(state) => {
                let mut io = Patcher {
                    ctx,
                    next: &mut self.next,
                };
                state.input(&mut io, buf)?;
                Ok(buf.len())
            }
        }
    }

    fn finish(&mut self, ctx: &mut Context<'_, F>) -> Result<()> {
        match &self.differ {
            Differ::None => (),
            #[cfg(feature = "ddelta")]
            Differ::DDelta(state) => {
                state.finish()?;
                log::info!("ddelta: rebuilt {} bytes", state.produced());
            }
        }
        self.next.finish(ctx)
    }
}

/// Connects the patch state machine to the base slot and the next stage.
#[cfg(feature = "ddelta")]
struct Patcher<'c, 'a, F, N> {
    ctx: &'c mut Context<'a, F>,
    next: &'c mut N,
}

#[cfg(feature = "ddelta")]
impl<'c, 'a, F: Flash, N: Engine<F>> PatchIo for Patcher<'c, 'a, F, N> {
    fn read_base(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.ctx.read_base(pos, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.next.input(self.ctx, buf).map(|_| ())
    }
}
