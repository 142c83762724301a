//! The processing chain: decompress, then diff, then store.
//!
//! Each stage owns the one after it, so a flush travels down the chain as a
//! plain call and an error unwinds back up through the same calls.

use storage::Flash;

use crate::decompress::DecompressStage;
use crate::diff::DiffStage;
use crate::engine::{Context, Engine, Registry, Stage, STORAGE_FLASH};
use crate::header::UpdateHeader;
use crate::store::Store;
use crate::Result;

pub type Stages = DecompressStage<DiffStage<Store>>;

pub struct Chain {
    stages: Stages,
}

impl Chain {
    /// Resolve the engines named by the header.  Fails if any stage has no
    /// matching engine, before anything is written.
    pub fn build(registry: &Registry, header: &UpdateHeader) -> Result<Chain> {
        let decompress = registry.resolve(Stage::Decompress, header.compress_type)?;
        let diff = registry.resolve(Stage::Diff, header.diff_type)?;
        let store = registry.resolve(Stage::Storage, STORAGE_FLASH)?;
        log::info!(
            "update chain: {} -> {} -> {}",
            decompress.name,
            diff.name,
            store.name
        );

        let store = Store::new(store)?;
        let diff = DiffStage::new(diff, store)?;
        let stages = DecompressStage::new(decompress, diff)?;
        Ok(Chain { stages })
    }

    /// Initialize every stage, head first.
    pub fn init<F: Flash>(&mut self, ctx: &Context<'_, F>) -> Result<()> {
        self.stages.init(ctx)
    }

    /// Stream the whole payload through the chain, then flush every stage.
    /// Returns the number of payload bytes consumed.
    pub fn run<F: Flash>(&mut self, ctx: &mut Context<'_, F>) -> Result<usize> {
        let consumed = self.stages.input(ctx, &[])?;
        self.stages.finish(ctx)?;
        Ok(consumed)
    }
}
