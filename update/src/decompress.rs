//! Decompression stage
//!
//! The head of the chain.  Started with an empty input, it pulls the payload
//! from the update partition in `SOURCE_CHUNK` pieces and pushes the
//! decompressed bytes into the next stage until the source is exhausted.

use storage::Flash;

use crate::config::sizes;
use crate::engine::{Context, Engine, EngineDescriptor, EngineKind};
use crate::{Error, Result, Stage};

pub enum Decompressor {
    None,
    #[cfg(feature = "xz")]
    Xz,
}

pub struct DecompressStage<N> {
    decompressor: Decompressor,
    next: N,
}

impl<N> DecompressStage<N> {
    pub fn new(engine: &EngineDescriptor, next: N) -> Result<DecompressStage<N>> {
        let decompressor = match engine.kind {
            EngineKind::NoneCompress => Decompressor::None,
            #[cfg(feature = "xz")]
            EngineKind::Xz => Decompressor::Xz,
            _ => {
                return Err(Error::EngineNotSupported {
                    stage: Stage::Decompress,
                    tag: engine.tag,
                })
            }
        };
        Ok(DecompressStage { decompressor, next })
    }

    pub fn next(&self) -> &N {
        &self.next
    }
}

impl<F: Flash, N: Engine<F>> Engine<F> for DecompressStage<N> {
    fn init(&mut self, ctx: &Context<'_, F>) -> Result<()> {
        self.next.init(ctx)
    }

    /// `buf` is ignored, the source is read through the context.  Returns
    /// the number of payload bytes consumed.
    fn input(&mut self, ctx: &mut Context<'_, F>, _buf: &[u8]) -> Result<usize> {
        let consumed = match self.decompressor {
            Decompressor::None => copy(ctx, &mut self.next)?,
            #[cfg(feature = "xz")]
            Decompressor::Xz => xz::inflate(ctx, &mut self.next)?,
        };
        log::debug!("decompress: consumed {} payload bytes", consumed);
        Ok(consumed)
    }

    fn finish(&mut self, ctx: &mut Context<'_, F>) -> Result<()> {
        self.next.finish(ctx)
    }
}

fn copy<F: Flash, N: Engine<F>>(ctx: &mut Context<'_, F>, next: &mut N) -> Result<usize> {
    let mut buffer = [0u8; sizes::SOURCE_CHUNK];
    let mut total = 0;
    loop {
        let n = ctx.read_source(&mut buffer)?;
        if n == 0 {
            return Ok(total);
        }
        next.input(ctx, &buffer[..n])?;
        total += n;
    }
}

#[cfg(feature = "xz")]
mod xz {
    use std::io::{self, Write};

    use liblzma::stream::Stream;
    use liblzma::write::XzDecoder;
    use storage::Flash;

    use crate::config::sizes;
    use crate::engine::{Context, Engine};
    use crate::{Error, Result};

    /// Decoder output sink, forwarding into the next stage.  The first
    /// failure, downstream or in the decoder, closes it for good.
    pub(super) struct Forward<'c, 'a, F, N> {
        ctx: &'c mut Context<'a, F>,
        next: &'c mut N,
        failure: Option<Error>,
    }

    impl<'c, 'a, F, N> Forward<'c, 'a, F, N> {
        pub(super) fn new(ctx: &'c mut Context<'a, F>, next: &'c mut N) -> Self {
            Forward {
                ctx,
                next,
                failure: None,
            }
        }

        /// Close the sink and report the error that caused it.  Output the
        /// decoder still holds when it is dropped goes nowhere.
        pub(super) fn fail(&mut self, err: io::Error) -> Error {
            *self.failure.get_or_insert_with(|| {
                log::error!("xz: {}", err);
                Error::Decompress
            })
        }
    }

    impl<'c, 'a, F: Flash, N: Engine<F>> Write for Forward<'c, 'a, F, N> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failure.is_some() {
                return Err(io::Error::new(io::ErrorKind::Other, "stage failed"));
            }
            match self.next.input(self.ctx, buf) {
                Ok(_) => Ok(buf.len()),
                Err(e) => {
                    self.failure = Some(e);
                    Err(io::Error::new(io::ErrorKind::Other, "stage failed"))
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(super) fn inflate<F: Flash, N: Engine<F>>(
        ctx: &mut Context<'_, F>,
        next: &mut N,
    ) -> Result<usize> {
        let stream = Stream::new_stream_decoder(sizes::XZ_MEMLIMIT, 0).map_err(|e| {
            log::error!("xz: decoder setup: {}", e);
            Error::Decompress
        })?;
        let mut buffer = [0u8; sizes::SOURCE_CHUNK];
        let mut decoder = XzDecoder::new_stream(Forward::new(ctx, next), stream);
        let mut total = 0;
        loop {
            let n = decoder.get_mut().ctx.read_source(&mut buffer)?;
            if n == 0 {
                break;
            }
            if let Err(e) = decoder.write_all(&buffer[..n]) {
                return Err(decoder.get_mut().fail(e));
            }
            total += n;
        }
        if let Err(e) = decoder.try_finish() {
            return Err(decoder.get_mut().fail(e));
        }
        Ok(total)
    }
}
