//! Resumable ddelta patch application
//!
//! A ddelta stream is a 16 byte header followed by a list of entries:
//!
//! ```text
//! header:  magic "DDELTA40", target size (u64 BE)
//! entry:   diff (u64 BE), extra (u64 BE), seek (i64 BE)
//!          diff bytes, added bytewise to the base at the base cursor
//!          extra bytes, copied verbatim
//! ```
//!
//! After an entry the base cursor moves by `seek`, relative to where the diff
//! left it.  An all zero entry ends the stream.
//!
//! Patch data arrives in flushes of any size, which may split the header, an
//! entry record or a diff run anywhere.  [`PatchState`] carries everything
//! needed to pick up again exactly where the previous flush stopped.

use zerocopy::byteorder::{BigEndian, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::config::sizes;
use crate::{Error, Fault, Result};

pub const MAGIC: [u8; 8] = *b"DDELTA40";

#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct RawHeader {
    pub(crate) magic: [u8; 8],
    pub(crate) new_file_size: U64<BigEndian>,
}

#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct RawEntry {
    pub(crate) diff: U64<BigEndian>,
    pub(crate) extra: U64<BigEndian>,
    pub(crate) seek: U64<BigEndian>,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<RawHeader>();
pub const ENTRY_SIZE: usize = core::mem::size_of::<RawEntry>();

/// One decoded patch instruction.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Entry {
    pub diff: u64,
    pub extra: u64,
    pub seek: i64,
}

impl Entry {
    fn decode(raw: &[u8]) -> Option<Entry> {
        let (entry, _) = LayoutVerified::<_, RawEntry>::new_unaligned_from_prefix(raw)?;
        Some(Entry {
            diff: entry.diff.get(),
            extra: entry.extra.get(),
            seek: entry.seek.get() as i64,
        })
    }

    fn is_end(&self) -> bool {
        self.diff == 0 && self.extra == 0 && self.seek == 0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    AwaitingHeader,
    AwaitingEntry,
    ApplyingDiff,
    ApplyingCopy,
    ApplyingSeek,
    Done,
    Fatal,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    /// The flush was consumed, more patch data is expected.
    NeedMore,
    /// The terminating entry was seen and the target is complete.
    Done,
}

/// Where the patch reads its base from and sends its output.
pub trait PatchIo {
    fn read_base(&mut self, pos: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, buf: &[u8]) -> Result<()>;
}

pub struct PatchState {
    phase: Phase,
    /// Partially received header or entry record.
    record: [u8; ENTRY_SIZE],
    filled: usize,
    target_size: u64,
    entry: Entry,
    /// Bytes of the current diff or extra run already handled.
    processed: u64,
    /// Output bytes produced.
    produced: u64,
    base_pos: u64,
    failure: Option<Error>,
    work: [u8; sizes::DELTA_BLOCK],
}

impl PatchState {
    pub fn new() -> PatchState {
        PatchState {
            phase: Phase::AwaitingHeader,
            record: [0; ENTRY_SIZE],
            filled: 0,
            target_size: 0,
            entry: Entry::default(),
            processed: 0,
            produced: 0,
            base_pos: 0,
            failure: None,
            work: [0; sizes::DELTA_BLOCK],
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Consume one flush of patch data.  After a failure the state is
    /// `Fatal` and every further call returns the same error.
    pub fn input<I: PatchIo>(&mut self, io: &mut I, buf: &[u8]) -> Result<Status> {
        if let Some(err) = self.failure {
            return Err(err);
        }
        match self.run(io, buf) {
            Ok(status) => Ok(status),
            Err(err) => {
                log::error!("ddelta: {} at output {}", err, self.produced);
                self.phase = Phase::Fatal;
                self.failure = Some(err);
                Err(err)
            }
        }
    }

    /// The patch source is exhausted.  Anything but a terminated stream is a
    /// short patch.
    pub fn finish(&self) -> Result<()> {
        match self.phase {
            Phase::Done => Ok(()),
            Phase::Fatal => Err(self.failure.unwrap_or(Error::PatchShort)),
            _ => {
                log::error!(
                    "ddelta: patch ended in {:?}, {} of {} bytes",
                    self.phase,
                    self.produced,
                    self.target_size
                );
                Err(Error::PatchShort)
            }
        }
    }

    fn run<I: PatchIo>(&mut self, io: &mut I, mut buf: &[u8]) -> Result<Status> {
        loop {
            match self.phase {
                Phase::AwaitingHeader => {
                    if !self.fill(&mut buf, HEADER_SIZE) {
                        return Ok(Status::NeedMore);
                    }
                    let (header, _) =
                        LayoutVerified::<_, RawHeader>::new_unaligned_from_prefix(&self.record[..])
                            .ok_or(Error::PatchFatal(Fault::BadMagic))?;
                    if header.magic != MAGIC {
                        return Err(Error::PatchFatal(Fault::BadMagic));
                    }
                    self.target_size = header.new_file_size.get();
                    log::debug!("ddelta: target size {}", self.target_size);
                    self.phase = Phase::AwaitingEntry;
                }
                Phase::AwaitingEntry => {
                    if !self.fill(&mut buf, ENTRY_SIZE) {
                        return Ok(Status::NeedMore);
                    }
                    let entry = Entry::decode(&self.record).ok_or(Error::PatchShort)?;
                    if entry.is_end() {
                        if self.produced != self.target_size {
                            return Err(Error::PatchShort);
                        }
                        self.phase = Phase::Done;
                        continue;
                    }
                    let end = self
                        .produced
                        .checked_add(entry.diff)
                        .and_then(|n| n.checked_add(entry.extra));
                    match end {
                        Some(end) if end <= self.target_size => (),
                        _ => return Err(Error::PatchFatal(Fault::Overrun)),
                    }
                    self.entry = entry;
                    self.processed = 0;
                    self.phase = Phase::ApplyingDiff;
                }
                Phase::ApplyingDiff => {
                    while self.processed < self.entry.diff {
                        if buf.is_empty() {
                            return Ok(Status::NeedMore);
                        }
                        let n = self.chunk(self.entry.diff, buf.len());
                        let work = &mut self.work[..n];
                        io.read_base(self.base_pos, work)?;
                        add_bytes(work, &buf[..n]);
                        io.write(work)?;
                        buf = &buf[n..];
                        self.base_pos += n as u64;
                        self.processed += n as u64;
                        self.produced += n as u64;
                    }
                    self.processed = 0;
                    self.phase = Phase::ApplyingCopy;
                }
                Phase::ApplyingCopy => {
                    while self.processed < self.entry.extra {
                        if buf.is_empty() {
                            return Ok(Status::NeedMore);
                        }
                        let n = self.chunk(self.entry.extra, buf.len());
                        io.write(&buf[..n])?;
                        buf = &buf[n..];
                        self.processed += n as u64;
                        self.produced += n as u64;
                    }
                    self.phase = Phase::ApplyingSeek;
                }
                Phase::ApplyingSeek => {
                    self.base_pos = self
                        .base_pos
                        .checked_add_signed(self.entry.seek)
                        .ok_or(Error::PatchFatal(Fault::SeekOutOfRange))?;
                    self.phase = Phase::AwaitingEntry;
                }
                Phase::Done => {
                    if !buf.is_empty() {
                        log::warn!("ddelta: ignoring {} bytes after end of patch", buf.len());
                    }
                    return Ok(Status::Done);
                }
                Phase::Fatal => return Err(self.failure.unwrap_or(Error::PatchShort)),
            }
        }
    }

    /// Append bytes of a header or entry record.  True once `want` bytes
    /// have been collected, which also resets the counter for the next one.
    fn fill(&mut self, buf: &mut &[u8], want: usize) -> bool {
        let take = (want - self.filled).min(buf.len());
        self.record[self.filled..self.filled + take].copy_from_slice(&buf[..take]);
        self.filled += take;
        *buf = &buf[take..];
        if self.filled == want {
            self.filled = 0;
            true
        } else {
            false
        }
    }

    /// Size of the next piece of a run of `total` bytes.
    fn chunk(&self, total: u64, available: usize) -> usize {
        let left = total - self.processed;
        let n = available.min(sizes::DELTA_BLOCK);
        if left < n as u64 {
            left as usize
        } else {
            n
        }
    }
}

impl Default for PatchState {
    fn default() -> Self {
        PatchState::new()
    }
}

/// `dst[i] = dst[i] + diff[i]` bytewise, modulo 256, eight bytes at a time.
pub fn add_bytes(dst: &mut [u8], diff: &[u8]) {
    const LOW: u64 = 0x7f7f_7f7f_7f7f_7f7f;
    const HIGH: u64 = !LOW;

    let mut words = dst.chunks_exact_mut(8);
    let mut diffs = diff.chunks_exact(8);
    for (d, s) in (&mut words).zip(&mut diffs) {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        let a = u64::from_ne_bytes(a);
        let b = u64::from_ne_bytes(b);
        // Add the low seven bits of every byte without carries crossing
        // lanes, then fix up the top bit.
        let sum = ((a & LOW) + (b & LOW)) ^ ((a ^ b) & HIGH);
        d.copy_from_slice(&sum.to_ne_bytes());
    }
    for (d, s) in words.into_remainder().iter_mut().zip(diffs.remainder()) {
        *d = d.wrapping_add(*s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Base held in memory, output collected.
    struct Mem<'a> {
        base: &'a [u8],
        out: Vec<u8>,
    }

    impl<'a> PatchIo for Mem<'a> {
        fn read_base(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
            let pos = pos as usize;
            let src = self
                .base
                .get(pos..pos + buf.len())
                .ok_or(Error::PatchFatal(Fault::SeekOutOfRange))?;
            buf.copy_from_slice(src);
            Ok(())
        }

        fn write(&mut self, buf: &[u8]) -> Result<()> {
            self.out.extend_from_slice(buf);
            Ok(())
        }
    }

    fn header(target: u64) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&target.to_be_bytes());
        out
    }

    fn entry(out: &mut Vec<u8>, diff: &[u8], extra: &[u8], seek: i64) {
        out.extend_from_slice(&(diff.len() as u64).to_be_bytes());
        out.extend_from_slice(&(extra.len() as u64).to_be_bytes());
        out.extend_from_slice(&seek.to_be_bytes());
        out.extend_from_slice(diff);
        out.extend_from_slice(extra);
    }

    fn end(out: &mut Vec<u8>) {
        out.extend_from_slice(&[0; ENTRY_SIZE]);
    }

    /// A patch exercising diff runs, literal runs, and both seek directions.
    fn sample() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let base: Vec<u8> = (0..64u32).map(|i| (i * 3) as u8).collect();
        let mut expect = Vec::new();
        let mut patch = header(0);

        // base[0..10] + 1, then "hello", skip forward 20.
        let d1 = [1u8; 10];
        expect.extend(base[..10].iter().map(|b| b.wrapping_add(1)));
        expect.extend_from_slice(b"hello");
        entry(&mut patch, &d1, b"hello", 20);

        // base[30..50] + 0xff, then back to 4.
        let d2 = [0xffu8; 20];
        expect.extend(base[30..50].iter().map(|b| b.wrapping_add(0xff)));
        entry(&mut patch, &d2, b"", -46);

        // base[4..9] unchanged, then a literal tail.
        let d3 = [0u8; 5];
        expect.extend_from_slice(&base[4..9]);
        expect.extend_from_slice(b"tail!");
        entry(&mut patch, &d3, b"tail!", 0);
        end(&mut patch);

        patch[8..16].copy_from_slice(&(expect.len() as u64).to_be_bytes());
        (base, patch, expect)
    }

    fn apply(base: &[u8], patch: &[u8], step: usize) -> Result<Vec<u8>> {
        let mut io = Mem { base, out: Vec::new() };
        let mut state = PatchState::new();
        for piece in patch.chunks(step) {
            state.input(&mut io, piece)?;
        }
        state.finish()?;
        Ok(io.out)
    }

    #[test]
    fn applies() {
        let (base, patch, expect) = sample();
        assert_eq!(apply(&base, &patch, patch.len()).unwrap(), expect);
    }

    // The output must not depend on how the patch is cut into flushes.
    #[test]
    fn any_flush_size() {
        let (base, patch, expect) = sample();
        for step in 1..=patch.len() {
            assert_eq!(apply(&base, &patch, step).unwrap(), expect, "step {}", step);
        }
    }

    #[test]
    fn generated_patch() {
        let base = simflash::gen::random_image(30_000, 7);
        let target = simflash::gen::new_version(&base, 8);
        let patch = simflash::gen::delta(&base, &target).unwrap();
        for step in [1, 7, 24, 1000, 4096] {
            assert_eq!(apply(&base, &patch, step).unwrap(), target, "step {}", step);
        }
    }

    #[test]
    fn split_entry() {
        let (base, patch, expect) = sample();
        let mut io = Mem { base: &base, out: Vec::new() };
        let mut state = PatchState::new();
        // Header, then the first entry record cut at 10 + 14.
        assert_eq!(state.input(&mut io, &patch[..16]), Ok(Status::NeedMore));
        assert_eq!(state.input(&mut io, &patch[16..26]), Ok(Status::NeedMore));
        assert_eq!(state.phase(), Phase::AwaitingEntry);
        assert_eq!(state.input(&mut io, &patch[26..40]), Ok(Status::NeedMore));
        assert_eq!(state.phase(), Phase::ApplyingDiff);
        assert_eq!(state.input(&mut io, &patch[40..]), Ok(Status::Done));
        state.finish().unwrap();
        assert_eq!(io.out, expect);
    }

    #[test]
    fn bad_magic() {
        let (base, mut patch, _) = sample();
        patch[7] = b'1';
        assert_eq!(
            apply(&base, &patch, 7),
            Err(Error::PatchFatal(Fault::BadMagic))
        );
    }

    #[test]
    fn short_patch() {
        let (base, patch, _) = sample();
        // Missing terminator.
        let cut = &patch[..patch.len() - ENTRY_SIZE];
        assert_eq!(apply(&base, cut, 100), Err(Error::PatchShort));

        // Terminator before the declared size is reached.
        let mut early = header(100);
        entry(&mut early, &[0; 4], b"", 0);
        end(&mut early);
        assert_eq!(apply(&base, &early, 5), Err(Error::PatchShort));
    }

    #[test]
    fn overrun() {
        let mut patch = header(4);
        entry(&mut patch, &[0; 2], b"xyz", 0);
        end(&mut patch);
        assert_eq!(
            apply(&[0; 8], &patch, 64),
            Err(Error::PatchFatal(Fault::Overrun))
        );
    }

    #[test]
    fn seek_before_start() {
        let mut patch = header(4);
        entry(&mut patch, &[0; 2], b"", -3);
        entry(&mut patch, &[0; 2], b"", 0);
        end(&mut patch);
        assert_eq!(
            apply(&[0; 8], &patch, 64),
            Err(Error::PatchFatal(Fault::SeekOutOfRange))
        );
    }

    #[test]
    fn fatal_is_sticky() {
        let mut io = Mem { base: &[], out: Vec::new() };
        let mut state = PatchState::new();
        let err = Err(Error::PatchFatal(Fault::BadMagic));
        assert_eq!(state.input(&mut io, &[0; 16]), err);
        assert_eq!(state.phase(), Phase::Fatal);
        assert_eq!(state.input(&mut io, &header(0)), err);
        assert_eq!(state.finish(), Err(Error::PatchFatal(Fault::BadMagic)));
    }

    #[test]
    fn trailing_bytes() {
        let mut patch = header(3);
        entry(&mut patch, b"", b"abc", 0);
        end(&mut patch);
        patch.extend_from_slice(b"junk");
        assert_eq!(apply(&[], &patch, 5).unwrap(), b"abc");
    }

    #[test]
    fn add_lanes() {
        let a: Vec<u8> = (0..=255u8).chain(0..=20).collect();
        let b: Vec<u8> = a.iter().rev().map(|x| x.wrapping_mul(7)).collect();
        let mut sum = a.clone();
        add_bytes(&mut sum, &b);
        for i in 0..a.len() {
            assert_eq!(sum[i], a[i].wrapping_add(b[i]));
        }
    }
}
