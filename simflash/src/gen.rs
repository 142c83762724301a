//! Image and update package generation.
//!
//! Produces firmware-like images, new versions of them, ddelta patches
//! between two images, and packed update partitions in the format the
//! bootloader consumes.

use std::io::Write;

use anyhow::{anyhow, Result};
use liblzma::stream::{Check, Filters, LzmaOptions, Stream};
use liblzma::write::XzEncoder;
use md5::{Digest, Md5};
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

pub const COMPRESS_NONE: u8 = 0;
pub const COMPRESS_XZ: u8 = 1;
pub const DIFF_NONE: u8 = 0;
pub const DIFF_DDELTA: u8 = 1;

const MAGIC: &[u8; 4] = b"ESP\0";
const DDELTA_MAGIC: &[u8; 8] = b"DDELTA40";

/// A firmware-like image.  Built from a small vocabulary of words, so it
/// compresses about as well as real code does.
pub fn random_image(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = Xoshiro256Plus::seed_from_u64(seed);
    let mut words = [0u32; 64];
    for w in words.iter_mut() {
        *w = rng.next_u32();
    }
    let mut image = Vec::with_capacity(size + 4);
    while image.len() < size {
        let w = words[rng.gen_range(0..words.len())];
        image.extend_from_slice(&w.to_le_bytes());
    }
    image.truncate(size);
    image
}

/// A new version of `base`: scattered byte changes, a block of new code
/// inserted, and a range removed.
pub fn new_version(base: &[u8], seed: u64) -> Vec<u8> {
    let mut rng = Xoshiro256Plus::seed_from_u64(seed);
    let mut image = base.to_vec();
    for _ in 0..image.len() / 200 {
        let pos = rng.gen_range(0..image.len());
        image[pos] = rng.gen();
    }
    let insert = rng.gen_range(0..image.len());
    let mut code = vec![0u8; rng.gen_range(100..2000)];
    rng.fill_bytes(&mut code);
    image.splice(insert..insert, code);
    let cut = rng.gen_range(0..image.len() / 2);
    let len = rng.gen_range(1..image.len() / 8);
    image.drain(cut..cut + len);
    image
}

/// A ddelta patch from the reference generator, as the packaging tool
/// produces.
pub fn delta(base: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    let mut patch = Vec::new();
    ddelta::generate(base, target, &mut patch, |_| ())?;
    Ok(patch)
}

/// Builds hand-made ddelta patches.  The patch is valid but not optimal:
/// the target is cut into random blocks, each diffed against either the
/// same position of the base or a random one, so seeks go both ways.
pub struct DeltaBuilder {
    seed: u64,
    max_block: usize,
}

impl Default for DeltaBuilder {
    fn default() -> Self {
        DeltaBuilder {
            seed: 1,
            max_block: 5000,
        }
    }
}

// One patch instruction, with the base position its diff starts at.
struct Block {
    from: usize,
    diff: usize,
    extra: usize,
}

impl DeltaBuilder {
    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn max_block(&mut self, max_block: usize) -> &mut Self {
        self.max_block = max_block;
        self
    }

    pub fn build(&self, base: &[u8], target: &[u8]) -> Result<Vec<u8>> {
        if self.max_block == 0 {
            return Err(anyhow!("Block size must be positive"));
        }
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);

        let mut blocks = Vec::new();
        let mut pos = 0;
        while pos < target.len() {
            let len = rng.gen_range(1..=self.max_block).min(target.len() - pos);
            let from = if pos < base.len() && rng.gen_bool(0.8) {
                pos
            } else {
                rng.gen_range(0..=base.len())
            };
            let diff = rng.gen_range(0..=len).min(base.len() - from);
            blocks.push(Block {
                from,
                diff,
                extra: len - diff,
            });
            pos += len;
        }

        let mut patch = Vec::new();
        patch.extend_from_slice(DDELTA_MAGIC);
        patch.extend_from_slice(&(target.len() as u64).to_be_bytes());

        // The base cursor starts at zero.
        if let Some(first) = blocks.first() {
            if first.from != 0 {
                entry(&mut patch, 0, 0, first.from as i64);
            }
        }

        let mut out = 0;
        for (i, block) in blocks.iter().enumerate() {
            let cursor = block.from + block.diff;
            let seek = match blocks.get(i + 1) {
                Some(next) => next.from as i64 - cursor as i64,
                None => 0,
            };
            entry(&mut patch, block.diff as u64, block.extra as u64, seek);
            for k in 0..block.diff {
                patch.push(target[out + k].wrapping_sub(base[block.from + k]));
            }
            out += block.diff;
            patch.extend_from_slice(&target[out..out + block.extra]);
            out += block.extra;
        }
        entry(&mut patch, 0, 0, 0);
        Ok(patch)
    }
}

fn entry(patch: &mut Vec<u8>, diff: u64, extra: u64, seek: i64) {
    patch.extend_from_slice(&diff.to_be_bytes());
    patch.extend_from_slice(&extra.to_be_bytes());
    patch.extend_from_slice(&seek.to_be_bytes());
}

/// Compress with xz, the way the packaging tool does: LZMA2 with a 64 KiB
/// dictionary and a CRC32 check.
pub fn xz(data: &[u8]) -> Result<Vec<u8>> {
    let mut opts = LzmaOptions::new_preset(6)?;
    opts.dict_size(64 * 1024);
    let mut filters = Filters::new();
    filters.lzma2(&opts);
    let stream = Stream::new_stream_encoder(&filters, Check::Crc32)?;
    let mut enc = XzEncoder::new_stream(Vec::new(), stream);
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Builds the contents of an update partition: header, then payload.
pub struct PackageBuilder {
    version: u8,
    compress: u8,
    diff: u8,
    encryption: u8,
    firmware_version: String,
    /// Length and CRC32 of the base image, for v2 headers.
    base: (u32, u32),
}

impl Default for PackageBuilder {
    fn default() -> Self {
        PackageBuilder {
            version: 2,
            compress: COMPRESS_NONE,
            diff: DIFF_NONE,
            encryption: 0,
            firmware_version: "0.1.0".to_string(),
            base: (0, 0),
        }
    }
}

impl PackageBuilder {
    pub fn version(&mut self, version: u8) -> &mut Self {
        self.version = version;
        self
    }

    /// The payload is compressed by `build` when set to `COMPRESS_XZ`.
    pub fn compress(&mut self, compress: u8) -> &mut Self {
        self.compress = compress;
        self
    }

    pub fn diff(&mut self, diff: u8) -> &mut Self {
        self.diff = diff;
        self
    }

    pub fn encryption(&mut self, encryption: u8) -> &mut Self {
        self.encryption = encryption;
        self
    }

    pub fn firmware_version(&mut self, version: &str) -> &mut Self {
        self.firmware_version = version.to_string();
        self
    }

    /// Record the CRC of the image the patch applies to.
    pub fn base(&mut self, image: &[u8]) -> &mut Self {
        self.base = (image.len() as u32, crc32fast::hash(image));
        self
    }

    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let payload = match self.compress {
            COMPRESS_XZ => xz(payload)?,
            _ => payload.to_vec(),
        };

        let fw = self.firmware_version.as_bytes();
        if fw.len() >= 32 {
            return Err(anyhow!("Firmware version too long: {:?}", self.firmware_version));
        }

        let mut out = Vec::with_capacity(88 + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.push((self.diff << 4) | (self.compress & 0x0f));
        out.push(self.encryption);
        out.push(0);
        let mut field = [0u8; 32];
        field[..fw.len()].copy_from_slice(fw);
        out.extend_from_slice(&field);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let mut digest = [0u8; 32];
        digest[..16].copy_from_slice(&Md5::digest(&payload));
        out.extend_from_slice(&digest);
        if self.version >= 2 {
            out.extend_from_slice(&self.base.0.to_le_bytes());
            out.extend_from_slice(&self.base.1.to_le_bytes());
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

#[cfg(test)]
mod tester {
    use update::delta::{PatchIo, PatchState};
    use update::UpdateHeader;

    use super::*;

    struct Mem<'a> {
        base: &'a [u8],
        out: Vec<u8>,
    }

    impl<'a> PatchIo for Mem<'a> {
        fn read_base(&mut self, pos: u64, buf: &mut [u8]) -> update::Result<()> {
            let pos = pos as usize;
            buf.copy_from_slice(&self.base[pos..pos + buf.len()]);
            Ok(())
        }

        fn write(&mut self, buf: &[u8]) -> update::Result<()> {
            self.out.extend_from_slice(buf);
            Ok(())
        }
    }

    fn patch(base: &[u8], patch: &[u8], step: usize) -> Vec<u8> {
        let mut io = Mem { base, out: Vec::new() };
        let mut state = PatchState::new();
        for piece in patch.chunks(step) {
            state.input(&mut io, piece).unwrap();
        }
        state.finish().unwrap();
        io.out
    }

    #[test]
    fn test_generated_delta() {
        let base = random_image(40_000, 1);
        let target = new_version(&base, 2);
        let data = delta(&base, &target).unwrap();
        assert_eq!(&data[..8], DDELTA_MAGIC);
        for step in [1, 7, 24, 1000, 4096] {
            assert_eq!(patch(&base, &data, step), target, "step {}", step);
        }
    }

    #[test]
    fn test_delta() {
        let base = random_image(40_000, 1);
        let target = new_version(&base, 2);
        for seed in 1..5 {
            let data = DeltaBuilder::default().seed(seed).build(&base, &target).unwrap();
            assert_eq!(patch(&base, &data, 1000), target);
        }
    }

    #[test]
    fn test_package() {
        let image = random_image(10_000, 3);
        let data = PackageBuilder::default()
            .version(1)
            .compress(COMPRESS_XZ)
            .firmware_version("2.0.1")
            .build(&image)
            .unwrap();
        let header = UpdateHeader::parse(&data).unwrap();
        assert_eq!(header.size(), 80);
        assert_eq!(header.compress_type, COMPRESS_XZ);
        assert_eq!(header.firmware_version(), "2.0.1");
        assert_eq!(header.packed_len(), data.len());
        // Words repeat, so this compresses.
        assert!((header.length as usize) < image.len());
    }
}
