//! Update header
//!
//! The update partition begins with a packed, little-endian header.  Its
//! length depends on the version byte:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "ESP\0"
//!      4     1  version
//!      5     1  compress type (low nibble), diff type (high nibble)
//!      6     1  encryption type
//!      7     1  reserved
//!      8    32  firmware version, NUL terminated
//!     40     4  payload length
//!     44    32  payload MD5 (first 16 bytes used)
//!     76     4  v2 only: base image length covered by the base CRC
//!     80     4  v2 only: base image CRC32
//!   last     4  CRC32 of all preceding header bytes
//! ```
//!
//! The payload follows the header immediately.

use core::mem::size_of;

use storage::ReadFlash;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::{Error, Result};

pub const MAGIC: [u8; 4] = *b"ESP\0";

/// Newest header version understood.
pub const MAX_VERSION: u8 = 2;

pub const COMPRESS_NONE: u8 = 0;
pub const COMPRESS_XZ: u8 = 1;

pub const DIFF_NONE: u8 = 0;
pub const DIFF_DDELTA: u8 = 1;

pub const ENCRYPTION_NONE: u8 = 0;

/// Bytes read from the partition before the version is known.
pub const MAX_HEADER_SIZE: usize = size_of::<HeaderV2>();

/// Fields shared by every version.
#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct Common {
    magic: [u8; 4],
    version: u8,
    types: u8,
    encryption: u8,
    reserved: u8,
    firmware_version: [u8; 32],
    length: U32<LittleEndian>,
    digest: [u8; 32],
}

#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct HeaderV1 {
    common: Common,
    crc32: U32<LittleEndian>,
}

#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct HeaderV2 {
    common: Common,
    base_len: U32<LittleEndian>,
    base_crc32: U32<LittleEndian>,
    crc32: U32<LittleEndian>,
}

/// Size in bytes of a header of the given version.
pub fn header_size(version: u8) -> Option<usize> {
    match version {
        1 => Some(size_of::<HeaderV1>()),
        2 => Some(size_of::<HeaderV2>()),
        _ => None,
    }
}

/// Expected CRC of the first bytes of the running image, carried by v2
/// headers so a patch is never applied against the wrong base.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BaseCheck {
    pub len: u32,
    pub crc32: u32,
}

/// A decoded update header.  Read once per attempt, never modified.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UpdateHeader {
    pub version: u8,
    pub compress_type: u8,
    pub diff_type: u8,
    pub encryption_type: u8,
    firmware_version: [u8; 32],
    /// Payload length in bytes.
    pub length: u32,
    pub digest: [u8; 16],
    pub base: Option<BaseCheck>,
}

impl UpdateHeader {
    /// Read and check the header at `addr`.  Only the header itself is
    /// validated here, the payload is checked by [`crate::verify`].
    pub fn read<F: ReadFlash + ?Sized>(flash: &mut F, addr: usize) -> Result<UpdateHeader> {
        let mut raw = [0u8; MAX_HEADER_SIZE];
        flash.read(addr, &mut raw)?;
        UpdateHeader::parse(&raw)
    }

    /// Decode a header from raw bytes: magic, then version, then CRC.
    pub fn parse(raw: &[u8]) -> Result<UpdateHeader> {
        let (common, _) = LayoutVerified::<_, Common>::new_unaligned_from_prefix(raw)
            .ok_or(Error::NotAnUpdate)?;
        let common = *common;

        if common.magic != MAGIC {
            return Err(Error::NotAnUpdate);
        }

        let size = header_size(common.version)
            .ok_or(Error::UnsupportedVersion(common.version))?;
        if raw.len() < size {
            return Err(Error::HeaderCorrupt);
        }

        let (stored_crc, base) = match common.version {
            1 => {
                let (hdr, _) = LayoutVerified::<_, HeaderV1>::new_unaligned_from_prefix(raw)
                    .ok_or(Error::HeaderCorrupt)?;
                (hdr.crc32.get(), None)
            }
            _ => {
                let (hdr, _) = LayoutVerified::<_, HeaderV2>::new_unaligned_from_prefix(raw)
                    .ok_or(Error::HeaderCorrupt)?;
                let base = BaseCheck {
                    len: hdr.base_len.get(),
                    crc32: hdr.base_crc32.get(),
                };
                (hdr.crc32.get(), Some(base))
            }
        };

        let crc = crc32fast::hash(&raw[..size - size_of::<U32<LittleEndian>>()]);
        if crc != stored_crc {
            log::warn!("update header CRC {:#010x} != {:#010x}", crc, stored_crc);
            return Err(Error::HeaderCorrupt);
        }

        let mut digest = [0u8; 16];
        digest.copy_from_slice(&common.digest[..16]);

        Ok(UpdateHeader {
            version: common.version,
            compress_type: common.types & 0x0f,
            diff_type: common.types >> 4,
            encryption_type: common.encryption,
            firmware_version: common.firmware_version,
            length: common.length.get(),
            digest,
            base,
        })
    }

    /// Size of this header in flash.  The payload starts right after it.
    pub fn size(&self) -> usize {
        header_size(self.version).unwrap_or(MAX_HEADER_SIZE)
    }

    /// Header plus payload.
    pub fn packed_len(&self) -> usize {
        self.size() + self.length as usize
    }

    pub fn is_diff(&self) -> bool {
        self.diff_type != DIFF_NONE
    }

    /// The firmware version string, up to the first NUL.  Invalid UTF-8
    /// yields an empty string.
    pub fn firmware_version(&self) -> &str {
        let end = self
            .firmware_version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.firmware_version.len());
        core::str::from_utf8(&self.firmware_version[..end]).unwrap_or("")
    }
}
