//! Payload integrity checks.
//!
//! These all run before the destination slot is erased, so any failure here
//! leaves every image on the device untouched.

use md5::{Digest, Md5};
use storage::{align_up, ReadFlash, Region};

use crate::config::{sizes, Policy};
use crate::header::UpdateHeader;
use crate::{Error, Result, SignatureVerifier, Watchdog};

/// Digest the payload following the header in `src` and compare it with the
/// header's digest.
pub fn check_payload<F: ReadFlash + ?Sized>(
    flash: &mut F,
    header: &UpdateHeader,
    src: &Region,
    watchdog: &mut dyn Watchdog,
) -> Result<()> {
    if !src.fits(0, header.packed_len()) {
        log::warn!(
            "payload of {} bytes does not fit update partition of {}",
            header.length,
            src.size
        );
        return Err(Error::PayloadCorrupt);
    }

    let mut hasher = Md5::new();
    let mut buffer = [0u8; sizes::DIGEST_CHUNK];
    let start = src.addr + header.size();
    let total = header.length as usize;
    let mut pos = 0;
    while pos < total {
        let todo = (total - pos).min(buffer.len());
        let buf = &mut buffer[..todo];
        flash.read(start + pos, buf)?;
        hasher.update(&*buf);
        watchdog.feed();
        pos += todo;
    }

    if hasher.finalize()[..] != header.digest[..] {
        log::warn!("update payload MD5 mismatch");
        return Err(Error::PayloadCorrupt);
    }
    Ok(())
}

/// Confirm the running image is the one the patch was made against.  Only
/// diff updates with a v2 header carry the base CRC.
pub fn check_base<F: ReadFlash + ?Sized>(
    flash: &mut F,
    header: &UpdateHeader,
    base: Option<&Region>,
    watchdog: &mut dyn Watchdog,
) -> Result<()> {
    let expect = match header.base {
        Some(expect) if header.is_diff() => expect,
        _ => return Ok(()),
    };
    let base = base.ok_or(Error::InvalidLayout)?;
    let total = expect.len as usize;
    if !base.fits(0, total) {
        log::warn!("base CRC covers {} bytes, base slot is {}", total, base.size);
        return Err(Error::BaseImageCorrupt);
    }

    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = [0u8; sizes::DIGEST_CHUNK];
    let mut pos = 0;
    while pos < total {
        let todo = (total - pos).min(buffer.len());
        let buf = &mut buffer[..todo];
        flash.read(base.addr + pos, buf)?;
        hasher.update(buf);
        watchdog.feed();
        pos += todo;
    }

    let crc = hasher.finalize();
    if crc != expect.crc32 {
        log::warn!("base image CRC {:#010x} != {:#010x}", crc, expect.crc32);
        return Err(Error::BaseImageCorrupt);
    }
    Ok(())
}

/// Hand the erase-aligned header and payload to the signature verifier, if
/// the policy asks for one.
pub fn check_signature(
    verifier: Option<&mut dyn SignatureVerifier>,
    policy: &Policy,
    header: &UpdateHeader,
    src: &Region,
    erase_size: usize,
) -> Result<()> {
    if !policy.require_signature {
        return Ok(());
    }
    let len = align_up(header.packed_len(), erase_size).ok_or(Error::SignatureInvalid)?;
    let verifier = match verifier {
        Some(v) => v,
        None => {
            log::error!("signature required but no verifier present");
            return Err(Error::SignatureInvalid);
        }
    };
    if !verifier.verify(src.addr, len) {
        log::warn!("signature check over {:#x}+{:#x} failed", src.addr, len);
        return Err(Error::SignatureInvalid);
    }
    Ok(())
}
