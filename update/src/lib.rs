//! Firmware update support for the bootloader.
//!
//! A pending update is a packed header followed by a payload in the update
//! partition.  The payload is verified, then streamed through three stages
//! (decompress, diff, store) into the next OTA slot, and finally the OTA log
//! is advanced so the new slot boots.  See [`Updater::apply_update`].

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::fmt;

pub mod chain;
pub mod config;
pub mod decompress;
#[cfg(feature = "ddelta")]
pub mod delta;
pub mod diff;
pub mod engine;
pub mod header;
pub mod otadata;
mod ota;
pub mod store;
pub mod verify;

pub use config::{sizes, Layout, Policy, UpdateConfig, Window};
pub use engine::{Context, Engine, EngineDescriptor, EngineKind, Registry, Stage};
pub use header::UpdateHeader;
pub use ota::{Boot, Updater};
pub use storage::Region;

pub type Result<T> = core::result::Result<T, Error>;

// Use the error kind to avoid this depending on the particular flash.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    Flash(storage::Error),
    /// The update partition does not start with an update header.
    NotAnUpdate,
    HeaderCorrupt,
    UnsupportedVersion(u8),
    UnsupportedEncryption(u8),
    PayloadCorrupt,
    BaseImageCorrupt,
    SignatureInvalid,
    EngineNotSupported { stage: Stage, tag: u8 },
    /// The diff stream ended before the declared target size was produced.
    PatchShort,
    PatchFatal(Fault),
    Decompress,
    /// The layout cannot host this update (no slots, overlapping regions).
    InvalidLayout,
}

/// Reasons a diff stream is rejected while it is being applied.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    BadMagic,
    /// The base image cursor left the base region.
    SeekOutOfRange,
    /// An instruction would produce more than the declared target size.
    Overrun,
}

/// Convert the flash error into our error type.
impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Flash(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Flash(e) => write!(f, "flash: {}", e),
            Error::NotAnUpdate => f.write_str("no update pending"),
            Error::HeaderCorrupt => f.write_str("update header CRC mismatch"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported header version {}", v),
            Error::UnsupportedEncryption(t) => write!(f, "unsupported encryption type {}", t),
            Error::PayloadCorrupt => f.write_str("payload digest mismatch"),
            Error::BaseImageCorrupt => f.write_str("base image CRC mismatch"),
            Error::SignatureInvalid => f.write_str("signature verification failed"),
            Error::EngineNotSupported { stage, tag } => {
                write!(f, "no {:?} engine for type {}", stage, tag)
            }
            Error::PatchShort => f.write_str("patch ended before target was complete"),
            Error::PatchFatal(fault) => write!(f, "patch rejected: {:?}", fault),
            Error::Decompress => f.write_str("decompression failed"),
            Error::InvalidLayout => f.write_str("invalid flash layout"),
        }
    }
}

/// Hook serviced while long flash operations run.
pub trait Watchdog {
    fn feed(&mut self);
}

/// For boards without a watchdog.
impl Watchdog for () {
    fn feed(&mut self) {}
}

/// Verifies the signature appended to the update partition.  The region
/// covers the header and payload, rounded up to the erase size.
pub trait SignatureVerifier {
    fn verify(&mut self, addr: usize, len: usize) -> bool;
}
