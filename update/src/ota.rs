//! Applying a pending update
//!
//! [`Updater::apply_update`] is called once per boot with the slot the
//! bootloader would otherwise start.  Whatever happens, it returns a slot
//! that is safe to boot: the new one if the update was written and
//! selected, the current one otherwise.

use storage::{align_up, erase_region, Flash, Region};

use crate::chain::Chain;
use crate::config::{Layout, Policy, UpdateConfig};
use crate::engine::{Context, Registry};
use crate::header::{UpdateHeader, ENCRYPTION_NONE, MAX_HEADER_SIZE};
use crate::otadata::{ImageState, OtaLog};
use crate::verify;
use crate::{Error, Result, SignatureVerifier, Watchdog};

/// An image the bootloader can start.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Boot {
    Factory,
    Test,
    Ota(usize),
}

pub struct Updater<'a, F> {
    flash: F,
    layout: Layout,
    policy: Policy,
    registry: Registry,
    watchdog: Option<&'a mut dyn Watchdog>,
    verifier: Option<&'a mut dyn SignatureVerifier>,
    /// Set once the last attempt erased its destination slot.
    slot_erased: bool,
}

impl<'a, F: Flash> Updater<'a, F> {
    pub fn new(flash: F, layout: Layout) -> Updater<'a, F> {
        Updater {
            flash,
            layout,
            policy: Policy::default(),
            registry: Registry::builtin(),
            watchdog: None,
            verifier: None,
            slot_erased: false,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn watchdog(mut self, watchdog: &'a mut dyn Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn verifier(mut self, verifier: &'a mut dyn SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Whether the last attempt got as far as erasing the destination slot.
    /// When it did and then failed, the slot holds no usable image.
    pub fn slot_erased(&self) -> bool {
        self.slot_erased
    }

    /// Install a pending update, if there is one, and return the image to
    /// boot.
    pub fn apply_update(&mut self, current: Boot) -> Boot {
        match self.try_update(current) {
            Ok(slot) => Boot::Ota(slot),
            Err(Error::NotAnUpdate) => current,
            Err(e) => {
                if self.slot_erased {
                    log::error!("update failed after writing slot: {}", e);
                } else {
                    log::warn!("update rejected: {}", e);
                }
                current
            }
        }
    }

    /// Install a pending update and select it, returning the slot written.
    /// Once a header has been found it is always cleared, so a failed update
    /// is not retried on the next boot.
    pub fn try_update(&mut self, current: Boot) -> Result<usize> {
        self.slot_erased = false;
        let header = match UpdateHeader::read(&mut self.flash, self.layout.update.addr) {
            Err(Error::NotAnUpdate) => {
                log::debug!("no update pending");
                return Err(Error::NotAnUpdate);
            }
            other => other,
        };

        let written = header.and_then(|header| self.install(current, header));

        if let Err(e) = self.clear_marker() {
            log::error!("could not clear update header: {}", e);
        }

        let (dest, mut otadata) = written?;
        let state = if self.policy.rollback {
            ImageState::New
        } else {
            ImageState::Undefined
        };
        otadata.commit(&mut self.flash, dest, self.layout.slots.len(), state)?;
        Ok(dest)
    }

    /// Slot an update is written to when booting `current`.
    pub fn destination(&self, current: Boot) -> Result<usize> {
        let count = self.layout.slots.len();
        if count == 0 {
            return Err(Error::InvalidLayout);
        }
        match current {
            Boot::Factory | Boot::Test => Ok(0),
            Boot::Ota(index) => Ok((index + 1) % count),
        }
    }

    /// The region holding the image running as `current`.
    pub fn running_region(&self, current: Boot) -> Option<Region> {
        match current {
            Boot::Factory => self.layout.factory,
            Boot::Test => self.layout.test,
            Boot::Ota(index) => self.layout.slots.get(index).copied(),
        }
    }

    // Everything from verification to the last write into the slot.  The
    // log is read up front so a bad log region is found before the erase.
    fn install(&mut self, current: Boot, header: UpdateHeader) -> Result<(usize, OtaLog)> {
        log::info!(
            "update found: firmware {:?}, {} bytes, compress {}, diff {}",
            header.firmware_version(),
            header.length,
            header.compress_type,
            header.diff_type
        );

        let dest = self.destination(current)?;
        let dst = self.layout.slots[dest];
        let base = self.running_region(current);

        if header.encryption_type != ENCRYPTION_NONE {
            return Err(Error::UnsupportedEncryption(header.encryption_type));
        }
        self.check_layout(&dst, base.as_ref(), &header)?;
        let otadata = OtaLog::read(&mut self.flash, &self.layout.otadata)?;

        let Updater {
            flash,
            layout,
            policy,
            registry,
            watchdog,
            verifier,
            slot_erased,
        } = self;
        let mut no_watchdog = ();
        let watchdog: &mut dyn Watchdog = match watchdog {
            Some(w) => &mut **w,
            None => &mut no_watchdog,
        };

        verify::check_payload(flash, &header, &layout.update, watchdog)?;
        verify::check_base(flash, &header, base.as_ref(), watchdog)?;
        let verifier: Option<&mut dyn SignatureVerifier> = match verifier {
            Some(v) => Some(&mut **v),
            None => None,
        };
        verify::check_signature(verifier, policy, &header, &layout.update, flash.erase_size())?;

        let mut chain = Chain::build(registry, &header)?;
        let config = UpdateConfig::new(layout.update, dst, base);
        let mut ctx = Context::new(flash, watchdog, config, header);
        chain.init(&ctx)?;

        log::info!("erasing slot {} at {:#x}", dest, dst.addr);
        *slot_erased = true;
        erase_region(&mut *ctx.flash, &dst)?;
        let consumed = chain.run(&mut ctx)?;
        log::info!(
            "slot {}: {} bytes written from {} payload bytes",
            dest,
            ctx.config.dst.offset,
            consumed
        );
        Ok((dest, otadata))
    }

    // The slot being written must not hold anything else the update needs.
    fn check_layout(&self, dst: &Region, base: Option<&Region>, header: &UpdateHeader) -> Result<()> {
        let erase = self.flash.erase_size();
        let update = &self.layout.update;
        if update.size == 0 || !update.is_aligned(erase) {
            log::error!("update partition {:#x}+{:#x} not erase aligned", update.addr, update.size);
            return Err(Error::InvalidLayout);
        }
        if !dst.is_aligned(erase) {
            log::error!("slot {:#x}+{:#x} not erase aligned", dst.addr, dst.size);
            return Err(Error::InvalidLayout);
        }
        if dst.overlaps(&self.layout.update) || dst.overlaps(&self.layout.otadata) {
            log::error!("slot {:#x} overlaps update or otadata", dst.addr);
            return Err(Error::InvalidLayout);
        }
        if header.is_diff() {
            match base {
                Some(base) if !base.overlaps(dst) => (),
                _ => {
                    log::error!("diff update needs a base image apart from the destination");
                    return Err(Error::InvalidLayout);
                }
            }
        }
        Ok(())
    }

    // Erase the sectors holding the header, so the update is not found again.
    fn clear_marker(&mut self) -> Result<()> {
        let update = self.layout.update;
        let size = align_up(MAX_HEADER_SIZE, self.flash.erase_size())
            .ok_or(Error::InvalidLayout)?
            .min(update.size);
        erase_region(&mut self.flash, &Region::new(update.addr, size))?;
        Ok(())
    }
}
