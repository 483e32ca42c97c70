// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot state machine.
//!
//! Driven by repeated [`BootMachine::poll`] calls from the superloop. Each
//! call performs one state's work to completion and returns the next state;
//! the machine is never re-entered and nothing yields mid-state. Validation
//! failures are recovered locally by blanking the offending descriptor;
//! flash failures during a promotion are not recoverable for that attempt
//! and park the machine in [`BootState::Fatal`], which forces a delayed
//! system reset rather than continuing in a half-written state.

use crate::descriptor::{self, ImageFlag, ValidateChecks, ValidateError};
use crate::layout::{FlashLayout, Partition};
use crate::log;
use crate::nvm::{Nvm, NvmController, NvmError};
use consts::{FATAL_RESET_DELAY_SECS, NVM_PAGE_SIZE, RESET_VECTOR_OFFSET};

/// Hardware the boot machine needs besides flash.
pub trait BootPlatform {
    /// Monotonic tick counter.
    fn ticks(&mut self) -> u64;

    /// Tick frequency in Hz.
    fn tick_hz(&self) -> u64;

    /// Full system reset. Does not return on hardware.
    fn system_reset(&mut self);

    /// Hand the CPU to the image whose vector table sits at `entry`. On
    /// hardware this returns only if the image's initial stack pointer word
    /// is blank; see `launch::jump_to_image`.
    fn launch(&mut self, entry: EntryPoint);
}

/// Address of a vector table the machine has decided to boot from.
///
/// There is no public constructor: values come out of descriptor validation
/// or the default-image probe, never from raw integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EntryPoint {
    ivt: u32,
}

impl EntryPoint {
    pub(crate) const fn new(ivt: u32) -> Self {
        Self { ivt }
    }

    pub const fn address(&self) -> u32 {
        self.ivt
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootState {
    /// Validate the candidate descriptors and pick a winner.
    Validate,
    /// Launch the selected image.
    ExecuteImage,
    /// Back up the Run image to Save, then promote New.
    SaveRunSetNew,
    /// Promote the New image into the Run partition.
    SetNew,
    /// Restore the Save backup into the Run partition.
    RestoreSave,
    /// Parked: no bootable image anywhere.
    Error,
    /// Non-recoverable flash failure; schedule a reset.
    Fatal,
    /// Waiting out the reset delay.
    Reset,
}

/// Diagnostic switches. Defaults enable everything; production builds never
/// change them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootOptions {
    /// Check descriptor signature bytes.
    pub validate_signature: bool,
    /// Check descriptor flags.
    pub validate_flags: bool,
    /// Check the body CRC.
    pub validate_crc: bool,
    /// Blank descriptors that fail validation.
    pub erase_invalid: bool,
    /// Rewrite NEW to TEST on first launch.
    pub change_flags: bool,
    /// Actually transfer control; off, the machine loops back to Validate.
    pub exec_enable: bool,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            validate_signature: true,
            validate_flags: true,
            validate_crc: true,
            erase_invalid: true,
            change_flags: true,
            exec_enable: true,
        }
    }
}

impl BootOptions {
    fn checks(&self) -> ValidateChecks {
        ValidateChecks {
            signature: self.validate_signature,
            flags: self.validate_flags,
            crc: self.validate_crc,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExecTarget {
    /// Launch the image described by the Run descriptor.
    RunImage,
    /// Launch by address override, bypassing descriptor mechanics.
    Address(EntryPoint),
}

/// The bootloader control loop. Owns the flash, the platform and all
/// transition state; there are no free-floating singletons.
pub struct BootMachine<C, P> {
    nvm: Nvm<C>,
    platform: P,
    layout: FlashLayout,
    options: BootOptions,
    state: BootState,
    exec: Option<ExecTarget>,
    reset_at: u64,
}

impl<C: NvmController, P: BootPlatform> BootMachine<C, P> {
    pub fn new(nvm: Nvm<C>, platform: P, layout: FlashLayout, options: BootOptions) -> Self {
        Self {
            nvm,
            platform,
            layout,
            options,
            state: BootState::Validate,
            exec: None,
            reset_at: 0,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn nvm(&self) -> &Nvm<C> {
        &self.nvm
    }

    pub fn nvm_mut(&mut self) -> &mut Nvm<C> {
        &mut self.nvm
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn into_parts(self) -> (Nvm<C>, P) {
        (self.nvm, self.platform)
    }

    /// Run one state to completion and return the next state.
    pub fn poll(&mut self) -> BootState {
        let next = match self.state {
            BootState::Validate => self.state_validate(),
            BootState::ExecuteImage => self.state_execute(),
            BootState::SaveRunSetNew => self.state_save_run_set_new(),
            BootState::SetNew => self.state_set_new(),
            BootState::RestoreSave => self.state_restore_save(),
            BootState::Error => Ok(BootState::Error),
            BootState::Fatal => Ok(self.state_fatal()),
            BootState::Reset => Ok(self.state_reset()),
        };
        self.state = match next {
            Ok(state) => state,
            Err(err) => {
                log::error!("boot: flash failure: {}", err);
                BootState::Fatal
            }
        };
        self.state
    }

    fn state_validate(&mut self) -> Result<BootState, NvmError> {
        self.exec = None;
        let run = self.layout.run();
        let new = self.layout.new_partition();

        let run_dcpt = self.check_partition(&run, "run")?;
        let new_dcpt = self.check_partition(&new, "new")?;

        if let Some(run_d) = &run_dcpt {
            let newer_staged = match &new_dcpt {
                Some(new_d) => new_d.version > run_d.version,
                None => false,
            };
            if !newer_staged {
                if new_dcpt.is_some() {
                    // Stale New image loses the tie to the image in place.
                    self.blank(&new);
                }
                log::info!("boot: executing run image, version {}", run_d.version);
                self.exec = Some(ExecTarget::RunImage);
                return Ok(BootState::ExecuteImage);
            }
        }

        if new_dcpt.is_some() {
            return Ok(if self.layout.save().is_some() && run_dcpt.is_some() {
                BootState::SaveRunSetNew
            } else {
                BootState::SetNew
            });
        }

        if let Some(save) = self.layout.save() {
            if self.check_partition(&save, "save")?.is_some() {
                return Ok(BootState::RestoreSave);
            }
        }

        if let Some(ivt) = self.layout.default_image() {
            if let Some(entry) = self.probe_default_image(ivt) {
                log::info!("boot: falling back to default image at {:x}", ivt);
                self.exec = Some(ExecTarget::Address(entry));
                return Ok(BootState::ExecuteImage);
            }
        }

        log::error!("boot: no bootable image found");
        Ok(BootState::Error)
    }

    fn state_execute(&mut self) -> Result<BootState, NvmError> {
        let run = self.layout.run();
        let entry = match self.exec {
            // Nothing selected; Validate never hands over control like this.
            None => return Ok(BootState::Fatal),
            Some(ExecTarget::Address(entry)) => entry,
            Some(ExecTarget::RunImage) => {
                let dcpt = descriptor::read(&self.nvm, &run)?;
                if self.options.change_flags && dcpt.header.flag() == ImageFlag::New {
                    // First launch of this image: mark it TEST before the
                    // control transfer. If the device resets before the
                    // application confirms health, the image is found under
                    // test, not relaunched as new.
                    let mut copy = dcpt;
                    copy.header.flags = ImageFlag::Test.raw();
                    if let Err(err) = self.nvm.write_block(run.dcpt_start(), &copy.to_bytes()) {
                        log::warn!("boot: failed to mark image under test: {}", err);
                    }
                }
                EntryPoint::new(dcpt.start_address)
            }
        };

        if !self.options.exec_enable {
            log::info!("boot: skipping launch at {:x}", entry.address());
            return Ok(BootState::Validate);
        }

        log::info!("boot: launching image at {:x}", entry.address());
        self.platform.launch(entry);

        // Reached only when the image could not be entered; start over from
        // a clean reset.
        self.platform.system_reset();
        Ok(BootState::Validate)
    }

    fn state_save_run_set_new(&mut self) -> Result<BootState, NvmError> {
        let Some(save) = self.layout.save() else {
            return Ok(BootState::Fatal);
        };
        let run = self.layout.run();

        // Repeated failures of the same New image would re-save Run each
        // boot; skip when Save already holds this exact descriptor.
        let run_raw = descriptor::read_raw(&self.nvm, &run)?;
        let save_raw = descriptor::read_raw(&self.nvm, &save)?;
        let save_ok =
            descriptor::validate(&self.nvm, &self.layout, &save, self.options.checks()).is_ok();
        if save_ok && save_raw == run_raw {
            log::info!("boot: save partition already holds the run image");
        } else {
            self.promote(&run, &save)?;
        }
        Ok(BootState::SetNew)
    }

    fn state_set_new(&mut self) -> Result<BootState, NvmError> {
        let run = self.layout.run();
        let new = self.layout.new_partition();
        self.promote(&new, &run)?;
        self.exec = Some(ExecTarget::RunImage);
        Ok(BootState::ExecuteImage)
    }

    fn state_restore_save(&mut self) -> Result<BootState, NvmError> {
        let Some(save) = self.layout.save() else {
            return Ok(BootState::Fatal);
        };
        let run = self.layout.run();
        log::info!("boot: restoring saved image");
        self.promote(&save, &run)?;
        self.exec = Some(ExecTarget::RunImage);
        Ok(BootState::ExecuteImage)
    }

    fn state_fatal(&mut self) -> BootState {
        log::error!("boot: fatal condition, resetting shortly");
        let delay = FATAL_RESET_DELAY_SECS.saturating_mul(self.platform.tick_hz());
        self.reset_at = self.platform.ticks().saturating_add(delay);
        BootState::Reset
    }

    fn state_reset(&mut self) -> BootState {
        if self.platform.ticks() < self.reset_at {
            return BootState::Reset;
        }
        self.platform.system_reset();
        // On hardware the reset does not return.
        BootState::Validate
    }

    /// Validate one partition; blank its descriptor when it is rejected.
    /// Flash readback failures propagate, validation failures do not.
    fn check_partition(
        &mut self,
        partition: &Partition,
        name: &str,
    ) -> Result<Option<descriptor::ImageDescriptor>, NvmError> {
        match descriptor::validate(&self.nvm, &self.layout, partition, self.options.checks()) {
            Ok(dcpt) => {
                log::info!("boot: {} image valid, version {}", name, dcpt.version);
                Ok(Some(dcpt))
            }
            Err(ValidateError::Nvm(err)) => Err(err),
            Err(err) => {
                log::info!("boot: {} image rejected: {}", name, err);
                self.blank(partition);
                Ok(None)
            }
        }
    }

    fn blank(&mut self, partition: &Partition) {
        if !self.options.erase_invalid {
            return;
        }
        if let Err(err) = descriptor::invalidate(&mut self.nvm, partition) {
            log::warn!("boot: failed to blank descriptor: {}", err);
        }
    }

    /// Copy the image of `src` into `dst`.
    ///
    /// Erases the whole destination span, copies the body bytes to the same
    /// window offsets, then commits by writing the descriptor last. A power
    /// loss anywhere before that final write leaves the destination blank
    /// and the source untouched, so the next boot simply retries.
    fn promote(&mut self, src: &Partition, dst: &Partition) -> Result<(), NvmError> {
        self.nvm.erase(dst.dcpt_start(), dst.span_pages())?;

        let src_dcpt = descriptor::read(&self.nvm, src)?;
        let mut offset = src_dcpt.start_address - self.layout.window().low();
        let mut left = src_dcpt.end_address - src_dcpt.start_address;
        let mut buf = [0u8; NVM_PAGE_SIZE as usize];
        while left != 0 {
            let dst_addr = dst.app_start() + offset;
            // Chunk up to the next destination page boundary so every page
            // is programmed exactly once.
            let take = (NVM_PAGE_SIZE - dst_addr % NVM_PAGE_SIZE).min(left) as usize;
            self.nvm.read(src.app_start() + offset, &mut buf[..take])?;
            self.nvm.write_block(dst_addr, &buf[..take])?;
            offset += take as u32;
            left -= take as u32;
        }

        let raw = descriptor::read_raw(&self.nvm, src)?;
        self.nvm.write_block(dst.dcpt_start(), &raw)?;
        log::info!("boot: promoted image into partition at {:x}", dst.dcpt_start());
        Ok(())
    }

    fn probe_default_image(&self, ivt: u32) -> Option<EntryPoint> {
        let vector = self.nvm.read_u32(ivt + RESET_VECTOR_OFFSET).ok()? & !1;
        if !self.layout.window().contains(vector) {
            return None;
        }
        match self.nvm.read_u32(vector) {
            Ok(word) if word != 0xFFFF_FFFF => Some(EntryPoint::new(ivt)),
            _ => None,
        }
    }
}
