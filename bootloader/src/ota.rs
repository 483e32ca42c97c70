// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! OTA update session and the platform image state API.
//!
//! The session tracks one in-flight transfer into the New partition. Blocks
//! may arrive out of order and with gaps, so the session tracks the lowest
//! and highest offsets actually written; signature verification and the
//! committed CRC cover exactly that range. The descriptor is written only
//! after the payload verifies, and that single write is what makes the
//! staged image visible to the bootloader; a session that dies earlier
//! leaves nothing the boot path would consider.

use crate::boot::BootPlatform;
use crate::crc::Crc32;
use crate::descriptor::{self, ImageDescriptor, ImageFlag, ImageHeader};
use crate::layout::FlashLayout;
use crate::log;
use crate::nvm::{Nvm, NvmController, NvmError};
use consts::RESET_VECTOR_OFFSET;

/// Streaming signature verification over the staged payload, fed in flash
/// readback order. The hash/curve mechanics live behind this seam.
pub trait SignatureVerify {
    fn begin(&mut self);

    fn update(&mut self, data: &[u8]);

    /// Check `signature` over everything fed since [`begin`](Self::begin).
    fn finish(&mut self, signature: &[u8]) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaError {
    /// No transfer is open.
    NoSession,
    /// Block range extends past the maximum image size.
    OutOfRange,
    /// Close of a transfer that never wrote a byte.
    EmptyImage,
    /// The payload failed signature verification.
    Signature,
    /// Flash operation failed.
    Nvm(NvmError),
}

impl core::fmt::Display for OtaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoSession => write!(f, "no update session open"),
            Self::OutOfRange => write!(f, "block outside the image area"),
            Self::EmptyImage => write!(f, "empty transfer"),
            Self::Signature => write!(f, "image signature verification failed"),
            Self::Nvm(err) => write!(f, "flash failure: {err}"),
        }
    }
}

impl From<NvmError> for OtaError {
    fn from(err: NvmError) -> Self {
        Self::Nvm(err)
    }
}

/// One in-flight firmware transfer into the New partition.
pub struct OtaSession<'a, C> {
    nvm: &'a mut Nvm<C>,
    layout: FlashLayout,
    low_offset: u32,
    high_offset: u32,
    active: bool,
}

impl<'a, C: NvmController> OtaSession<'a, C> {
    pub fn new(nvm: &'a mut Nvm<C>, layout: FlashLayout) -> Self {
        let body = layout.new_partition().body_len();
        Self {
            nvm,
            layout,
            low_offset: body,
            high_offset: 0,
            active: false,
        }
    }

    /// Lowest body offset written so far.
    pub fn low_offset(&self) -> u32 {
        self.low_offset
    }

    /// One past the highest body offset written so far.
    pub fn high_offset(&self) -> u32 {
        self.high_offset
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start a transfer: erase the whole New partition span up front
    /// (descriptor and body) and reset the offset tracking.
    pub fn open(&mut self) -> Result<(), OtaError> {
        let new = self.layout.new_partition();
        self.nvm.erase(new.dcpt_start(), new.span_pages())?;
        self.low_offset = new.body_len();
        self.high_offset = 0;
        self.active = true;
        log::info!("ota: session open");
        Ok(())
    }

    /// Stage one block of the image at `offset` into the body.
    pub fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), OtaError> {
        if !self.active {
            return Err(OtaError::NoSession);
        }
        let new = self.layout.new_partition();
        let end = offset
            .checked_add(data.len() as u32)
            .ok_or(OtaError::OutOfRange)?;
        if end > new.body_len() {
            return Err(OtaError::OutOfRange);
        }

        if offset < self.low_offset {
            self.low_offset = offset;
        }
        if end > self.high_offset {
            self.high_offset = end;
        }

        self.nvm.write_block(new.app_start() + offset, data)?;
        Ok(())
    }

    /// Finish the transfer: verify the staged payload and commit the New
    /// descriptor. Whatever the outcome, the session is over afterwards.
    ///
    /// On verification failure no descriptor is written; the staged bytes
    /// stay in flash but nothing references them, so the boot path never
    /// sees them.
    pub fn close<V: SignatureVerify>(
        &mut self,
        verifier: &mut V,
        signature: &[u8],
    ) -> Result<ImageDescriptor, OtaError> {
        let result = self.finish(verifier, signature);
        self.active = false;
        result
    }

    /// Drop the transfer without touching flash.
    pub fn abort(&mut self) {
        log::info!("ota: session aborted");
        self.active = false;
    }

    fn finish<V: SignatureVerify>(
        &mut self,
        verifier: &mut V,
        signature: &[u8],
    ) -> Result<ImageDescriptor, OtaError> {
        if !self.active {
            return Err(OtaError::NoSession);
        }
        if self.high_offset <= self.low_offset {
            return Err(OtaError::EmptyImage);
        }

        let new = self.layout.new_partition();
        let window = self.layout.window();

        verifier.begin();
        self.feed(new.app_start() + self.low_offset, self.written(), |chunk| {
            verifier.update(chunk)
        })?;
        if !verifier.finish(signature) {
            log::warn!("ota: signature verification failed");
            return Err(OtaError::Signature);
        }

        let mut crc = Crc32::new();
        self.feed(new.app_start() + self.low_offset, self.written(), |chunk| {
            crc.update(chunk)
        })?;

        // The staged image must carry its own vector table; the reset
        // vector read back from it becomes the descriptor entry address.
        let entry_address = self
            .nvm
            .read_u32(new.app_start() + self.low_offset + RESET_VECTOR_OFFSET)?;

        // Version is one past the image currently in place. A blank Run
        // descriptor reads back as all-ones, which wraps to zero; zero is
        // reserved, so the sequence restarts at one either way.
        let run_version = descriptor::read(self.nvm, &self.layout.run())?.version;
        let version = match run_version.wrapping_add(1) {
            0 => 1,
            v => v,
        };

        let dcpt = ImageDescriptor {
            header: ImageHeader::new(ImageFlag::New),
            version,
            start_address: window.low() + self.low_offset,
            end_address: window.low() + self.high_offset,
            entry_address,
            crc: crc.finalize(),
            reserved: 0xFFFF_FFFF,
        };
        self.nvm.write_block(new.dcpt_start(), &dcpt.to_bytes())?;
        log::info!("ota: committed image version {}", version);
        Ok(dcpt)
    }

    fn written(&self) -> u32 {
        self.high_offset - self.low_offset
    }

    /// Stream `len` staged bytes starting at `address` through `sink`.
    fn feed(
        &self,
        mut address: u32,
        mut len: u32,
        mut sink: impl FnMut(&[u8]),
    ) -> Result<(), NvmError> {
        let mut buf = [0u8; 256];
        while len != 0 {
            let take = len.min(buf.len() as u32) as usize;
            self.nvm.read(address, &mut buf[..take])?;
            sink(&buf[..take]);
            address += take as u32;
            len -= take as u32;
        }
        Ok(())
    }
}

/// Image state as seen by the running application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageState {
    /// The image in place is accepted, or staged and not yet launched.
    Valid,
    /// Nothing runnable is described.
    Invalid,
    /// The running image was launched under test and has not confirmed
    /// health yet.
    PendingCommit,
    /// State could not be determined.
    Unknown,
}

/// State change requested by the running application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageStateRequest {
    /// Self test passed; commit the image.
    Accepted,
    /// Self test failed.
    Rejected,
    /// Update abandoned.
    Aborted,
    /// Self test started; no flash change.
    Testing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StateError {
    /// The Run image is not under test, so there is nothing to commit.
    NotPendingCommit,
    /// Flash operation failed.
    Nvm(NvmError),
}

impl core::fmt::Display for StateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotPendingCommit => write!(f, "image is not pending commit"),
            Self::Nvm(err) => write!(f, "flash failure: {err}"),
        }
    }
}

impl From<NvmError> for StateError {
    fn from(err: NvmError) -> Self {
        Self::Nvm(err)
    }
}

/// State of the image the device is running, read from the Run descriptor.
pub fn platform_image_state<C: NvmController>(
    nvm: &Nvm<C>,
    layout: &FlashLayout,
) -> Result<ImageState, NvmError> {
    let dcpt = descriptor::read(nvm, &layout.run())?;
    if dcpt.header.signature != consts::IMAGE_SIGNATURE {
        return Ok(ImageState::Invalid);
    }
    Ok(match dcpt.header.flag() {
        ImageFlag::Test => ImageState::PendingCommit,
        ImageFlag::Valid | ImageFlag::New => ImageState::Valid,
        _ => ImageState::Invalid,
    })
}

/// Apply a state change requested by the running application.
///
/// `Accepted` commits a TEST image to VALID and is rejected in any other
/// state. `Rejected`/`Aborted` mark a TEST image INVALID; outside a self
/// test they discard whatever is staged in the New partition instead. Every
/// flag rewrite only clears bits, so the descriptor page takes the new
/// record without an erase.
pub fn set_platform_image_state<C: NvmController>(
    nvm: &mut Nvm<C>,
    layout: &FlashLayout,
    request: ImageStateRequest,
) -> Result<(), StateError> {
    let run = layout.run();
    let dcpt = descriptor::read(nvm, &run)?;

    if dcpt.header.flag() != ImageFlag::Test {
        return match request {
            ImageStateRequest::Testing => Ok(()),
            ImageStateRequest::Accepted => Err(StateError::NotPendingCommit),
            ImageStateRequest::Rejected | ImageStateRequest::Aborted => {
                let new = layout.new_partition();
                nvm.erase(new.dcpt_start(), new.span_pages())?;
                Ok(())
            }
        };
    }

    let flag = match request {
        ImageStateRequest::Testing => return Ok(()),
        ImageStateRequest::Accepted => ImageFlag::Valid,
        ImageStateRequest::Rejected | ImageStateRequest::Aborted => ImageFlag::Invalid,
    };
    let mut copy = dcpt;
    copy.header.flags = flag.raw();
    nvm.write_block(run.dcpt_start(), &copy.to_bytes())?;
    log::info!("ota: run image marked {}", flag.raw());
    Ok(())
}

/// Reboot into the bootloader so a freshly staged image gets picked up.
pub fn activate_new_image<P: BootPlatform>(platform: &mut P) {
    log::info!("ota: resetting to activate the staged image");
    platform.system_reset();
}
