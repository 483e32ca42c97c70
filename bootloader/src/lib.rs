// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware-update bootloader core.
//!
//! On every power-up the boot state machine validates the image descriptors
//! of the Run and New partitions, promotes a freshly staged image when it is
//! newer than the one in place, and hands the CPU to the winner. The OTA
//! session is the other half of the story: it streams a downloaded image
//! into the New partition and commits its descriptor only after the payload
//! has been signature-checked, so a power cut at any point leaves the old
//! image bootable.
//!
//! Everything that touches hardware goes through capability traits
//! ([`nvm::NvmController`], [`boot::BootPlatform`], [`ota::SignatureVerify`])
//! so the whole core runs against in-memory fakes on the host.

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "log", not(feature = "defmt")))]
pub(crate) use logger_crate as log;

#[cfg(not(any(feature = "defmt", feature = "log")))]
pub(crate) mod log {
    macro_rules! info {
        ($($arg:expr),* $(,)?) => {{ $( let _ = &$arg; )* }};
    }
    pub(crate) use info;
    macro_rules! warner {
        ($($arg:expr),* $(,)?) => {{ $( let _ = &$arg; )* }};
    }
    pub(crate) use warner as warn;
    macro_rules! error {
        ($($arg:expr),* $(,)?) => {{ $( let _ = &$arg; )* }};
    }
    pub(crate) use error;
}

pub mod boot;
pub mod crc;
pub mod descriptor;
pub mod layout;
pub mod nvm;
pub mod ota;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod launch;


pub use boot::{BootMachine, BootOptions, BootPlatform, BootState, EntryPoint};
pub use crc::{crc32, Crc32};
pub use descriptor::{ImageDescriptor, ImageFlag, ImageHeader, ValidateError};
pub use layout::{FlashLayout, ImageWindow, LayoutError, Partition};
pub use nvm::{Nvm, NvmController, NvmError};
pub use ota::{ImageState, ImageStateRequest, OtaError, OtaSession, SignatureVerify, StateError};
