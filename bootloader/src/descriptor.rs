// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! On-flash image descriptor and its validation.
//!
//! A descriptor is the 32-byte record at the start of a partition that
//! identifies and describes the image staged in that partition's body. It
//! owns the whole first program page so it can be rewritten independently of
//! the body. Writing a descriptor is the atomic commit point of every image
//! operation: body bytes always land before the descriptor that activates
//! them.

use crate::crc::Crc32;
use crate::layout::{FlashLayout, Partition};
use crate::nvm::{Nvm, NvmController, NvmError};
use consts::IMAGE_SIGNATURE;

/// Image lifecycle flag, the last byte of the header.
///
/// The values descend one cleared bit at a time so every legal transition
/// (erased → NEW → TEST → VALID/INVALID) can be programmed over the previous
/// value without erasing the descriptor page first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageFlag {
    /// Freshly staged by an OTA session, never launched.
    New,
    /// Launched at least once, not yet confirmed healthy by the running
    /// application.
    Test,
    /// Confirmed healthy.
    Valid,
    /// Rejected by the self test or the validator.
    Invalid,
    /// Erased flash or an unrecognized value.
    Unknown,
}

impl ImageFlag {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0xFE => Self::New,
            0xFC => Self::Test,
            0xF8 => Self::Valid,
            0xF0 => Self::Invalid,
            _ => Self::Unknown,
        }
    }

    pub const fn raw(self) -> u8 {
        match self {
            Self::New => 0xFE,
            Self::Test => 0xFC,
            Self::Valid => 0xF8,
            Self::Invalid => 0xF0,
            Self::Unknown => 0xFF,
        }
    }
}

/// Fixed 8-byte image header: signature constant plus lifecycle flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageHeader {
    pub signature: [u8; 7],
    pub flags: u8,
}

impl ImageHeader {
    pub const fn new(flag: ImageFlag) -> Self {
        Self {
            signature: IMAGE_SIGNATURE,
            flags: flag.raw(),
        }
    }

    pub const fn flag(&self) -> ImageFlag {
        ImageFlag::from_raw(self.flags)
    }
}

/// The 32-byte descriptor record.
///
/// `start_address`, `end_address` and `entry_address` are absolute flash
/// addresses inside the image window; `crc` covers exactly the body bytes
/// `[start_address, end_address)`, never the descriptor itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageDescriptor {
    pub header: ImageHeader,
    pub version: u32,
    pub start_address: u32,
    pub end_address: u32,
    pub entry_address: u32,
    pub crc: u32,
    pub reserved: u32,
}

impl ImageDescriptor {
    pub const SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..7].copy_from_slice(&self.header.signature);
        buf[7] = self.header.flags;
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.start_address.to_le_bytes());
        buf[16..20].copy_from_slice(&self.end_address.to_le_bytes());
        buf[20..24].copy_from_slice(&self.entry_address.to_le_bytes());
        buf[24..28].copy_from_slice(&self.crc.to_le_bytes());
        buf[28..32].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    /// Decode the raw record. Field extraction never fails; whether the
    /// fields make sense is [`validate`]'s job.
    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut signature = [0u8; 7];
        signature.copy_from_slice(&raw[..7]);
        Self {
            header: ImageHeader {
                signature,
                flags: raw[7],
            },
            version: word(8),
            start_address: word(12),
            end_address: word(16),
            entry_address: word(20),
            crc: word(24),
            reserved: word(28),
        }
    }
}

/// A record is blank when it is fully erased (0xFF) or fully zeroed (an
/// explicit invalidation). Blank is not corrupt: it is the ordinary state of
/// a partition with nothing staged.
pub fn is_blank(raw: &[u8; ImageDescriptor::SIZE]) -> bool {
    raw.iter().all(|&b| b == 0xFF) || raw.iter().all(|&b| b == 0x00)
}

/// Read the raw descriptor record of a partition.
pub fn read_raw<C: NvmController>(
    nvm: &Nvm<C>,
    partition: &Partition,
) -> Result<[u8; ImageDescriptor::SIZE], NvmError> {
    let mut raw = [0u8; ImageDescriptor::SIZE];
    nvm.read(partition.dcpt_start(), &mut raw)?;
    Ok(raw)
}

/// Read and decode the descriptor of a partition.
pub fn read<C: NvmController>(
    nvm: &Nvm<C>,
    partition: &Partition,
) -> Result<ImageDescriptor, NvmError> {
    Ok(ImageDescriptor::from_bytes(&read_raw(nvm, partition)?))
}

/// Why a descriptor failed validation. Callers only branch on Ok/Err; the
/// reason is for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ValidateError {
    /// Signature bytes differ from the application signature constant.
    Signature,
    /// Flag outside {NEW, TEST, VALID}.
    Flags,
    /// Start address outside the image window.
    StartAddress,
    /// End address outside the image window.
    EndAddress,
    /// Entry address outside `[start_address, end_address)`.
    EntryAddress,
    /// Body checksum mismatch.
    Crc,
    /// Flash readback failed while checking.
    Nvm(NvmError),
}

impl core::fmt::Display for ValidateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Signature => write!(f, "bad image signature"),
            Self::Flags => write!(f, "image flags not runnable"),
            Self::StartAddress => write!(f, "start address outside image window"),
            Self::EndAddress => write!(f, "end address outside image window"),
            Self::EntryAddress => write!(f, "entry address outside image"),
            Self::Crc => write!(f, "image body crc mismatch"),
            Self::Nvm(err) => write!(f, "flash readback failed: {err}"),
        }
    }
}

impl From<NvmError> for ValidateError {
    fn from(err: NvmError) -> Self {
        Self::Nvm(err)
    }
}

/// Which validation steps run. Diagnostics can bypass individual steps; the
/// address checks always run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ValidateChecks {
    pub signature: bool,
    pub flags: bool,
    pub crc: bool,
}

impl ValidateChecks {
    pub const fn all() -> Self {
        Self {
            signature: true,
            flags: true,
            crc: true,
        }
    }
}

impl Default for ValidateChecks {
    fn default() -> Self {
        Self::all()
    }
}

/// Validate the descriptor of `partition` against the image staged in its
/// body.
///
/// Steps run in a fixed order and stop at the first failure: signature,
/// flags, start address, end address, entry address, body CRC. Returns the
/// decoded descriptor when every enabled step passes.
pub fn validate<C: NvmController>(
    nvm: &Nvm<C>,
    layout: &FlashLayout,
    partition: &Partition,
    checks: ValidateChecks,
) -> Result<ImageDescriptor, ValidateError> {
    let dcpt = read(nvm, partition)?;
    let window = layout.window();

    if checks.signature && dcpt.header.signature != IMAGE_SIGNATURE {
        return Err(ValidateError::Signature);
    }

    if checks.flags
        && !matches!(
            dcpt.header.flag(),
            ImageFlag::New | ImageFlag::Test | ImageFlag::Valid
        )
    {
        return Err(ValidateError::Flags);
    }

    if !window.contains(dcpt.start_address) {
        return Err(ValidateError::StartAddress);
    }
    if !window.contains(dcpt.end_address) {
        return Err(ValidateError::EndAddress);
    }
    if dcpt.entry_address < dcpt.start_address || dcpt.entry_address >= dcpt.end_address {
        return Err(ValidateError::EntryAddress);
    }

    if checks.crc {
        // The entry check above guarantees start < end, so the length is
        // well defined.
        let mut crc = Crc32::new();
        let mut address = layout.staged_address(partition, dcpt.start_address);
        let mut left = dcpt.end_address - dcpt.start_address;
        let mut buf = [0u8; 256];
        while left != 0 {
            let take = left.min(buf.len() as u32) as usize;
            nvm.read(address, &mut buf[..take])?;
            crc.update(&buf[..take]);
            address += take as u32;
            left -= take as u32;
        }
        if crc.finalize() != dcpt.crc {
            return Err(ValidateError::Crc);
        }
    }

    Ok(dcpt)
}

/// Blank the descriptor of `partition` by overwriting the record with
/// zeros.
///
/// A descriptor that is already blank (fully erased or fully zeroed) is left
/// untouched: calling this twice issues no second flash command.
pub fn invalidate<C: NvmController>(
    nvm: &mut Nvm<C>,
    partition: &Partition,
) -> Result<(), NvmError> {
    let raw = read_raw(nvm, partition)?;
    if is_blank(&raw) {
        return Ok(());
    }
    nvm.write_block(partition.dcpt_start(), &[0u8; ImageDescriptor::SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImageDescriptor {
        ImageDescriptor {
            header: ImageHeader::new(ImageFlag::New),
            version: 7,
            start_address: 0x0200,
            end_address: 0x1200,
            entry_address: 0x0208,
            crc: 0xDEAD_BEEF,
            reserved: 0xFFFF_FFFF,
        }
    }

    #[test]
    fn roundtrip() {
        let dcpt = sample();
        let raw = dcpt.to_bytes();
        assert_eq!(ImageDescriptor::from_bytes(&raw), dcpt);
        // Spot-check the wire offsets.
        assert_eq!(&raw[..7], b"@FWIMG1");
        assert_eq!(raw[7], 0xFE);
        assert_eq!(raw[8..12], 7u32.to_le_bytes());
        assert_eq!(raw[24..28], 0xDEAD_BEEFu32.to_le_bytes());
    }

    #[test]
    fn flag_raw_roundtrip() {
        for flag in [
            ImageFlag::New,
            ImageFlag::Test,
            ImageFlag::Valid,
            ImageFlag::Invalid,
        ] {
            assert_eq!(ImageFlag::from_raw(flag.raw()), flag);
        }
        assert_eq!(ImageFlag::from_raw(0xFF), ImageFlag::Unknown);
        assert_eq!(ImageFlag::from_raw(0x42), ImageFlag::Unknown);
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(&[0xFF; ImageDescriptor::SIZE]));
        assert!(is_blank(&[0x00; ImageDescriptor::SIZE]));
        let mut raw = [0xFF; ImageDescriptor::SIZE];
        raw[3] = 0;
        assert!(!is_blank(&raw));
        assert!(!is_blank(&sample().to_bytes()));
    }
}
