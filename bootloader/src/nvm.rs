// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! NVM primitive layer.
//!
//! [`NvmController`] is the capability the hardware provides: single erase
//! and program commands plus readback. [`Nvm`] layers the policy on top:
//! granularity and alignment checks, splitting erases into the chunk sizes
//! the controller accepts, composing unaligned writes into whole program
//! pages, and scoping an interrupt-free critical section around each
//! hardware command (an interrupted program sequence corrupts the target
//! page). Nothing here retries: every command is attempted exactly once and
//! failures surface to the caller.

use consts::{NVM_ERASE_PAGES_MAX, NVM_ERASE_PAGES_MIN, NVM_PAGE_SIZE};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NvmError {
    /// The controller ready flag did not assert in time.
    Timeout,
    /// The target region is write-protected; unlock it first.
    Locked,
    /// The controller reported a program/erase failure.
    Flash,
    /// Address not aligned for the requested operation.
    Unaligned,
    /// Erase length is not expressible as a combination of the supported
    /// erase chunks.
    EraseGranularity,
    /// Operation extends past the device.
    OutOfRange,
    /// Buffer length does not match the requested page count.
    Length,
}

impl core::fmt::Display for NvmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Timeout => write!(f, "flash controller busy timeout"),
            Self::Locked => write!(f, "flash region locked"),
            Self::Flash => write!(f, "flash program/erase failure"),
            Self::Unaligned => write!(f, "unaligned flash address"),
            Self::EraseGranularity => write!(f, "erase length not chunk-expressible"),
            Self::OutOfRange => write!(f, "flash address out of range"),
            Self::Length => write!(f, "buffer length does not match page count"),
        }
    }
}

/// Raw flash controller commands, one hardware operation per call.
///
/// Implementations own the register sequence and the busy poll for one
/// command; they do not loop, split or retry. Addresses are absolute.
pub trait NvmController {
    /// First valid flash address.
    fn base(&self) -> u32;

    /// Device size in bytes.
    fn size(&self) -> u32;

    /// Erase `pages` program pages starting at `address`. Called only with
    /// a supported chunk size ([`NVM_ERASE_PAGES_MIN`] or
    /// [`NVM_ERASE_PAGES_MAX`]) and a chunk-aligned address.
    fn erase_chunk(&mut self, address: u32, pages: u32) -> Result<(), NvmError>;

    /// Program one full page. `address` is page-aligned and `data` is
    /// exactly one page. Programming a page that is not erased corrupts
    /// bits; the caller owns the erase-before-write ordering.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), NvmError>;

    /// Copy `buf.len()` bytes starting at `address` out of the array.
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), NvmError>;
}

/// Policy wrapper over an [`NvmController`].
pub struct Nvm<C> {
    ctrl: C,
}

impl<C: NvmController> Nvm<C> {
    pub fn new(ctrl: C) -> Self {
        Self { ctrl }
    }

    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    fn check_range(&self, address: u32, len: u32) -> Result<(), NvmError> {
        let base = self.ctrl.base();
        let end = base + self.ctrl.size();
        let Some(op_end) = address.checked_add(len) else {
            return Err(NvmError::OutOfRange);
        };
        if address < base || op_end > end {
            return Err(NvmError::OutOfRange);
        }
        Ok(())
    }

    /// Erase `page_count` pages starting at `address`.
    ///
    /// The request is validated before any hardware command is issued:
    /// `address` must be aligned to the minimum erase chunk and `page_count`
    /// a whole multiple of it. The span is then erased largest-chunk first,
    /// falling back to minimum chunks where alignment or the remainder
    /// requires it.
    pub fn erase(&mut self, address: u32, page_count: u32) -> Result<(), NvmError> {
        if address % (NVM_ERASE_PAGES_MIN * NVM_PAGE_SIZE) != 0 {
            return Err(NvmError::Unaligned);
        }
        if page_count == 0 || page_count % NVM_ERASE_PAGES_MIN != 0 {
            return Err(NvmError::EraseGranularity);
        }
        self.check_range(address, page_count * NVM_PAGE_SIZE)?;

        let mut addr = address;
        let mut left = page_count;
        while left != 0 {
            let pages = if left >= NVM_ERASE_PAGES_MAX
                && addr % (NVM_ERASE_PAGES_MAX * NVM_PAGE_SIZE) == 0
            {
                NVM_ERASE_PAGES_MAX
            } else {
                NVM_ERASE_PAGES_MIN
            };
            critical_section::with(|_| self.ctrl.erase_chunk(addr, pages))?;
            addr += pages * NVM_PAGE_SIZE;
            left -= pages;
        }
        Ok(())
    }

    /// Program `page_count` whole pages starting at the page-aligned
    /// `address`. `data` must be exactly `page_count` pages long.
    pub fn write(&mut self, address: u32, data: &[u8], page_count: u32) -> Result<(), NvmError> {
        if address % NVM_PAGE_SIZE != 0 {
            return Err(NvmError::Unaligned);
        }
        if data.len() != (page_count * NVM_PAGE_SIZE) as usize {
            return Err(NvmError::Length);
        }
        self.check_range(address, page_count * NVM_PAGE_SIZE)?;

        let page = NVM_PAGE_SIZE as usize;
        for (n, chunk) in data.chunks_exact(page).enumerate() {
            let addr = address + (n as u32) * NVM_PAGE_SIZE;
            critical_section::with(|_| self.ctrl.program_page(addr, chunk))?;
        }
        Ok(())
    }

    /// Program an arbitrary byte range.
    ///
    /// Boundary pages are composed into a page buffer padded with 0xFF;
    /// programming a 0xFF byte leaves the flash cell untouched, so bytes
    /// outside the range keep whatever value they had. Interior whole pages
    /// go straight to [`Nvm::write`]. Descriptors and partial structures are
    /// routinely shorter than a page, which is what this exists for.
    pub fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), NvmError> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(address, data.len() as u32)?;

        let page = NVM_PAGE_SIZE as usize;
        let mut addr = address;
        let mut data = data;

        let lead = (addr % NVM_PAGE_SIZE) as usize;
        if lead != 0 {
            let take = core::cmp::min(page - lead, data.len());
            let mut buf = [0xFFu8; NVM_PAGE_SIZE as usize];
            buf[lead..lead + take].copy_from_slice(&data[..take]);
            self.write(addr - lead as u32, &buf, 1)?;
            addr += take as u32;
            data = &data[take..];
        }

        let whole = data.len() / page * page;
        if whole != 0 {
            self.write(addr, &data[..whole], (whole / page) as u32)?;
            addr += whole as u32;
            data = &data[whole..];
        }

        if !data.is_empty() {
            let mut buf = [0xFFu8; NVM_PAGE_SIZE as usize];
            buf[..data.len()].copy_from_slice(data);
            self.write(addr, &buf, 1)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `address`.
    pub fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), NvmError> {
        self.check_range(address, buf.len() as u32)?;
        self.ctrl.read(address, buf)
    }

    /// Read one little-endian word.
    pub fn read_u32(&self, address: u32) -> Result<u32, NvmError> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

impl NorFlashError for NvmError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::Unaligned => NorFlashErrorKind::NotAligned,
            Self::OutOfRange => NorFlashErrorKind::OutOfBounds,
            _ => NorFlashErrorKind::Other,
        }
    }
}

impl<C: NvmController> ErrorType for Nvm<C> {
    type Error = NvmError;
}

// `embedded-storage` interop so the surrounding firmware can hand the NVM to
// ecosystem code. Trait offsets are device-relative; everything above works
// in absolute addresses.
impl<C: NvmController> ReadNorFlash for Nvm<C> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let address = self.ctrl.base() + offset;
        Nvm::read(self, address, bytes)
    }

    fn capacity(&self) -> usize {
        self.ctrl.size() as usize
    }
}

impl<C: NvmController> NorFlash for Nvm<C> {
    const WRITE_SIZE: usize = NVM_PAGE_SIZE as usize;
    const ERASE_SIZE: usize = (NVM_ERASE_PAGES_MIN * NVM_PAGE_SIZE) as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if to < from {
            return Err(NvmError::OutOfRange);
        }
        let address = self.ctrl.base() + from;
        Nvm::erase(self, address, (to - from) / NVM_PAGE_SIZE)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let address = self.ctrl.base() + offset;
        Nvm::write(self, address, bytes, (bytes.len() as u32) / NVM_PAGE_SIZE)
    }
}
