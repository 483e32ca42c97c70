// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Partition layout model.
//!
//! A [`Partition`] is a one-page descriptor slot followed by an image body;
//! a [`FlashLayout`] is the set of partitions plus the image address window.
//! Geometry is validated when a layout is constructed, not when flash is
//! touched, so out-of-range arithmetic shows up as a [`LayoutError`] instead
//! of a corrupted partition later.

use consts::{
    DEFAULT_IMAGE_START, NEW_DCPT_START, NVM_ERASE_CHUNK_MIN, NVM_PAGE_SIZE, PARTITION_SIZE,
    RUN_APP_END, RUN_APP_START, RUN_DCPT_START,
};

#[cfg(feature = "save-partition")]
use consts::SAVE_DCPT_START;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    /// Partition does not start on an erase-chunk boundary.
    Alignment,
    /// Partition span is not a whole multiple of the minimum erase chunk,
    /// or is too small to hold a descriptor and a body.
    Size,
    /// Two partitions overlap.
    Overlap,
    /// The image window does not fit inside the Run partition body, or a
    /// staging partition body is smaller than the window.
    Window,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Alignment => write!(f, "partition not erase-chunk aligned"),
            Self::Size => write!(f, "partition span not erase-chunk sized"),
            Self::Overlap => write!(f, "partitions overlap"),
            Self::Window => write!(f, "image window does not fit the layout"),
        }
    }
}

/// One flash partition: descriptor page plus image body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Partition {
    dcpt_start: u32,
    app_end: u32,
}

impl Partition {
    /// Lay out a partition of `size` bytes starting at `dcpt_start`.
    ///
    /// The whole span must be erasable in one pass, so the start has to sit
    /// on an erase-chunk boundary and the size has to be a multiple of the
    /// minimum chunk.
    pub fn new(dcpt_start: u32, size: u32) -> Result<Self, LayoutError> {
        if dcpt_start % NVM_ERASE_CHUNK_MIN != 0 {
            return Err(LayoutError::Alignment);
        }
        if size < NVM_ERASE_CHUNK_MIN || size % NVM_ERASE_CHUNK_MIN != 0 {
            return Err(LayoutError::Size);
        }
        Ok(Self {
            dcpt_start,
            app_end: dcpt_start + size,
        })
    }

    /// Address of the descriptor slot (also the start of the span).
    pub const fn dcpt_start(&self) -> u32 {
        self.dcpt_start
    }

    /// First byte of the image body, one program page past the descriptor.
    pub const fn app_start(&self) -> u32 {
        self.dcpt_start + NVM_PAGE_SIZE
    }

    /// One past the last byte of the span.
    pub const fn app_end(&self) -> u32 {
        self.app_end
    }

    /// Whole span in bytes, descriptor slot included.
    pub const fn span(&self) -> u32 {
        self.app_end - self.dcpt_start
    }

    /// Whole span in program pages.
    pub const fn span_pages(&self) -> u32 {
        self.span() / NVM_PAGE_SIZE
    }

    /// Largest image body this partition can hold.
    pub const fn body_len(&self) -> u32 {
        self.app_end - self.app_start()
    }

    const fn overlaps(&self, other: &Partition) -> bool {
        self.dcpt_start < other.app_end && other.dcpt_start < self.app_end
    }
}

/// The address window an image is allowed to occupy. Descriptor start and
/// end addresses are validated against it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageWindow {
    low: u32,
    high: u32,
}

impl ImageWindow {
    pub const fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    pub const fn low(&self) -> u32 {
        self.low
    }

    pub const fn high(&self) -> u32 {
        self.high
    }

    pub const fn len(&self) -> u32 {
        self.high - self.low
    }

    pub const fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    pub const fn contains(&self, address: u32) -> bool {
        self.low <= address && address < self.high
    }
}

/// The build-time flash layout: Run and New partitions, the optional Save
/// partition, the image window and the fallback image address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashLayout {
    run: Partition,
    new: Partition,
    save: Option<Partition>,
    window: ImageWindow,
    default_image: Option<u32>,
}

impl FlashLayout {
    pub fn new(
        run: Partition,
        new: Partition,
        save: Option<Partition>,
        window: ImageWindow,
        default_image: Option<u32>,
    ) -> Result<Self, LayoutError> {
        if run.overlaps(&new) {
            return Err(LayoutError::Overlap);
        }
        if let Some(save) = &save {
            if save.overlaps(&run) || save.overlaps(&new) {
                return Err(LayoutError::Overlap);
            }
        }
        if window.is_empty() || window.low() < run.app_start() || window.high() > run.app_end() {
            return Err(LayoutError::Window);
        }
        // Promotion copies an image to the same offsets in another body, so
        // every staging body must be able to hold the whole window.
        if new.body_len() < window.len() {
            return Err(LayoutError::Window);
        }
        if let Some(save) = &save {
            if save.body_len() < window.len() {
                return Err(LayoutError::Window);
            }
        }
        Ok(Self {
            run,
            new,
            save,
            window,
            default_image,
        })
    }

    /// The layout baked into this build, from the `consts` crate. Checked
    /// against [`FlashLayout::new`] in the test suite.
    pub const fn board() -> Self {
        const fn partition(dcpt_start: u32) -> Partition {
            Partition {
                dcpt_start,
                app_end: dcpt_start + PARTITION_SIZE,
            }
        }
        Self {
            run: partition(RUN_DCPT_START),
            new: partition(NEW_DCPT_START),
            #[cfg(feature = "save-partition")]
            save: Some(partition(SAVE_DCPT_START)),
            #[cfg(not(feature = "save-partition"))]
            save: None,
            window: ImageWindow::new(RUN_APP_START, RUN_APP_END),
            default_image: Some(DEFAULT_IMAGE_START),
        }
    }

    pub const fn run(&self) -> Partition {
        self.run
    }

    pub const fn new_partition(&self) -> Partition {
        self.new
    }

    pub const fn save(&self) -> Option<Partition> {
        self.save
    }

    pub const fn window(&self) -> ImageWindow {
        self.window
    }

    pub const fn default_image(&self) -> Option<u32> {
        self.default_image
    }

    /// Translate a window address to where those bytes live in `partition`.
    /// Images keep their window offsets when staged, so this is a plain
    /// rebase onto the partition body.
    pub const fn staged_address(&self, partition: &Partition, window_address: u32) -> u32 {
        partition.app_start() + (window_address - self.window.low())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_rejects_bad_geometry() {
        assert_eq!(
            Partition::new(NVM_PAGE_SIZE, NVM_ERASE_CHUNK_MIN),
            Err(LayoutError::Alignment)
        );
        assert_eq!(
            Partition::new(0, NVM_ERASE_CHUNK_MIN + NVM_PAGE_SIZE),
            Err(LayoutError::Size)
        );
        assert_eq!(Partition::new(0, 0), Err(LayoutError::Size));
    }

    #[test]
    fn layout_rejects_overlap() {
        let a = Partition::new(0, 2 * NVM_ERASE_CHUNK_MIN).unwrap();
        let b = Partition::new(NVM_ERASE_CHUNK_MIN, 2 * NVM_ERASE_CHUNK_MIN).unwrap();
        let window = ImageWindow::new(a.app_start(), a.app_end());
        assert_eq!(
            FlashLayout::new(a, b, None, window, None),
            Err(LayoutError::Overlap)
        );
    }

    #[test]
    fn layout_rejects_window_outside_run() {
        let a = Partition::new(0, 2 * NVM_ERASE_CHUNK_MIN).unwrap();
        let b = Partition::new(2 * NVM_ERASE_CHUNK_MIN, 2 * NVM_ERASE_CHUNK_MIN).unwrap();
        let window = ImageWindow::new(a.dcpt_start(), a.app_end());
        assert_eq!(
            FlashLayout::new(a, b, None, window, None),
            Err(LayoutError::Window)
        );
    }

    #[test]
    fn board_layout_is_well_formed() {
        let board = FlashLayout::board();
        let rebuilt = FlashLayout::new(
            Partition::new(board.run().dcpt_start(), board.run().span()).unwrap(),
            Partition::new(board.new_partition().dcpt_start(), board.new_partition().span())
                .unwrap(),
            board
                .save()
                .map(|save| Partition::new(save.dcpt_start(), save.span()).unwrap()),
            board.window(),
            board.default_image(),
        )
        .unwrap();
        assert_eq!(board, rebuilt);
    }
}
