#![no_std]

//! Flash geometry and partition layout shared by the bootloader and the
//! application build. All addresses are absolute flash addresses.

/// Size in bytes of one NVM program page.
/// The flash controller programs whole pages at a time; anything smaller has
/// to be composed into a page buffer by the caller.
pub const NVM_PAGE_SIZE: u32 = 512;

/// Smallest number of pages a single erase command may cover (8 KiB).
/// Erase requests must be aligned to this chunk and sized in multiples of it.
pub const NVM_ERASE_PAGES_MIN: u32 = 16;

/// Largest number of pages a single erase command may cover (16 KiB).
/// Large erase requests are split into these first, with the remainder done
/// in minimum-size chunks.
pub const NVM_ERASE_PAGES_MAX: u32 = 32;

/// Size in bytes of the smallest erasable flash chunk.
pub const NVM_ERASE_CHUNK_MIN: u32 = NVM_ERASE_PAGES_MIN * NVM_PAGE_SIZE;

/// Base address of the on-chip flash.
pub const FLASH_BASE: u32 = 0x0040_0000;

/// Total size of the on-chip flash (2 MiB).
pub const FLASH_SIZE: u32 = 0x0020_0000;

/// Flash reserved for the bootloader itself, starting at `FLASH_BASE`.
/// The image partitions begin immediately after this region.
pub const BOOTLOADER_RESERVED: u32 = 0x0001_0000;

/// Size of one image partition: a one-page descriptor slot followed by the
/// image body. Must be a whole multiple of `NVM_ERASE_CHUNK_MIN` so a
/// partition can be erased in one pass before it is rewritten.
pub const PARTITION_SIZE: u32 = 0x000A_0000;

/// Largest image body a partition can hold.
pub const IMAGE_MAX_SIZE: u32 = PARTITION_SIZE - NVM_PAGE_SIZE;

/// Descriptor slot of the Run partition, the partition the CPU boots from.
pub const RUN_DCPT_START: u32 = FLASH_BASE + BOOTLOADER_RESERVED;

/// First byte of the Run image body, one program page past the descriptor.
pub const RUN_APP_START: u32 = RUN_DCPT_START + NVM_PAGE_SIZE;

/// One past the last byte of the Run partition.
pub const RUN_APP_END: u32 = RUN_DCPT_START + PARTITION_SIZE;

/// Descriptor slot of the New partition, the staging area for a freshly
/// downloaded image. Starts right after the Run partition, which keeps it
/// aligned to the minimum erase chunk.
pub const NEW_DCPT_START: u32 = RUN_APP_END;

/// First byte of the New image body.
pub const NEW_APP_START: u32 = NEW_DCPT_START + NVM_PAGE_SIZE;

/// One past the last byte of the New partition.
pub const NEW_APP_END: u32 = NEW_DCPT_START + PARTITION_SIZE;

/// Descriptor slot of the Save partition, the backup of the last known-good
/// Run image. Only laid out in the three-partition configuration.
pub const SAVE_DCPT_START: u32 = NEW_APP_END;

/// First byte of the Save image body.
pub const SAVE_APP_START: u32 = SAVE_DCPT_START + NVM_PAGE_SIZE;

/// One past the last byte of the Save partition.
pub const SAVE_APP_END: u32 = SAVE_DCPT_START + PARTITION_SIZE;

/// 7-byte ASCII constant identifying a descriptor written by this firmware
/// family. A descriptor whose signature bytes differ is not a candidate for
/// execution, whatever the rest of its fields say.
pub const IMAGE_SIGNATURE: [u8; 7] = *b"@FWIMG1";

/// Offset of the reset-vector word inside an image's vector table. The word
/// at the image start is the initial stack pointer; the word at this offset
/// is the address execution starts from. Toolchain convention, kept in one
/// place because nothing on flash declares it.
pub const RESET_VECTOR_OFFSET: u32 = 4;

/// Address probed for a factory-programmed fallback image when no partition
/// holds a valid descriptor.
pub const DEFAULT_IMAGE_START: u32 = RUN_APP_START;

/// Seconds to wait in the fatal state before forcing a system reset, so any
/// queued diagnostics can drain.
pub const FATAL_RESET_DELAY_SECS: u64 = 1;
