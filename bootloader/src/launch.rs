// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! One-way control transfer to an application image.
//!
//! This is the only place the crate gives up the CPU. Everything up to here
//! deals in validated descriptors; the jump itself cannot be checked by any
//! type system, so it is one narrow primitive taking an [`EntryPoint`] that
//! only the validation paths can produce.

use crate::boot::EntryPoint;

/// Jump to the image whose vector table sits at `entry`.
///
/// Reads the initial stack pointer and the reset vector from the table,
/// reprograms MSP and branches. Returns only if the stack pointer word is
/// blank (erased flash); otherwise the running program ends here and the
/// only way back is a full device reset.
///
/// # Safety
///
/// `entry` must point at the vector table of an image that was validated
/// this boot. Interrupts are disabled and never re-enabled; the image is
/// expected to set up its own vector table and interrupt state.
pub unsafe fn jump_to_image(entry: EntryPoint) {
    let ivt = entry.address() as *const u32;
    let msp = ivt.read_volatile();
    let reset_vector = ivt.add(1).read_volatile();

    if msp == 0xFFFF_FFFF {
        // Blank vector table; nothing to run.
        return;
    }

    cortex_m::interrupt::disable();

    core::arch::asm!(
        "msr MSP, {msp}",
        "bx {reset_vector}",
        msp = in(reg) msp,
        reset_vector = in(reg) reset_vector,
        options(noreturn),
    );
}
