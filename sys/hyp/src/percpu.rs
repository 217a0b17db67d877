// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layout of the per-core memory area.
//!
//! Each physical core owns one `PerCpuArea`. The areas sit back to back in
//! a pool, so core `n`'s area is at `pool_base + n * size_of::<PerCpuArea>()`.
//! The entry stub computes that address before any stack exists, which is
//! why the offsets it relies on are pinned below.
//!
//! ```text
//! +0                     bootstrap page tables (3 pages)
//! +STACK_BOTTOM          stack, growing down from STACK_TOP
//! +STACK_TOP - 256       GuestRegisters
//! +STACK_TOP             EntryFrame
//!                        saved_vectors, cpu_id
//! ```

use core::mem::{offset_of, size_of};

use static_assertions::const_assert_eq;
use zerocopy::{FromZeros, KnownLayout};

use crate::arch;
use crate::bootmap::BootstrapTables;
use crate::config::PERCPU_STACK_SIZE;

/// Number of registers the entry stub carries across the trap: x18 through
/// x29, then the caller's link register.
pub const CALLEE_SAVED: usize = 13;
/// Register number of `callee_saved[0]`.
pub const FIRST_CALLEE_SAVED: usize = 18;

/// Values the entry stub holds in registers across the privilege switch,
/// stored here once a per-core area is addressable.
#[derive(Copy, Clone, Debug, Default, FromZeros, KnownLayout)]
#[repr(C)]
pub struct EntryFrame {
    pub cpu_id: u64,
    /// Syndrome of the trap that brought us to EL2.
    pub esr: u64,
    /// Vector table that was installed before ours.
    pub host_vectors: u64,
    /// Read from the image header while still in the caller's mapping.
    pub debug_console: u64,
    pub callee_saved: [u64; CALLEE_SAVED],
}

/// Register save area for the code running below us.
#[derive(Clone, Debug, Default, FromZeros, KnownLayout)]
#[repr(C)]
pub struct GuestRegisters {
    pub exit_reason: u64,
    /// x0 through x30.
    pub usr: [u64; 31],
}

#[derive(FromZeros, KnownLayout)]
#[repr(C, align(4096))]
pub struct PerCpuArea {
    pub bootstrap: BootstrapTables,
    pub stack: [u8; PERCPU_STACK_SIZE],
    pub entry: EntryFrame,
    /// The host's vector table, restored on handback.
    pub saved_vectors: u64,
    pub cpu_id: u64,
}

impl PerCpuArea {
    pub const STACK_TOP: usize = offset_of!(PerCpuArea, entry);
    pub const REGS_OFFSET: usize =
        Self::STACK_TOP - size_of::<GuestRegisters>();
}

// The entry stub stores the frame with fixed `stp` offsets and treats the
// frame address as the stack top.
const_assert_eq!(
    offset_of!(PerCpuArea, stack) + PERCPU_STACK_SIZE,
    offset_of!(PerCpuArea, entry)
);
const_assert_eq!(offset_of!(EntryFrame, cpu_id), 0);
const_assert_eq!(offset_of!(EntryFrame, esr), 8);
const_assert_eq!(offset_of!(EntryFrame, host_vectors), 16);
const_assert_eq!(offset_of!(EntryFrame, debug_console), 24);
const_assert_eq!(offset_of!(EntryFrame, callee_saved), 32);
const_assert_eq!(size_of::<EntryFrame>(), 136);
const_assert_eq!(offset_of!(GuestRegisters, usr), 8);
const_assert_eq!(size_of::<GuestRegisters>(), 256);
const_assert_eq!(PerCpuArea::REGS_OFFSET % 16, 0);
const_assert_eq!(size_of::<PerCpuArea>() % 4096, 0);

/// Guest register area of `area`, directly below its stack top.
pub fn guest_registers(area: *mut PerCpuArea) -> *mut GuestRegisters {
    area.cast::<u8>()
        .wrapping_add(PerCpuArea::REGS_OFFSET)
        .cast::<GuestRegisters>()
}

/// The calling core's area, as installed by the privilege transition.
pub fn this_area() -> *mut PerCpuArea {
    arch::percpu_base() as *mut PerCpuArea
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_registers_end_at_stack_top() {
        let mut area = PerCpuArea::new_box_zeroed().unwrap();
        let base: *mut PerCpuArea = &mut *area;
        let regs = guest_registers(base) as usize;
        assert_eq!(
            regs + size_of::<GuestRegisters>(),
            base as usize + PerCpuArea::STACK_TOP
        );
        assert_eq!(
            base as usize + PerCpuArea::STACK_TOP,
            &area.entry as *const EntryFrame as usize
        );
    }

    #[test]
    fn consecutive_areas_are_one_stride_apart() {
        let pool = <[PerCpuArea]>::new_box_zeroed_with_elems(3).unwrap();
        let stride = size_of::<PerCpuArea>();
        for (n, area) in pool.iter().enumerate() {
            let expected = pool.as_ptr() as usize + n * stride;
            assert_eq!(area as *const PerCpuArea as usize, expected);
            assert_eq!(expected % 4096, 0);
        }
    }
}
