// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handing a core back to the host.
//!
//! This mirrors `transition`: translation off, per-CPU base cleared, the
//! host's vector table reinstalled, then an exception return into the host
//! with the registers saved in the guest frame.
//!
//! Caches are not cleaned before translation goes off. Lines this core
//! wrote stay valid for this core, and the host's own invalidates are
//! upgraded to clean+invalidate by the hardware while it runs virtualized.

use core::ptr::{self, addr_of};

use crate::arch;
use crate::percpu::{self, GuestRegisters, PerCpuArea};

/// Tears down EL2 state on the calling core and returns the register frame
/// to resume the host with.
///
/// # Safety
///
/// `area` must be the calling core's per-CPU area, set up by
/// `transition::prepare`. After this returns only register-held values are
/// trustworthy.
pub unsafe fn prepare_handback(area: *mut PerCpuArea) -> *mut GuestRegisters {
    uassert!(arch::percpu_base() == area as u64);

    let host_vectors = ptr::read(addr_of!((*area).saved_vectors));
    let regs = percpu::guest_registers(area);

    arch::disable_translation();
    arch::set_percpu_base(0);
    arch::set_vectors(host_vectors);

    regs
}

/// Returns the calling core to the host, which sees `ret` in `x0`.
///
/// # Safety
///
/// As for `prepare_handback`.
pub unsafe fn handback(area: *mut PerCpuArea, ret: u64) -> ! {
    let regs = prepare_handback(area);
    arch::return_to_host(regs, ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchOp;
    use crate::percpu::EntryFrame;
    use crate::transition::{self, ESR_EC_HVC64, ESR_EC_SHIFT};
    use zerocopy::FromZeros;

    fn running_area() -> Box<PerCpuArea> {
        let mut area = PerCpuArea::new_box_zeroed().unwrap();
        area.entry = EntryFrame {
            cpu_id: 1,
            esr: ESR_EC_HVC64 << ESR_EC_SHIFT,
            host_vectors: 0xffff_8000_1008_0800,
            debug_console: 0x0900_0000,
            callee_saved: [7; percpu::CALLEE_SAVED],
        };
        unsafe { transition::prepare(&mut *area, arch::image_base()) };
        area
    }

    #[test]
    fn handback_restores_host_state() {
        let mut area = running_area();
        let base: *mut PerCpuArea = &mut *area;
        let _ = arch::take_log();

        let regs = unsafe { prepare_handback(base) };

        assert_eq!(regs, percpu::guest_registers(base));
        assert_eq!(
            arch::take_log(),
            [
                ArchOp::DisableTranslation,
                ArchOp::SetPercpuBase(0),
                ArchOp::SetVectors(0xffff_8000_1008_0800),
            ]
        );
        let cpu = arch::cpu_state();
        assert!(!cpu.translation);
        assert_eq!(cpu.vbar, 0xffff_8000_1008_0800);
        assert_eq!(cpu.tpidr, 0);
        assert_eq!(unsafe { (*regs).usr[29] }, 7);
    }

    #[test]
    #[should_panic(expected = "returned to host")]
    fn handback_does_not_return() {
        let mut area = running_area();
        unsafe { handback(&mut *area, 0) };
    }
}
