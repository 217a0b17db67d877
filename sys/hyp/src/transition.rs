// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving a core from the host into the hypervisor.
//!
//! The first half of the protocol is the entry stub in `arch`: it reads the
//! debug console address from the image header while still in the host's
//! mapping, saves the host's vector table via the stub call, installs the
//! bootstrap vectors and traps into EL2. The bootstrap vector for "HVC from
//! lower EL" finds this core's per-CPU area, fills in its `EntryFrame`,
//! points the stack at it and calls `bootstrap`.
//!
//! From here on we have a stack but translation is still off, so nothing
//! below may fault.

use core::ptr::{self, addr_of, addr_of_mut};

use crate::arch;
use crate::fail::{abort_core, Abort};
use crate::percpu::{self, GuestRegisters, PerCpuArea, FIRST_CALLEE_SAVED};

pub const ESR_EC_SHIFT: u32 = 26;
/// Exception class of an HVC from AArch64 state.
pub const ESR_EC_HVC64: u64 = 0x16;

pub fn exception_class(esr: u64) -> u64 {
    (esr >> ESR_EC_SHIFT) & 0x3f
}

/// What the hypervisor proper is entered with.
#[derive(Debug)]
pub struct Handoff {
    pub cpu_id: u64,
    pub percpu: *mut PerCpuArea,
}

/// Brings the core into a state where the hypervisor can run: permanent
/// vectors, bootstrap map live, per-CPU base set, and the host's
/// callee-saved registers parked in the guest register area so the host
/// can later be resumed.
///
/// Stops the core if the entry trap was not an HVC or the image and debug
/// console can't be mapped apart.
///
/// # Safety
///
/// `area` must be this core's per-CPU area with `entry` filled in by the
/// entry stub, and the current stack must lie below its guest register
/// area.
pub unsafe fn prepare(area: *mut PerCpuArea, image_base: u64) -> Handoff {
    let frame = ptr::read(addr_of!((*area).entry));

    if exception_class(frame.esr) != ESR_EC_HVC64 {
        abort_core(Abort::UnexpectedTrap { esr: frame.esr });
    }

    arch::set_vectors(arch::hyp_vectors());

    let tables = &mut *addr_of_mut!((*area).bootstrap);
    let root = match tables.build(image_base, frame.debug_console) {
        Ok(root) => root,
        Err(e) => abort_core(Abort::BootMap(e)),
    };
    arch::enable_translation(root);

    arch::set_percpu_base(area as u64);

    let mut regs = GuestRegisters::default();
    regs.usr[FIRST_CALLEE_SAVED..].copy_from_slice(&frame.callee_saved);
    ptr::write(percpu::guest_registers(area), regs);

    addr_of_mut!((*area).saved_vectors).write(frame.host_vectors);
    addr_of_mut!((*area).cpu_id).write(frame.cpu_id);

    Handoff {
        cpu_id: frame.cpu_id,
        percpu: area,
    }
}

/// Rust side of the EL2 entry. Never returns: the hypervisor proper either
/// runs forever or hands the core back through `shutdown`.
///
/// # Safety
///
/// As for `prepare`.
pub unsafe fn bootstrap(area: *mut PerCpuArea) -> ! {
    let handoff = prepare(area, arch::image_base());
    arch::call_core_entry(handoff.cpu_id, handoff.percpu);
    abort_core(Abort::EntryReturned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchOp, FAKE_HYP_VECTORS, FAKE_IMAGE_BASE};
    use crate::percpu::EntryFrame;
    use std::panic::AssertUnwindSafe;
    use zerocopy::FromZeros;

    const HOST_VECTORS: u64 = 0xffff_8000_1008_0800;
    const CONSOLE: u64 = 0x0900_0000;
    /// EC = HVC64, IL set, imm16 = 0.
    const HVC_ESR: u64 = (ESR_EC_HVC64 << ESR_EC_SHIFT) | (1 << 25);

    fn entered_area(cpu_id: u64, esr: u64, console: u64) -> Box<PerCpuArea> {
        let mut area = PerCpuArea::new_box_zeroed().unwrap();
        let mut callee_saved = [0; percpu::CALLEE_SAVED];
        for (n, r) in callee_saved.iter_mut().enumerate() {
            *r = 0x1800 + n as u64;
        }
        area.entry = EntryFrame {
            cpu_id,
            esr,
            host_vectors: HOST_VECTORS,
            debug_console: console,
            callee_saved,
        };
        // Leftovers from a previous run must not leak into the guest frame.
        area.stack.fill(0xa5);
        area
    }

    #[test]
    fn hvc_entry_prepares_core() {
        let mut area = entered_area(3, HVC_ESR, CONSOLE);
        let base: *mut PerCpuArea = &mut *area;
        let _ = arch::take_log();

        let handoff = unsafe { prepare(base, FAKE_IMAGE_BASE) };
        assert_eq!(handoff.cpu_id, 3);
        assert_eq!(handoff.percpu, base);

        let root = &area.bootstrap.root as *const _ as u64;
        assert_eq!(
            arch::take_log(),
            [
                ArchOp::SetVectors(FAKE_HYP_VECTORS),
                ArchOp::CleanInvalidateDcache {
                    start: &area.bootstrap as *const _ as usize,
                    len: 3 * 4096,
                },
                ArchOp::FlushHypTlbs,
                ArchOp::EnableTranslation { root },
                ArchOp::SetPercpuBase(base as u64),
            ]
        );
        let cpu = arch::cpu_state();
        assert!(cpu.translation);
        assert_eq!(cpu.vbar, FAKE_HYP_VECTORS);
        assert_eq!(percpu::this_area(), base);

        assert_eq!(area.saved_vectors, HOST_VECTORS);
        assert_eq!(area.cpu_id, 3);

        let regs = unsafe { &*percpu::guest_registers(base) };
        assert_eq!(regs.exit_reason, 0);
        assert!(regs.usr[..FIRST_CALLEE_SAVED].iter().all(|&r| r == 0));
        assert_eq!(regs.usr[18], 0x1800);
        assert_eq!(regs.usr[30], 0x1800 + 12);

        let walk = |va| area.bootstrap.walk(va).map(|(pa, _, _)| pa);
        assert_eq!(walk(FAKE_IMAGE_BASE), Some(FAKE_IMAGE_BASE));
        assert_eq!(walk(CONSOLE), Some(CONSOLE));
    }

    #[test]
    #[should_panic(expected = "unexpected trap at entry")]
    fn non_hvc_trap_stops_core() {
        // EC 0x15 is an SVC.
        let mut area = entered_area(0, 0x15 << ESR_EC_SHIFT, CONSOLE);
        unsafe { prepare(&mut *area, FAKE_IMAGE_BASE) };
    }

    #[test]
    fn unexpected_trap_touches_nothing() {
        let mut area = entered_area(0, 0, CONSOLE);
        let _ = arch::take_log();
        let r = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            prepare(&mut *area, FAKE_IMAGE_BASE)
        }));
        assert!(r.is_err());
        assert!(arch::take_log().is_empty());
    }

    #[test]
    #[should_panic(expected = "bootstrap map")]
    fn colliding_console_stops_core() {
        let mut area = entered_area(1, HVC_ESR, FAKE_IMAGE_BASE + 0x1000);
        unsafe { prepare(&mut *area, FAKE_IMAGE_BASE) };
    }

    #[test]
    fn returning_entry_stops_core() {
        let mut area = entered_area(2, HVC_ESR, CONSOLE);
        let base: *mut PerCpuArea = &mut *area;
        let _ = arch::take_log();

        let r = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            bootstrap(base)
        }));
        let msg = r.unwrap_err();
        let msg = msg.downcast_ref::<String>().unwrap();
        assert!(msg.contains("hypervisor entry returned"));

        let log = arch::take_log();
        assert_eq!(
            log.last(),
            Some(&ArchOp::CoreEntry {
                cpu_id: 2,
                percpu: base as usize
            })
        );
    }
}
