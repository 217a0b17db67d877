// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw hardware entry and EL2 primitives for 64-bit Arm.
//!
//! # Entry protocol
//!
//! The loader calls `arch_entry(cpu_id)` on each CPU, at EL1, in the host's
//! mapping of the image. The stub:
//!
//! 1. Reads `debug_console_base` from the image header. This is the last
//!    point where a value the loader just wrote is guaranteed to be seen.
//! 2. Asks the host's EL2 stub for its current vector table (`x0 = 0`,
//!    `hvc`), keeping the answer for handback.
//! 3. Installs `bootstrap_vectors` (`x0 = 1`, `x1 = table`, `hvc`), then
//!    traps again. The new table only applies to the trap after the one
//!    that installed it, hence the second `hvc`.
//!
//! Across all this, values live in registers only:
//!
//! | reg | contents |
//! |-----|----------|
//! | x14 | host vector table |
//! | x15 | debug console base |
//! | x16 | cpu id |
//! | x17 | caller's link register |
//!
//! The "synchronous, lower EL, AArch64" slot of `bootstrap_vectors` then
//! finds this CPU's `PerCpuArea`, stores those registers plus x18..x29 into
//! its `EntryFrame`, sets the stack to just below the guest register area
//! and calls `transition::bootstrap`.
//!
//! The image is linked at its physical address, so link-time addresses are
//! valid with translation off.

use core::arch::{asm, global_asm};
use core::cell::UnsafeCell;
use core::mem::{offset_of, size_of, MaybeUninit};

use abi::{HypervisorHeader, StubCall, HEADER_SIGNATURE};

use crate::config::MAX_CPUS;
use crate::fail::Abort;
use crate::percpu::{GuestRegisters, PerCpuArea};

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Memory written by the loader before any CPU enters.
#[repr(transparent)]
pub struct LoaderShared<T>(UnsafeCell<T>);

// Safety: written once by the loader while no CPU runs hypervisor code.
unsafe impl<T> Sync for LoaderShared<T> {}

/// Image header. `core_size` and `entry` are patched in when the image is
/// packaged; the loader fills in the run time fields.
#[used]
#[no_mangle]
#[link_section = ".header"]
pub static HYP_HEADER: LoaderShared<HypervisorHeader> =
    LoaderShared(UnsafeCell::new(HypervisorHeader {
        signature: HEADER_SIGNATURE,
        core_size: 0,
        percpu_size: size_of::<PerCpuArea>() as u64,
        entry: 0,
        max_cpus: MAX_CPUS as u32,
        online_cpus: 0,
        debug_console_base: 0,
    }));

/// Backing store for all per-CPU areas.
#[repr(transparent)]
pub struct PercpuPool(UnsafeCell<MaybeUninit<[PerCpuArea; MAX_CPUS]>>);

// Safety: each CPU only touches its own slot.
unsafe impl Sync for PercpuPool {}

#[no_mangle]
#[link_section = ".bss.percpu"]
pub static PERCPU_POOL: PercpuPool =
    PercpuPool(UnsafeCell::new(MaybeUninit::zeroed()));

extern "C" {
    /// Permanent EL2 vector table of the trap handling layer.
    #[link_name = "hyp_vectors"]
    static HYP_VECTORS: [u8; 0x800];

    /// The hypervisor proper. Does not return unless something is badly
    /// wrong.
    fn hypervisor_entry(cpu_id: u64, percpu: *mut PerCpuArea) -> u64;
}

global_asm!(
    ".section .text.entry, \"ax\"",
    ".global arch_entry",
    ".type arch_entry, %function",
    "arch_entry:",
    "    mov x16, x0",
    "    mov x17, x30",
    "    adrp x15, {header}",
    "    add x15, x15, :lo12:{header}",
    "    ldr x15, [x15, #{console}]",
    "    mov x0, #{get_vectors}",
    "    hvc #0",
    "    mov x14, x0",
    "    ldr x1, =bootstrap_vectors",
    "    mov x0, #{set_vectors}",
    "    hvc #0",
    "    hvc #0",
    "    b .",
    "",
    "el2_bootstrap_entry:",
    "    mrs x13, esr_el2",
    "    cmp x16, #{max_cpus}",
    "    b.hs 1f",
    "    adrp x12, {pool}",
    "    add x12, x12, :lo12:{pool}",
    "    ldr x11, ={area_size}",
    "    madd x12, x16, x11, x12",
    "    ldr x11, ={stack_top}",
    "    add x11, x12, x11",
    "    stp x16, x13, [x11, #0]",
    "    stp x14, x15, [x11, #16]",
    "    stp x18, x19, [x11, #32]",
    "    stp x20, x21, [x11, #48]",
    "    stp x22, x23, [x11, #64]",
    "    stp x24, x25, [x11, #80]",
    "    stp x26, x27, [x11, #96]",
    "    stp x28, x29, [x11, #112]",
    "    str x17, [x11, #128]",
    "    sub sp, x11, #{regs_size}",
    "    mov x0, x12",
    "    mov x29, xzr",
    "    mov x30, xzr",
    "    bl {bootstrap}",
    "1:  wfi",
    "    b 1b",
    "    .ltorg",
    "",
    ".section .text.vectors, \"ax\"",
    ".balign 0x800",
    ".global bootstrap_vectors",
    "bootstrap_vectors:",
    ".rept 8",
    "    b .",
    "    .balign 0x80",
    ".endr",
    "    b el2_bootstrap_entry",
    "    .balign 0x80",
    ".rept 7",
    "    b .",
    "    .balign 0x80",
    ".endr",
    header = sym HYP_HEADER,
    pool = sym PERCPU_POOL,
    bootstrap = sym el2_bootstrap,
    console = const offset_of!(HypervisorHeader, debug_console_base),
    get_vectors = const StubCall::GetVectors as u64,
    set_vectors = const StubCall::SetVectors as u64,
    max_cpus = const MAX_CPUS,
    area_size = const size_of::<PerCpuArea>(),
    stack_top = const PerCpuArea::STACK_TOP,
    regs_size = const size_of::<GuestRegisters>(),
);

#[no_mangle]
unsafe extern "C" fn el2_bootstrap(area: *mut PerCpuArea) -> ! {
    crate::transition::bootstrap(area)
}

/// SCTLR_EL2: MMU, data cache and instruction cache enables.
const SCTLR_M: u64 = 1 << 0;
const SCTLR_C: u64 = 1 << 2;
const SCTLR_I: u64 = 1 << 12;
const SCTLR_MMU_CACHES: u64 = SCTLR_M | SCTLR_C | SCTLR_I;

/// MAIR_EL2: attr0 normal write-back, attr1 device-nGnRnE.
const MAIR: u64 = 0x00ff;

/// TCR_EL2 without PS: 48-bit VA, 4K granule, inner shareable write-back
/// walks. Bits 23 and 31 are RES1.
const TCR_BASE: u64 =
    16 | (1 << 8) | (1 << 10) | (0b11 << 12) | (1 << 23) | (1 << 31);
const TCR_PS_SHIFT: u32 = 16;

/// SPSR for entering a guest: EL1h with DAIF masked.
const SPSR_EL1H_MASKED: u64 = 0x3c5;

pub fn image_base() -> u64 {
    HYP_HEADER.0.get() as u64
}

pub fn hyp_vectors() -> u64 {
    // Safety: only the address is taken.
    unsafe { core::ptr::addr_of!(HYP_VECTORS) as u64 }
}

pub unsafe fn set_vectors(addr: u64) {
    asm!(
        "msr vbar_el2, {0}",
        "isb",
        in(reg) addr,
        options(nostack, preserves_flags),
    );
}

pub unsafe fn enable_translation(root: u64) {
    let mmfr0: u64;
    asm!(
        "mrs {0}, id_aa64mmfr0_el1",
        out(reg) mmfr0,
        options(nomem, nostack, preserves_flags),
    );
    // PS is 3 bits; values above 48 bits need LPA which we don't use.
    let ps = (mmfr0 & 0xf).min(5);
    let tcr = TCR_BASE | (ps << TCR_PS_SHIFT);

    asm!(
        "msr mair_el2, {mair}",
        "msr tcr_el2, {tcr}",
        "msr ttbr0_el2, {root}",
        "isb",
        "tlbi alle2",
        "dsb nsh",
        "mrs {tmp}, sctlr_el2",
        "orr {tmp}, {tmp}, {bits}",
        "msr sctlr_el2, {tmp}",
        "isb",
        mair = in(reg) MAIR,
        tcr = in(reg) tcr,
        root = in(reg) root,
        bits = in(reg) SCTLR_MMU_CACHES,
        tmp = out(reg) _,
        options(nostack, preserves_flags),
    );
}

pub unsafe fn disable_translation() {
    asm!(
        "mrs {tmp}, sctlr_el2",
        "bic {tmp}, {tmp}, {bits}",
        "msr sctlr_el2, {tmp}",
        "isb",
        "tlbi alle2",
        "dsb nsh",
        "isb",
        bits = in(reg) SCTLR_MMU_CACHES,
        tmp = out(reg) _,
        options(nostack, preserves_flags),
    );
}

pub unsafe fn set_percpu_base(addr: u64) {
    asm!(
        "msr tpidr_el2, {0}",
        in(reg) addr,
        options(nostack, preserves_flags),
    );
}

pub fn percpu_base() -> u64 {
    let base: u64;
    // Safety: reading TPIDR_EL2 has no side effects.
    unsafe {
        asm!(
            "mrs {0}, tpidr_el2",
            out(reg) base,
            options(nomem, nostack, preserves_flags),
        );
    }
    base
}

fn dcache_line_size() -> usize {
    let ctr: u64;
    // Safety: reading CTR_EL0 has no side effects.
    unsafe {
        asm!(
            "mrs {0}, ctr_el0",
            out(reg) ctr,
            options(nomem, nostack, preserves_flags),
        );
    }
    4 << ((ctr >> 16) & 0xf)
}

pub fn clean_invalidate_dcache(start: usize, len: usize) {
    let line = dcache_line_size();
    let end = start + len;
    let mut addr = start & !(line - 1);
    while addr < end {
        // Safety: cache maintenance by address does not change memory
        // contents.
        unsafe {
            asm!(
                "dc civac, {0}",
                in(reg) addr,
                options(nostack, preserves_flags),
            );
        }
        addr += line;
    }
    // Safety: barrier only.
    unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
}

pub fn invalidate_dcache(start: usize, len: usize) {
    let line = dcache_line_size();
    let end = start + len;
    let mut addr = start & !(line - 1);
    while addr < end {
        // Safety: the caller owns the range and discards its contents.
        unsafe {
            asm!(
                "dc ivac, {0}",
                in(reg) addr,
                options(nostack, preserves_flags),
            );
        }
        addr += line;
    }
    // Safety: barrier only.
    unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
}

pub fn flush_hyp_tlbs() {
    // Safety: TLB maintenance only.
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi alle2",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags),
        );
    }
}

pub fn set_guest_entry(pc: u64) {
    // Safety: only affects the next exception return.
    unsafe {
        asm!(
            "msr elr_el2, {pc}",
            "msr spsr_el2, {spsr}",
            pc = in(reg) pc,
            spsr = in(reg) SPSR_EL1H_MASKED,
            options(nostack, preserves_flags),
        );
    }
}

pub fn set_stage2_root(vttbr: u64) {
    // Safety: only affects guest translation.
    unsafe {
        asm!(
            "msr vttbr_el2, {0}",
            "isb",
            in(reg) vttbr,
            options(nostack, preserves_flags),
        );
    }
}

/// Invalidates stage 1 and 2 guest TLB entries of the current VMID on this
/// CPU only.
pub fn flush_guest_tlbs() {
    // Safety: TLB maintenance only.
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vmalls12e1",
            "dsb nsh",
            "isb",
            options(nostack, preserves_flags),
        );
    }
}

pub unsafe fn call_core_entry(cpu_id: u64, percpu: *mut PerCpuArea) {
    hypervisor_entry(cpu_id, percpu);
}

/// Restores the host's registers from `regs`, with `x0 = ret`, and returns
/// to it with `eret`.
pub unsafe fn return_to_host(regs: *const GuestRegisters, ret: u64) -> ! {
    asm!(
        "ldr x1, [x30, #16]",
        "ldp x2, x3, [x30, #24]",
        "ldp x4, x5, [x30, #40]",
        "ldp x6, x7, [x30, #56]",
        "ldp x8, x9, [x30, #72]",
        "ldp x10, x11, [x30, #88]",
        "ldp x12, x13, [x30, #104]",
        "ldp x14, x15, [x30, #120]",
        "ldp x16, x17, [x30, #136]",
        "ldp x18, x19, [x30, #152]",
        "ldp x20, x21, [x30, #168]",
        "ldp x22, x23, [x30, #184]",
        "ldp x24, x25, [x30, #200]",
        "ldp x26, x27, [x30, #216]",
        "ldp x28, x29, [x30, #232]",
        "ldr x30, [x30, #248]",
        "eret",
        in("x0") ret,
        in("x30") regs,
        options(noreturn),
    );
}

pub fn halt(_reason: &Abort) -> ! {
    loop {
        // Safety: waits for an interrupt that never gets acted on.
        unsafe { asm!("wfi", options(nomem, nostack, preserves_flags)) };
    }
}

pub fn cpu_relax() {
    core::hint::spin_loop();
}
