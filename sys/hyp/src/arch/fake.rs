// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the privileged primitives.
//!
//! Each host thread plays one physical core. System register writes land in
//! a per-thread `FakeCpu`, and every operation is appended to that thread's
//! log so tests can check what happened and in which order. Operations that
//! never return on hardware panic here.

use std::cell::RefCell;

use crate::fail::Abort;
use crate::percpu::{GuestRegisters, PerCpuArea};

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Address reported for the permanent vector table.
pub const FAKE_HYP_VECTORS: u64 = 0x4000_0800;
/// Address reported as the start of the hypervisor image.
pub const FAKE_IMAGE_BASE: u64 = 0x4000_0000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArchOp {
    SetVectors(u64),
    EnableTranslation { root: u64 },
    DisableTranslation,
    SetPercpuBase(u64),
    CleanInvalidateDcache { start: usize, len: usize },
    InvalidateDcache { start: usize, len: usize },
    FlushHypTlbs,
    GuestEntry(u64),
    Stage2Root(u64),
    FlushGuestTlbs,
    CoreEntry { cpu_id: u64, percpu: usize },
    ReturnToHost,
}

/// Simulated EL2 register state of the current thread's core.
#[derive(Clone, Debug, Default)]
pub struct FakeCpu {
    pub vbar: u64,
    pub translation: bool,
    pub ttbr0: u64,
    pub tpidr: u64,
    pub elr: u64,
    pub vttbr: u64,
    pub log: Vec<ArchOp>,
}

thread_local! {
    static CPU: RefCell<FakeCpu> = RefCell::new(FakeCpu::default());
}

fn with_cpu<R>(f: impl FnOnce(&mut FakeCpu) -> R) -> R {
    CPU.with(|c| f(&mut c.borrow_mut()))
}

fn log(op: ArchOp) {
    with_cpu(|c| c.log.push(op));
}

/// Drains and returns this thread's operation log.
pub fn take_log() -> Vec<ArchOp> {
    with_cpu(|c| core::mem::take(&mut c.log))
}

/// Snapshot of this thread's register state.
pub fn cpu_state() -> FakeCpu {
    with_cpu(|c| c.clone())
}

pub fn image_base() -> u64 {
    FAKE_IMAGE_BASE
}

pub fn hyp_vectors() -> u64 {
    FAKE_HYP_VECTORS
}

pub unsafe fn set_vectors(addr: u64) {
    with_cpu(|c| c.vbar = addr);
    log(ArchOp::SetVectors(addr));
}

pub unsafe fn enable_translation(root: u64) {
    with_cpu(|c| {
        c.ttbr0 = root;
        c.translation = true;
    });
    log(ArchOp::EnableTranslation { root });
}

pub unsafe fn disable_translation() {
    with_cpu(|c| c.translation = false);
    log(ArchOp::DisableTranslation);
}

pub unsafe fn set_percpu_base(addr: u64) {
    with_cpu(|c| c.tpidr = addr);
    log(ArchOp::SetPercpuBase(addr));
}

pub fn percpu_base() -> u64 {
    with_cpu(|c| c.tpidr)
}

pub fn clean_invalidate_dcache(start: usize, len: usize) {
    log(ArchOp::CleanInvalidateDcache { start, len });
}

pub fn invalidate_dcache(start: usize, len: usize) {
    log(ArchOp::InvalidateDcache { start, len });
}

pub fn flush_hyp_tlbs() {
    log(ArchOp::FlushHypTlbs);
}

pub fn set_guest_entry(pc: u64) {
    with_cpu(|c| c.elr = pc);
    log(ArchOp::GuestEntry(pc));
}

pub fn set_stage2_root(vttbr: u64) {
    with_cpu(|c| c.vttbr = vttbr);
    log(ArchOp::Stage2Root(vttbr));
}

pub fn flush_guest_tlbs() {
    log(ArchOp::FlushGuestTlbs);
}

/// Records the call; the simulated hypervisor returns immediately.
pub unsafe fn call_core_entry(cpu_id: u64, percpu: *mut PerCpuArea) {
    log(ArchOp::CoreEntry {
        cpu_id,
        percpu: percpu as usize,
    });
}

pub unsafe fn return_to_host(_regs: *const GuestRegisters, _ret: u64) -> ! {
    log(ArchOp::ReturnToHost);
    panic!("returned to host");
}

pub fn halt(reason: &Abort) -> ! {
    panic!("core aborted: {reason}");
}

pub fn cpu_relax() {
    std::thread::yield_now();
}
