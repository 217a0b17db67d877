// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-CPU control state machine.
//!
//! Every physical CPU has a `PerCpu` control record in a table indexed by CPU
//! id. Other CPUs drive it through a `RemoteCpu` handle, which can only post
//! requests (suspend, resume, reset, park, cache flush, power-on) and kick
//! the target with an event SGI. The owning CPU reacts in
//! `LocalCpu::check_events` when that SGI arrives.
//!
//! All request fields are written under the target's `control_lock`. The
//! two waits in the protocol (a requester waiting for `cpu_suspended`, the
//! target waiting for `suspend_cpu` to drop) poll outside the lock, which is
//! why those flags are atomics. `wait_for_poweron` is written only by the
//! owning CPU; remote CPUs read it under the lock.
//!
//! There are no timeouts. A target that never reaches `check_events` stalls
//! a suspending requester forever.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{CpuStat, SgiReason, PSCI_INVALID_ADDRESS};
use enum_map::{Enum, EnumMap};
use spin::{Mutex, MutexGuard};

use crate::arch;
use crate::config::MAX_CPUS;
use crate::err::PowerOnError;
use crate::irqchip::{IrqChip, Sgi};
use crate::percpu::GuestRegisters;
use crate::trace::Trace;

/// Operations the state machine applies to the guest on the owning CPU.
pub trait VcpuControl {
    /// Restarts the guest at `entry` with a clean register file.
    fn reset(&mut self, entry: u64);
    /// Switches the guest to the parking address space.
    fn park(&mut self);
    /// Invalidates this CPU's guest translation caches.
    fn flush_tlbs(&mut self);
}

/// `VcpuControl` over the real guest register frame and EL2 registers.
pub struct GuestVcpu<'a> {
    regs: &'a mut GuestRegisters,
    parking_root: u64,
}

impl<'a> GuestVcpu<'a> {
    /// `parking_root` is the stage 2 root used for parked CPUs: a single
    /// page at guest address 0 holding a `wfi` loop.
    pub fn new(regs: &'a mut GuestRegisters, parking_root: u64) -> Self {
        Self { regs, parking_root }
    }
}

impl VcpuControl for GuestVcpu<'_> {
    fn reset(&mut self, entry: u64) {
        self.regs.usr = [0; 31];
        arch::set_guest_entry(entry);
    }

    fn park(&mut self) {
        arch::set_stage2_root(self.parking_root);
        arch::flush_guest_tlbs();
    }

    fn flush_tlbs(&mut self) {
        arch::flush_guest_tlbs();
    }
}

/// What `check_events` did to the guest.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Action {
    /// Carry on where the guest left off.
    Resume,
    /// The CPU is now powered off and running the parking loop.
    Park,
    /// The guest was reset to this entry address.
    ResetTo(u64),
}

#[derive(Debug)]
struct Requests {
    park: bool,
    reset: bool,
    cpu_on_entry: u64,
    flush_vcpu_caches: bool,
}

/// Control record of one CPU.
pub struct PerCpu {
    control_lock: Mutex<Requests>,
    suspend_cpu: AtomicBool,
    cpu_suspended: AtomicBool,
    wait_for_poweron: AtomicBool,
    stats: [AtomicU32; CpuStat::LENGTH],
}

impl PerCpu {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU32 = AtomicU32::new(0);

        Self {
            control_lock: Mutex::new(Requests {
                park: false,
                reset: false,
                cpu_on_entry: PSCI_INVALID_ADDRESS,
                flush_vcpu_caches: false,
            }),
            suspend_cpu: AtomicBool::new(false),
            cpu_suspended: AtomicBool::new(false),
            wait_for_poweron: AtomicBool::new(false),
            stats: [ZERO; CpuStat::LENGTH],
        }
    }

    fn lock(&self) -> MutexGuard<'_, Requests> {
        self.control_lock.lock()
    }

    fn stats(&self) -> EnumMap<CpuStat, u32> {
        EnumMap::from_fn(|stat: CpuStat| {
            self.stats[stat.into_usize()].load(Ordering::Relaxed)
        })
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Control records of `N` CPUs.
pub struct CpuTable<const N: usize> {
    cpus: [PerCpu; N],
}

impl<const N: usize> CpuTable<N> {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const IDLE: PerCpu = PerCpu::new();

        Self { cpus: [IDLE; N] }
    }

    /// Handle for posting requests to `cpu` from any other CPU.
    pub fn remote(&self, cpu: usize) -> Option<RemoteCpu<'_>> {
        let record = self.cpus.get(cpu)?;
        Some(RemoteCpu { id: cpu, cpu: record })
    }

    /// Handle for the owning side of `cpu`. Only the code running on `cpu`
    /// itself may use it.
    pub fn local(&self, cpu: usize) -> Option<LocalCpu<'_>> {
        let record = self.cpus.get(cpu)?;
        Some(LocalCpu { id: cpu, cpu: record })
    }

    pub fn len(&self) -> usize {
        N
    }

    pub fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<const N: usize> Default for CpuTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub static PER_CPU: CpuTable<MAX_CPUS> = CpuTable::new();

/// Busy-waits until `done` returns true, with a relax hint between polls.
///
/// This is unbounded; nothing at this level can block or time out.
pub fn spin_until(mut done: impl FnMut() -> bool) {
    while !done() {
        arch::cpu_relax();
    }
}

/// Requests against another CPU's control record.
#[derive(Copy, Clone)]
pub struct RemoteCpu<'a> {
    id: usize,
    cpu: &'a PerCpu,
}

impl RemoteCpu<'_> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Asks the target to stop and waits until it has. Returns at once if
    /// it already had.
    pub fn request_suspend(&self, chip: &dyn IrqChip) {
        trace!(Trace::SuspendRequested { cpu: self.id as u16 });
        let already_suspended = {
            let _guard = self.cpu.lock();
            self.cpu.suspend_cpu.store(true, Ordering::Release);
            self.cpu.cpu_suspended.load(Ordering::Acquire)
        };

        if !already_suspended {
            self.kick(chip);
            spin_until(|| self.cpu.cpu_suspended.load(Ordering::Acquire));
        }
    }

    /// Lets a suspended target continue. Does not wait.
    pub fn request_resume(&self) {
        trace!(Trace::ResumeRequested { cpu: self.id as u16 });
        // Taken so a suspension in flight can't interleave with this.
        let _guard = self.cpu.lock();
        self.cpu.suspend_cpu.store(false, Ordering::Release);
    }

    /// Makes the target restart its guest at `entry` on its next event
    /// check, overriding any pending suspend. An entry of
    /// `PSCI_INVALID_ADDRESS` powers the target off instead.
    pub fn request_reset(&self, entry: u64) {
        trace!(Trace::ResetRequested {
            cpu: self.id as u16,
            entry
        });
        {
            let mut req = self.cpu.lock();
            req.cpu_on_entry = entry;
            req.reset = true;
        }
        self.request_resume();
    }

    /// Makes the target power itself off on its next event check.
    pub fn request_park(&self) {
        trace!(Trace::ParkRequested { cpu: self.id as u16 });
        self.cpu.lock().park = true;
        self.request_resume();
    }

    /// Defers a guest TLB flush to the target. It is carried out on the
    /// target itself at its next event check.
    pub fn request_cache_flush(&self) {
        self.cpu.lock().flush_vcpu_caches = true;
    }

    /// Starts a powered-off target at `entry`.
    pub fn request_power_on(
        &self,
        entry: u64,
        chip: &dyn IrqChip,
    ) -> Result<(), PowerOnError> {
        {
            let mut req = self.cpu.lock();
            if !self.cpu.wait_for_poweron.load(Ordering::Acquire) {
                return Err(PowerOnError::AlreadyOn);
            }
            req.cpu_on_entry = entry;
            req.reset = true;
        }
        trace!(Trace::PowerOnRequested {
            cpu: self.id as u16,
            entry
        });
        self.kick(chip);
        Ok(())
    }

    /// Sends the target an event SGI so it runs `check_events`.
    pub fn kick(&self, chip: &dyn IrqChip) {
        chip.send_sgi(Sgi {
            targets: 1 << self.id,
            id: SgiReason::Event,
        });
    }

    pub fn is_suspended(&self) -> bool {
        self.cpu.cpu_suspended.load(Ordering::Acquire)
    }

    pub fn is_powered_off(&self) -> bool {
        let _guard = self.cpu.lock();
        self.cpu.wait_for_poweron.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EnumMap<CpuStat, u32> {
        self.cpu.stats()
    }
}

/// The owning CPU's view of its control record.
pub struct LocalCpu<'a> {
    id: usize,
    cpu: &'a PerCpu,
}

impl LocalCpu<'_> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn count(&self, stat: CpuStat, events: u32) {
        self.cpu.stats[stat.into_usize()].fetch_add(events, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EnumMap<CpuStat, u32> {
        self.cpu.stats()
    }

    fn enter_cpu_off(&self, req: &mut Requests) {
        req.park = false;
        self.cpu.wait_for_poweron.store(true, Ordering::Release);
    }

    /// Acts on pending control requests. Called on the owning CPU when an
    /// event SGI arrives.
    ///
    /// While a suspend is requested this acknowledges it and spins until it
    /// is withdrawn. After that exactly one of park, reset or resume is
    /// chosen under the lock, a deferred TLB flush is serviced, and the
    /// choice is applied to `vcpu`.
    pub fn check_events(&self, vcpu: &mut dyn VcpuControl) -> Action {
        let mut reset = false;

        let mut req = self.cpu.lock();
        loop {
            if self.cpu.suspend_cpu.load(Ordering::Acquire) {
                self.cpu.cpu_suspended.store(true, Ordering::Release);
                trace!(Trace::Suspended { cpu: self.id as u16 });
            }

            drop(req);
            spin_until(|| !self.cpu.suspend_cpu.load(Ordering::Acquire));
            req = self.cpu.lock();

            if !self.cpu.suspend_cpu.load(Ordering::Acquire) {
                self.cpu.cpu_suspended.store(false, Ordering::Release);

                if req.park {
                    self.enter_cpu_off(&mut req);
                    break;
                }

                if req.reset {
                    req.reset = false;
                    if req.cpu_on_entry != PSCI_INVALID_ADDRESS {
                        self.cpu
                            .wait_for_poweron
                            .store(false, Ordering::Release);
                        reset = true;
                    } else {
                        self.enter_cpu_off(&mut req);
                    }
                    break;
                }
            }

            if !self.cpu.suspend_cpu.load(Ordering::Acquire) {
                break;
            }
        }

        if req.flush_vcpu_caches {
            req.flush_vcpu_caches = false;
            vcpu.flush_tlbs();
            trace!(Trace::CacheFlush { cpu: self.id as u16 });
        }

        let entry = req.cpu_on_entry;
        drop(req);

        // Only this CPU writes wait_for_poweron, so reading it unlocked is
        // fine.
        if self.cpu.wait_for_poweron.load(Ordering::Acquire) {
            self.park(vcpu);
            Action::Park
        } else if reset {
            trace!(Trace::ResetTo {
                cpu: self.id as u16,
                entry
            });
            vcpu.reset(entry);
            Action::ResetTo(entry)
        } else {
            Action::Resume
        }
    }

    /// Powers this CPU off: it waits for a power-on request while its guest
    /// spins in the parking address space.
    pub fn park(&self, vcpu: &mut dyn VcpuControl) {
        {
            let mut req = self.cpu.lock();
            self.enter_cpu_off(&mut req);
        }
        trace!(Trace::Parked { cpu: self.id as u16 });

        vcpu.reset(0);
        vcpu.park();
    }

    pub fn is_suspended(&self) -> bool {
        self.cpu.cpu_suspended.load(Ordering::Acquire)
    }

    pub fn is_powered_off(&self) -> bool {
        self.cpu.wait_for_poweron.load(Ordering::Acquire)
    }
}
