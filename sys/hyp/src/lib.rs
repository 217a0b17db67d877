// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture core of a partitioning hypervisor for 64-bit Arm.
//!
//! This crate takes a physical CPU that is running a host kernel at EL1 and
//! moves it into the hypervisor at EL2, builds the throwaway identity map
//! that keeps the core executing while translation comes on, and then runs
//! the per-CPU control state machine that other cores drive through
//! inter-processor signals (suspend, resume, park, reset). The mirror path
//! hands EL2 back to the host.
//!
//! # Design principles
//!
//! 1. **Never fault at EL2.** Nothing here can be reported back to the host
//!    once the privilege switch has happened, so the few truly fatal
//!    conditions all funnel into one primitive, `fail::abort_core`, and
//!    everything else is decided locally.
//!
//! 2. **Keep the assembly small.** The only code that runs without a stack
//!    is the entry stub in `arch::aarch64`. It stores the handful of values
//!    it must carry across the trap into a fixed-layout `percpu::EntryFrame`
//!    and calls into Rust; the rest is ordinary Rust over raw per-core
//!    memory.
//!
//! 3. **Per-core state has one owner.** A core's control record is written
//!    by remote cores only through the narrow `control::RemoteCpu` handle
//!    and only under that core's lock. Everything else belongs to the
//!    owning core, reached through `control::LocalCpu`.
//!
//! 4. **Simulate on the host.** The portable logic is built against
//!    `arch::fake` when not targeting bare metal, which records every
//!    privileged operation so the ordering rules can be unit tested.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;
#[macro_use]
pub mod trace;

pub mod bootmap;
pub mod cell;
pub mod config;
pub mod control;
pub mod err;
pub mod fail;
pub mod irqchip;
pub mod percpu;
pub mod shutdown;
pub mod signal;
pub mod transition;
