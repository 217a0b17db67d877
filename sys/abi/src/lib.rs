// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypervisor ABI definitions, shared between the hypervisor core and the
//! host-side loader.
//!
//! Everything in here is either a wire/memory format that both sides must
//! agree on bit-for-bit, or a small numeric code carried in a register. The
//! memory formats are `repr(C)` and derive the `zerocopy` traits so that
//! either side can view a byte buffer as one of these types without copying
//! or `unsafe`.

#![no_std]

use enum_map::Enum;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Magic number at the start of the hypervisor image, so the loader (and the
/// entry stub) can tell that they are looking at a hypervisor header and not
/// at uninitialized memory.
pub const HEADER_SIGNATURE: [u8; 8] = *b"CELLVISR";

/// Magic number at the start of a cell descriptor blob.
pub const CELL_SIGNATURE: [u8; 8] = *b"CELLDESC";

/// Length of the NUL-padded cell name field.
pub const CELL_NAME_LEN: usize = 32;

/// Sentinel stored as a CPU's power-on entry address when no valid entry has
/// been supplied. A reset towards this address parks the CPU instead.
pub const PSCI_INVALID_ADDRESS: u64 = u64::MAX;

/// Header at the very start of the hypervisor image.
///
/// The loader fills in the runtime fields (CPU counts, debug console) before
/// calling the entry point on each CPU. The entry stub reads
/// `debug_console_base` while still running in the caller's mapping, because
/// once the privilege switch happens only stale views of this memory are
/// guaranteed.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HypervisorHeader {
    /// Should contain `HEADER_SIGNATURE`.
    pub signature: [u8; 8],
    /// Size of the hypervisor core image, in bytes.
    pub core_size: u64,
    /// Size of one per-CPU area, in bytes.
    pub percpu_size: u64,
    /// Offset of the entry stub from the image base.
    pub entry: u64,
    /// Number of CPUs the image was configured for.
    pub max_cpus: u32,
    /// Number of CPUs the loader is going to bring in.
    pub online_cpus: u32,
    /// Physical address of the debug console, written by the loader.
    pub debug_console_base: u64,
}

/// Static description of the platform, supplied at build time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Interrupt number of the interrupt controller's maintenance interrupt.
    pub maintenance_irq: u32,
}

/// Opcodes understood by the host's privileged stub, passed in `x0` before
/// the synchronous trap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum StubCall {
    /// Returns the currently installed trap-vector table address.
    GetVectors = 0,
    /// Installs a new trap-vector table for subsequent traps.
    SetVectors = 1,
}

/// Reasons carried by an inter-processor signal (SGI number).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SgiReason {
    /// A virtual interrupt is queued for the guest running on the target.
    Inject = 0,
    /// The target should re-evaluate its control state.
    Event = 1,
}

impl SgiReason {
    pub fn from_irqn(irqn: u32) -> Option<Self> {
        match irqn {
            0 => Some(Self::Inject),
            1 => Some(Self::Event),
            _ => None,
        }
    }
}

/// Per-CPU event counters. The numbering is visible to tools that read the
/// statistics block, so new entries go at the end.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
pub enum CpuStat {
    VmexitsTotal,
    VmexitsMmio,
    VmexitsManagement,
    VmexitsHypercall,
    VmexitsPsci,
    VmexitsMaintenance,
    VmexitsVirq,
    VmexitsVsgi,
}

/// Requests the host-side loader issues against the running hypervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum CellRequest {
    /// Create a cell from a `CellDesc` blob.
    Create = 0,
    /// Copy an image into a cell's memory, see `ImageLoad`.
    Load = 1,
    /// Release the cell's CPUs, starting at their reset entry.
    Start = 2,
}

impl CellRequest {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Create),
            1 => Some(Self::Load),
            2 => Some(Self::Start),
            _ => None,
        }
    }
}

/// Argument block of a `CellRequest::Load`.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ImageLoad {
    /// Address of the image in the loader's buffer.
    pub source: u64,
    /// Image size in bytes.
    pub size: u64,
    /// Guest-physical address at which the image is placed.
    pub target_address: u64,
}

/// Header of a cell descriptor blob. `num_memory_regions` `MemoryRegion`
/// records follow immediately.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CellDesc {
    /// Should contain `CELL_SIGNATURE`.
    pub signature: [u8; 8],
    /// NUL-padded UTF-8 name.
    pub name: [u8; CELL_NAME_LEN],
    /// Raw `CellFlags`.
    pub flags: u32,
    pub num_memory_regions: u32,
    /// Bitmap of the physical CPUs assigned to the cell.
    pub cpu_set: u64,
}

impl CellDesc {
    /// Returns the name up to the first NUL, or `None` if it is not UTF-8.
    pub fn name(&self) -> Option<&str> {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CELL_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).ok()
    }

    pub fn flags(&self) -> CellFlags {
        CellFlags::from_bits_truncate(self.flags)
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct CellFlags: u32 {
        /// The cell may use the debug console.
        const DEBUG_CONSOLE = 1 << 0;
        /// The cell does not need to acknowledge shutdown requests.
        const PASSIVE_COMMREG = 1 << 1;
    }
}

/// One memory region of a cell.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MemoryRegion {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    /// Raw `MemFlags`.
    pub flags: u64,
}

impl MemoryRegion {
    pub fn flags(&self) -> MemFlags {
        MemFlags::from_bits_truncate(self.flags)
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct MemFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const DMA = 1 << 3;
        /// Device memory: strongly ordered, never cached.
        const IO = 1 << 4;
        const COMM_REGION = 1 << 5;
        /// The loader may copy images into this region.
        const LOADABLE = 1 << 6;
        /// Shared with the root cell rather than taken from it.
        const ROOTSHARED = 1 << 7;
    }
}
