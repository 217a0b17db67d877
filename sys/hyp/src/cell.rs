// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cells: a set of CPUs plus the memory regions they may use.
//!
//! A cell is described by an `abi::CellDesc` blob followed by its
//! `abi::MemoryRegion` array. This module views such a blob in place and
//! implements the cell-wide operations the architecture core owns.

use core::mem::size_of;

use abi::{CellDesc, ImageLoad, MemFlags, MemoryRegion, CELL_SIGNATURE};
use zerocopy::{ConvertError, FromBytes};

use crate::arch;
use crate::config::MAX_CPUS;
use crate::control::{CpuTable, VcpuControl};
use crate::err::ConfigError;
use crate::irqchip::IrqChip;

/// Bitmap of physical CPUs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < 64 && self.0 & (1 << cpu) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(|&cpu| self.contains(cpu))
    }

    pub fn bits(&self) -> u64 {
        self.0
    }
}

pub struct Cell<'a> {
    desc: &'a CellDesc,
    regions: &'a [MemoryRegion],
}

impl<'a> Cell<'a> {
    /// Views `blob` as a cell descriptor. The blob must be 8-byte aligned.
    pub fn from_config(blob: &'a [u8]) -> Result<Self, ConfigError> {
        let (desc, rest) =
            CellDesc::ref_from_prefix(blob).map_err(|e| match e {
                ConvertError::Alignment(_) => ConfigError::Misaligned,
                _ => ConfigError::Truncated {
                    needed: size_of::<CellDesc>(),
                    actual: blob.len(),
                },
            })?;

        if desc.signature != CELL_SIGNATURE {
            return Err(ConfigError::BadSignature);
        }
        if desc.name().is_none() {
            return Err(ConfigError::BadName);
        }
        if desc.cpu_set.checked_shr(MAX_CPUS as u32).unwrap_or(0) != 0 {
            return Err(ConfigError::CpuOutOfRange {
                cpu_set: desc.cpu_set,
            });
        }

        let count = desc.num_memory_regions as usize;
        let (regions, _) =
            <[MemoryRegion]>::ref_from_prefix_with_elems(rest, count)
                .map_err(|_| ConfigError::Truncated {
                    needed: size_of::<CellDesc>()
                        + count * size_of::<MemoryRegion>(),
                    actual: blob.len(),
                })?;

        Ok(Self { desc, regions })
    }

    pub fn name(&self) -> &str {
        // Checked in from_config.
        self.desc.name().unwrap_or("")
    }

    pub fn cpu_set(&self) -> CpuSet {
        CpuSet::new(self.desc.cpu_set)
    }

    pub fn memory_regions(&self) -> &'a [MemoryRegion] {
        self.regions
    }

    /// Drops whatever the cell's RAM has in the data cache so a restarted
    /// cell can't see (or write back) lines from its previous life. Device
    /// and communication regions are left alone.
    ///
    /// RAM regions are addressed through the hypervisor's identity map.
    pub fn reset(&self) {
        for region in self.regions {
            let flags = region.flags();
            if flags.intersects(MemFlags::IO | MemFlags::COMM_REGION) {
                continue;
            }
            arch::invalidate_dcache(
                region.phys_start as usize,
                region.size as usize,
            );
        }
    }

    /// Invalidates the guest TLBs of every CPU in the cell: directly for
    /// the calling CPU, as a deferred request for the others.
    pub fn flush_vcpu_caches<const N: usize>(
        &self,
        table: &CpuTable<N>,
        this_cpu: usize,
        vcpu: &mut dyn VcpuControl,
    ) {
        for cpu in self.cpu_set().iter() {
            if cpu == this_cpu {
                vcpu.flush_tlbs();
            } else if let Some(remote) = table.remote(cpu) {
                remote.request_cache_flush();
            }
        }
    }

    /// Stops every CPU of the cell and restarts them all at `entry`.
    pub fn start<const N: usize>(
        &self,
        table: &CpuTable<N>,
        entry: u64,
        chip: &dyn IrqChip,
    ) {
        for cpu in self.cpu_set().iter() {
            if let Some(remote) = table.remote(cpu) {
                remote.request_suspend(chip);
            }
        }
        for cpu in self.cpu_set().iter() {
            if let Some(remote) = table.remote(cpu) {
                remote.request_reset(entry);
            }
        }
    }

    /// Checks that a load request targets loadable memory of this cell.
    pub fn check_load(&self, load: &ImageLoad) -> Result<(), ConfigError> {
        let end = load
            .target_address
            .checked_add(load.size)
            .ok_or(ConfigError::NotLoadable {
                address: load.target_address,
            })?;
        let ok = self.regions.iter().any(|r| {
            r.flags().contains(MemFlags::LOADABLE)
                && load.target_address >= r.virt_start
                && end <= r.virt_start.saturating_add(r.size)
        });
        if ok {
            Ok(())
        } else {
            Err(ConfigError::NotLoadable {
                address: load.target_address,
            })
        }
    }
}

/// Forwards a committed configuration change to the interrupt controller.
pub fn config_commit(chip: &dyn IrqChip, cell: Option<&Cell<'_>>) {
    chip.config_commit(cell);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchOp;
    use crate::control::mock::{RecordingVcpu, VcpuOp};
    use crate::control::{spin_until, Action};
    use crate::irqchip::mock::MockChip;
    use abi::CELL_NAME_LEN;
    use std::sync::atomic::{AtomicBool, Ordering};
    use zerocopy::IntoBytes;

    fn region(
        phys: u64,
        virt: u64,
        size: u64,
        flags: MemFlags,
    ) -> MemoryRegion {
        MemoryRegion {
            phys_start: phys,
            virt_start: virt,
            size,
            flags: flags.bits(),
        }
    }

    /// Builds an aligned blob for a cell called "linux" on `cpu_set`.
    fn blob(cpu_set: u64, regions: &[MemoryRegion]) -> Vec<u64> {
        let mut name = [0u8; CELL_NAME_LEN];
        name[..5].copy_from_slice(b"linux");
        let desc = CellDesc {
            signature: CELL_SIGNATURE,
            name,
            flags: 0,
            num_memory_regions: regions.len() as u32,
            cpu_set,
        };
        let mut bytes = desc.as_bytes().to_vec();
        bytes.extend_from_slice(regions.as_bytes());
        let mut words = vec![0u64; bytes.len() / 8];
        words.as_mut_bytes().copy_from_slice(&bytes);
        words
    }

    fn ram_and_uart() -> [MemoryRegion; 3] {
        let rw = MemFlags::READ | MemFlags::WRITE;
        [
            region(0x8000_0000, 0x0, 0x1000_0000, rw | MemFlags::LOADABLE),
            region(0x0900_0000, 0x0900_0000, 0x1000, rw | MemFlags::IO),
            region(0x9000_0000, 0x8000_0000, 0x20_0000, rw),
        ]
    }

    #[test]
    fn parses_descriptor_and_regions() {
        let words = blob(0b1100, &ram_and_uart());
        let cell = Cell::from_config(words.as_bytes()).unwrap();
        assert_eq!(cell.name(), "linux");
        assert_eq!(cell.cpu_set().iter().collect::<Vec<_>>(), [2, 3]);
        assert_eq!(cell.memory_regions().len(), 3);
        assert!(cell.memory_regions()[1].flags().contains(MemFlags::IO));
    }

    #[test]
    fn rejects_short_blob() {
        let words = blob(0b1, &ram_and_uart());
        let bytes = &words.as_bytes()[..words.len() * 8 - 8];
        assert!(matches!(
            Cell::from_config(bytes),
            Err(ConfigError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_bad_signature_and_cpus() {
        let mut words = blob(0b1, &[]);
        words[0] = 0;
        assert_eq!(
            Cell::from_config(words.as_bytes()).err(),
            Some(ConfigError::BadSignature)
        );

        if let Some(beyond) = 1u64.checked_shl(MAX_CPUS as u32) {
            let words = blob(beyond, &[]);
            assert!(matches!(
                Cell::from_config(words.as_bytes()),
                Err(ConfigError::CpuOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn reset_invalidates_ram_only() {
        let words = blob(0b1, &ram_and_uart());
        let cell = Cell::from_config(words.as_bytes()).unwrap();
        let _ = arch::take_log();
        cell.reset();
        assert_eq!(
            arch::take_log(),
            [
                ArchOp::InvalidateDcache {
                    start: 0x8000_0000,
                    len: 0x1000_0000
                },
                ArchOp::InvalidateDcache {
                    start: 0x9000_0000,
                    len: 0x20_0000
                },
            ]
        );
    }

    #[test]
    fn flush_is_local_for_self_and_deferred_for_others() {
        let table = CpuTable::<4>::new();
        let words = blob(0b0110, &[]);
        let cell = Cell::from_config(words.as_bytes()).unwrap();

        let mut mine = RecordingVcpu::default();
        cell.flush_vcpu_caches(&table, 1, &mut mine);
        assert_eq!(mine.ops, [VcpuOp::FlushTlbs]);

        let mut theirs = RecordingVcpu::default();
        table.local(2).unwrap().check_events(&mut theirs);
        assert_eq!(theirs.ops, [VcpuOp::FlushTlbs]);

        let mut untouched = RecordingVcpu::default();
        table.local(3).unwrap().check_events(&mut untouched);
        assert!(untouched.ops.is_empty());
    }

    #[test]
    fn load_must_hit_loadable_memory() {
        let words = blob(0b1, &ram_and_uart());
        let cell = Cell::from_config(words.as_bytes()).unwrap();
        let load = |target_address, size| ImageLoad {
            source: 0,
            size,
            target_address,
        };
        assert_eq!(cell.check_load(&load(0x8_0000, 0x100_0000)), Ok(()));
        assert!(cell.check_load(&load(0x0fff_0000, 0x2_0000)).is_err());
        assert!(cell.check_load(&load(0x8000_0000, 0x1000)).is_err());
        assert!(cell.check_load(&load(u64::MAX, 2)).is_err());
    }

    #[test]
    fn config_commit_reaches_irqchip() {
        let chip = MockChip::default();
        let words = blob(0b1, &[]);
        let cell = Cell::from_config(words.as_bytes()).unwrap();
        config_commit(&chip, Some(&cell));
        config_commit(&chip, None);
        assert_eq!(chip.commits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn start_resets_every_cpu() {
        let table = CpuTable::<2>::new();
        let chip = MockChip::default();
        let words = blob(0b10, &[]);
        let cell = Cell::from_config(words.as_bytes()).unwrap();
        let done = AtomicBool::new(false);

        let action = std::thread::scope(|s| {
            let target = s.spawn(|| {
                let local = table.local(1).unwrap();
                let mut vcpu = RecordingVcpu::default();
                spin_until(|| chip.take_event(1));
                let action = local.check_events(&mut vcpu);
                done.store(true, Ordering::Release);
                action
            });
            cell.start(&table, 0x4000_0000, &chip);
            spin_until(|| done.load(Ordering::Acquire));
            target.join().unwrap()
        });

        assert_eq!(action, Action::ResetTo(0x4000_0000));
    }
}
