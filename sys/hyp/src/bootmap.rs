// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootstrap identity map.
//!
//! Before EL2 translation is on, the only things that must stay reachable
//! are the hypervisor image (we are executing out of it) and the debug
//! console. Both are identity mapped with the largest blocks that keep them
//! apart, using at most three tables: the root (level 0), a shared level 1
//! table, and a "wildcard" table whose role depends on how close together
//! the two addresses are:
//!
//! - Different level 0 slots: the wildcard becomes the device's level 1
//!   table, so each region gets a 1 GiB block.
//! - Same level 0 slot, different level 1 slots: both get 1 GiB blocks in
//!   the shared level 1 table and the wildcard is unused.
//! - Same level 1 slot, different level 2 slots: the wildcard becomes a
//!   shared level 2 table holding two 2 MiB blocks.
//! - Anything closer can't be told apart with blocks and is refused.
//!
//! The map is thrown away once the hypervisor installs its permanent one.

use core::mem::size_of;

use zerocopy::{FromZeros, KnownLayout};

use crate::arch;
use crate::err::BootMapError;

pub const PAGE_SHIFT: u32 = 12;
pub const ENTRIES: usize = 512;
/// Output address bits of a descriptor.
const ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

bitflags::bitflags! {
    /// Descriptor bits used by the bootstrap map (stage 1, EL2 regime).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        /// Table descriptor at levels 0-2; clear means block.
        const TABLE = 1 << 1;
        /// AttrIndx 1: device-nGnRnE in MAIR_EL2.
        const ATTR_DEVICE = 1 << 2;
        const INNER_SHAREABLE = 0b11 << 8;
        const ACCESS = 1 << 10;
        const NO_EXEC = 1 << 54;
    }
}

impl PteFlags {
    pub const NORMAL_BLOCK: Self = Self::VALID
        .union(Self::ACCESS)
        .union(Self::INNER_SHAREABLE);
    pub const DEVICE_BLOCK: Self = Self::VALID
        .union(Self::ACCESS)
        .union(Self::ATTR_DEVICE)
        .union(Self::NO_EXEC);
    pub const NEXT_TABLE: Self = Self::VALID.union(Self::TABLE);
}

/// Bit position of the lowest address bit translated by `level`.
pub const fn level_shift(level: u32) -> u32 {
    PAGE_SHIFT + (3 - level) * 9
}

pub const fn pt_index(addr: u64, level: u32) -> usize {
    ((addr >> level_shift(level)) & 0x1ff) as usize
}

/// Bytes covered by one entry at `level`.
pub const fn block_size(level: u32) -> u64 {
    1 << level_shift(level)
}

/// `addr` rounded down to the block at `level`, limited to 48 bits.
pub const fn block_address(addr: u64, level: u32) -> u64 {
    addr & (((1 << ((level + 1) * 9)) - 1) << level_shift(level))
}

#[derive(Clone, FromZeros, KnownLayout)]
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [u64; ENTRIES],
}

impl PageTable {
    fn clear(&mut self) {
        self.entries = [0; ENTRIES];
    }

    fn phys(&self) -> u64 {
        self as *const Self as u64
    }
}

/// How the two regions are laid out in the bootstrap map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Geometry {
    /// Different level 0 slots; 1 GiB blocks, wildcard is the device's
    /// level 1 table.
    SplitRoot,
    /// Same level 0 slot; 1 GiB blocks side by side, wildcard unused.
    SplitL1,
    /// Same level 1 slot; 2 MiB blocks in the wildcard as level 2 table.
    SplitL2,
}

impl Geometry {
    /// Level at which the image gets its block.
    pub fn block_level(self) -> u32 {
        match self {
            Self::SplitRoot | Self::SplitL1 => 1,
            Self::SplitL2 => 2,
        }
    }
}

/// Picks the coarsest layout that keeps `image` and `device` in separate
/// blocks.
pub fn plan(image: u64, device: u64) -> Result<Geometry, BootMapError> {
    if pt_index(image, 0) != pt_index(device, 0) {
        Ok(Geometry::SplitRoot)
    } else if pt_index(image, 1) != pt_index(device, 1) {
        Ok(Geometry::SplitL1)
    } else if pt_index(image, 2) != pt_index(device, 2) {
        Ok(Geometry::SplitL2)
    } else {
        Err(BootMapError::Collision { image, device })
    }
}

#[derive(FromZeros, KnownLayout)]
#[repr(C)]
pub struct BootstrapTables {
    pub root: PageTable,
    pub l1: PageTable,
    pub wildcard: PageTable,
}

impl BootstrapTables {
    /// Builds the identity map for `image` (normal memory) and `device`
    /// (device memory), makes it visible to the table walker, and returns
    /// the root table address for TTBR0.
    ///
    /// Must run with translation off on the owning core; the tables are
    /// assumed to be identity mapped once translation comes on, which the
    /// map itself guarantees as long as they live inside the image.
    pub fn build(
        &mut self,
        image: u64,
        device: u64,
    ) -> Result<u64, BootMapError> {
        let geometry = plan(image, device)?;

        self.root.clear();
        self.l1.clear();
        self.wildcard.clear();

        let l1 = self.l1.phys();
        let wildcard = self.wildcard.phys();
        self.root.entries[pt_index(image, 0)] =
            l1 | PteFlags::NEXT_TABLE.bits();

        match geometry {
            Geometry::SplitRoot => {
                self.l1.entries[pt_index(image, 1)] = block(image, 1, false);
                self.root.entries[pt_index(device, 0)] =
                    wildcard | PteFlags::NEXT_TABLE.bits();
                self.wildcard.entries[pt_index(device, 1)] =
                    block(device, 1, true);
            }
            Geometry::SplitL1 => {
                self.l1.entries[pt_index(image, 1)] = block(image, 1, false);
                self.l1.entries[pt_index(device, 1)] = block(device, 1, true);
            }
            Geometry::SplitL2 => {
                self.l1.entries[pt_index(image, 1)] =
                    wildcard | PteFlags::NEXT_TABLE.bits();
                self.wildcard.entries[pt_index(image, 2)] =
                    block(image, 2, false);
                self.wildcard.entries[pt_index(device, 2)] =
                    block(device, 2, true);
            }
        }

        arch::clean_invalidate_dcache(
            self as *const Self as usize,
            size_of::<Self>(),
        );
        arch::flush_hyp_tlbs();

        Ok(self.root.phys())
    }

    /// Translates `va` through the map, returning the output address, the
    /// final descriptor's flags and the level it was found at.
    pub fn walk(&self, va: u64) -> Option<(u64, PteFlags, u32)> {
        let mut table = &self.root;
        for level in 0..=2 {
            let desc = table.entries[pt_index(va, level)];
            let flags = PteFlags::from_bits_truncate(desc);
            if !flags.contains(PteFlags::VALID) {
                return None;
            }
            if level > 0 && !flags.contains(PteFlags::TABLE) {
                let offset_mask = block_size(level) - 1;
                let pa = (desc & ADDR_MASK & !offset_mask) | (va & offset_mask);
                return Some((pa, flags, level));
            }
            table = self.table_at(desc & ADDR_MASK)?;
        }
        None
    }

    fn table_at(&self, addr: u64) -> Option<&PageTable> {
        [&self.root, &self.l1, &self.wildcard]
            .into_iter()
            .find(|t| t.phys() == addr)
    }
}

fn block(addr: u64, level: u32, device: bool) -> u64 {
    let flags = if device {
        PteFlags::DEVICE_BLOCK
    } else {
        PteFlags::NORMAL_BLOCK
    };
    block_address(addr, level) | flags.bits()
}
