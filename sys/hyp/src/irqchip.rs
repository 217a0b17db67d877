// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the interrupt controller model.
//!
//! Routing and the virtual interface itself live behind this trait; the
//! control and signal code only ask it to send, inject or mark pending.

use abi::SgiReason;

use crate::cell::Cell;

/// A software-generated interrupt to send.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Sgi {
    /// Bitmap of target CPUs.
    pub targets: u64,
    pub id: SgiReason,
}

pub trait IrqChip: Sync {
    fn send_sgi(&self, sgi: Sgi);
    /// Moves queued virtual interrupts for `cpu` into its list registers.
    fn inject_pending(&self, cpu: usize);
    /// Queues physical interrupt `irqn` for the guest on `cpu`.
    fn set_pending(&self, cpu: usize, irqn: u32);
    /// Applies a configuration change; `cell` is the cell that was added or
    /// removed, if any.
    fn config_commit(&self, cell: Option<&Cell<'_>>);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every call. Event SGIs are also latched per target so a test
    /// thread playing that CPU can pick them up.
    #[derive(Default)]
    pub struct MockChip {
        events: AtomicU64,
        pub sgis: Mutex<Vec<Sgi>>,
        pub injected: Mutex<Vec<usize>>,
        pub pending: Mutex<Vec<(usize, u32)>>,
        pub commits: AtomicUsize,
    }

    impl MockChip {
        /// Consumes a latched event for `cpu`.
        pub fn take_event(&self, cpu: usize) -> bool {
            let bit = 1 << cpu;
            self.events.fetch_and(!bit, Ordering::AcqRel) & bit != 0
        }
    }

    impl IrqChip for MockChip {
        fn send_sgi(&self, sgi: Sgi) {
            self.sgis.lock().unwrap().push(sgi);
            if sgi.id == SgiReason::Event {
                self.events.fetch_or(sgi.targets, Ordering::AcqRel);
            }
        }

        fn inject_pending(&self, cpu: usize) {
            self.injected.lock().unwrap().push(cpu);
        }

        fn set_pending(&self, cpu: usize, irqn: u32) {
            self.pending.lock().unwrap().push((cpu, irqn));
        }

        fn config_commit(&self, _cell: Option<&Cell<'_>>) {
            self.commits.fetch_add(1, Ordering::Relaxed);
        }
    }
}
