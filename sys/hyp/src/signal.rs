// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routing of SGIs and physical interrupts taken at EL2.

use abi::{CpuStat, PlatformInfo, SgiReason};

use crate::control::{Action, LocalCpu, VcpuControl};
use crate::irqchip::IrqChip;
use crate::trace::Trace;

/// Handles `count` coalesced occurrences of SGI `irqn` on the calling CPU.
///
/// Returns the control decision when the SGI was an event.
pub fn handle_sgi(
    local: &LocalCpu<'_>,
    irqn: u32,
    count: u32,
    chip: &dyn IrqChip,
    vcpu: &mut dyn VcpuControl,
) -> Option<Action> {
    match SgiReason::from_irqn(irqn) {
        Some(SgiReason::Inject) => {
            local.count(CpuStat::VmexitsVsgi, count);
            chip.inject_pending(local.id());
            None
        }
        Some(SgiReason::Event) => {
            local.count(CpuStat::VmexitsManagement, count);
            Some(local.check_events(vcpu))
        }
        None => {
            trace!(Trace::UnknownSgi {
                cpu: local.id() as u16,
                irqn
            });
            None
        }
    }
}

/// Handles a physical interrupt. Returns true if it was the maintenance
/// interrupt and was consumed here; anything else is queued for the guest.
pub fn handle_phys_irq(
    local: &LocalCpu<'_>,
    irqn: u32,
    count: u32,
    platform: &PlatformInfo,
    chip: &dyn IrqChip,
) -> bool {
    if irqn == platform.maintenance_irq {
        local.count(CpuStat::VmexitsMaintenance, count);
        chip.inject_pending(local.id());
        return true;
    }

    local.count(CpuStat::VmexitsVirq, count);
    chip.set_pending(local.id(), irqn);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::mock::RecordingVcpu;
    use crate::config::PLATFORM;
    use crate::control::CpuTable;
    use crate::irqchip::mock::MockChip;
    use enum_map::EnumMap;

    fn only(stat: CpuStat, n: u32) -> EnumMap<CpuStat, u32> {
        let mut expected = EnumMap::default();
        expected[stat] = n;
        expected
    }

    #[test]
    fn inject_counts_each_occurrence() {
        let table = CpuTable::<2>::new();
        let chip = MockChip::default();
        let mut vcpu = RecordingVcpu::default();
        let local = table.local(1).unwrap();

        for _ in 0..5 {
            let r = handle_sgi(&local, 0, 1, &chip, &mut vcpu);
            assert_eq!(r, None);
        }
        handle_sgi(&local, 0, 3, &chip, &mut vcpu);

        assert_eq!(local.stats(), only(CpuStat::VmexitsVsgi, 8));
        assert_eq!(*chip.injected.lock().unwrap(), [1; 6]);
        assert!(vcpu.ops.is_empty());
    }

    #[test]
    fn event_runs_check_events() {
        let table = CpuTable::<2>::new();
        let chip = MockChip::default();
        let mut vcpu = RecordingVcpu::default();
        let local = table.local(0).unwrap();

        table.remote(0).unwrap().request_reset(0x4000_0000);
        let r = handle_sgi(&local, 1, 2, &chip, &mut vcpu);

        assert_eq!(r, Some(Action::ResetTo(0x4000_0000)));
        assert_eq!(local.stats(), only(CpuStat::VmexitsManagement, 2));
        assert!(chip.injected.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_sgi_is_traced_and_ignored() {
        let table = CpuTable::<4>::new();
        let chip = MockChip::default();
        let mut vcpu = RecordingVcpu::default();
        let local = table.local(3).unwrap();

        assert_eq!(handle_sgi(&local, 9, 1, &chip, &mut vcpu), None);

        assert_eq!(local.stats(), EnumMap::default());
        assert!(chip.injected.lock().unwrap().is_empty());
        assert!(crate::trace::snapshot()
            .iter()
            .any(|e| e.payload == Trace::UnknownSgi { cpu: 3, irqn: 9 }));
    }

    #[test]
    fn maintenance_irq_is_consumed() {
        let table = CpuTable::<2>::new();
        let chip = MockChip::default();
        let local = table.local(1).unwrap();

        let irqn = PLATFORM.maintenance_irq;
        assert!(handle_phys_irq(&local, irqn, 1, &PLATFORM, &chip));
        assert_eq!(local.stats(), only(CpuStat::VmexitsMaintenance, 1));
        assert_eq!(*chip.injected.lock().unwrap(), [1]);
        assert!(chip.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn other_irqs_go_to_the_guest() {
        let table = CpuTable::<2>::new();
        let chip = MockChip::default();
        let local = table.local(0).unwrap();

        let irqn = PLATFORM.maintenance_irq + 8;
        assert!(!handle_phys_irq(&local, irqn, 4, &PLATFORM, &chip));
        assert_eq!(local.stats(), only(CpuStat::VmexitsVirq, 4));
        assert_eq!(*chip.pending.lock().unwrap(), [(0, irqn)]);
        assert!(chip.injected.lock().unwrap().is_empty());
    }
}
