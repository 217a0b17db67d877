// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event trace for the hypervisor core.
//!
//! There is no console at this layer, so diagnostics go into a static ring
//! buffer that a debugger (or a test) can read back. Each entry records the
//! source line it came from; an entry identical to the most recent one bumps
//! that entry's `count` instead of taking a new slot, and every slot carries
//! a generation number so wrap-around is visible.
//!
//! All cores share one ring, so it lives behind a spinlock. Nothing that
//! runs while holding the lock may itself trace.

use spin::Mutex;

use crate::fail::Abort;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    SuspendRequested { cpu: u16 },
    Suspended { cpu: u16 },
    ResumeRequested { cpu: u16 },
    ParkRequested { cpu: u16 },
    ResetRequested { cpu: u16, entry: u64 },
    PowerOnRequested { cpu: u16, entry: u64 },
    Parked { cpu: u16 },
    ResetTo { cpu: u16, entry: u64 },
    CacheFlush { cpu: u16 },
    UnknownSgi { cpu: u16, irqn: u32 },
    Abort(Abort),
}

#[derive(Copy, Clone, Debug)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // `None` is treated as an out-of-range index so the first entry lands
        // in slot 0 and never merges with the initializer.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Populated entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = self.last.map_or(0, |l| l + 1);
        self.buffer[start.min(N)..]
            .iter()
            .chain(self.buffer[..start.min(N)].iter())
            .filter(|e| e.count != 0)
    }
}

#[cfg(not(test))]
const TRACE_DEPTH: usize = 64;
// Tests on many threads share the ring.
#[cfg(test)]
const TRACE_DEPTH: usize = 4096;

static TRACE: Mutex<Ringbuf<Trace, TRACE_DEPTH>> =
    Mutex::new(Ringbuf::new(Trace::None));

pub fn record(line: u16, payload: Trace) {
    TRACE.lock().entry(line, payload);
}

/// Copies out the ring, oldest entry first.
#[cfg(not(target_os = "none"))]
pub fn snapshot() -> Vec<RingbufEntry<Trace>> {
    TRACE.lock().iter().copied().collect()
}

macro_rules! trace {
    ($payload:expr) => {
        $crate::trace::record(line!() as u16, $payload)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_counted_in_place() {
        let mut ring = Ringbuf::<u32, 4>::new(0);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(11, 7);
        let entries: Vec<_> = ring.iter().map(|e| (e.line, e.count)).collect();
        assert_eq!(entries, [(10, 3), (11, 1)]);
    }

    #[test]
    fn wraps_oldest_first_with_generations() {
        let mut ring = Ringbuf::<u32, 3>::new(0);
        for n in 1..=5 {
            ring.entry(1, n);
        }
        let payloads: Vec<_> = ring.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, [3, 4, 5]);
        assert_eq!(ring.buffer[0].generation, 2);
        assert_eq!(ring.buffer[2].generation, 1);
    }

    #[test]
    fn macro_tags_entries_with_line() {
        trace!(Trace::CacheFlush { cpu: 901 });
        let snap = snapshot();
        let hit = snap
            .iter()
            .find(|e| e.payload == Trace::CacheFlush { cpu: 901 })
            .unwrap();
        assert_ne!(hit.line, 0);
    }
}
