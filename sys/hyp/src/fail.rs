// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fatal failure of a core.
//!
//! Once a core runs at EL2 there is nobody to return an error to, so the
//! unrecoverable conditions all end up in `abort_core`. It leaves a record
//! for tooling and halts the calling core; other cores keep running.
//!
//! - `HAS_FAILED` is set by the first core to fail, and stays set.
//!
//! - `EPITAPH` holds up to `EPITAPH_LEN` bytes of UTF-8 describing that first
//!   failure, padded with NULs. Later failures on other cores are traced but
//!   do not overwrite it.

use core::fmt::{self, Display, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::arch;
use crate::err::BootMapError;
use crate::trace::Trace;

/// Reasons a core can be stopped for good.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Abort {
    /// The trap that entered EL2 was not an HVC from AArch64.
    UnexpectedTrap { esr: u64 },
    BootMap(BootMapError),
    /// The hypervisor's core entry function came back.
    EntryReturned,
    /// Stop requested by the generic panic path.
    PanicStop,
    Panic,
}

impl Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedTrap { esr } => {
                write!(f, "unexpected trap at entry, ESR {esr:#x}")
            }
            Self::BootMap(e) => write!(f, "bootstrap map: {e}"),
            Self::EntryReturned => f.write_str("hypervisor entry returned"),
            Self::PanicStop => f.write_str("panic stop"),
            Self::Panic => f.write_str("panic"),
        }
    }
}

const EPITAPH_LEN: usize = 128;

static HAS_FAILED: AtomicBool = AtomicBool::new(false);
static EPITAPH: Mutex<[u8; EPITAPH_LEN]> = Mutex::new([0; EPITAPH_LEN]);

pub fn has_failed() -> bool {
    HAS_FAILED.load(Ordering::Acquire)
}

/// Copy of the epitaph, if any core has failed.
pub fn epitaph() -> Option<[u8; EPITAPH_LEN]> {
    if !has_failed() {
        return None;
    }
    Some(*EPITAPH.lock())
}

/// Only the first caller gets the buffer. Uses `try_lock` so a failure while
/// the epitaph is being written can't deadlock.
fn begin_epitaph() -> Option<MutexGuard<'static, [u8; EPITAPH_LEN]>> {
    if HAS_FAILED.swap(true, Ordering::AcqRel) {
        return None;
    }
    EPITAPH.try_lock()
}

fn write_epitaph(msg: &dyn Display) {
    if let Some(mut buf) = begin_epitaph() {
        let mut writer = Eulogist { dest: &mut buf[..] };
        write!(writer, "{msg}").ok();
    }
}

/// Stops the calling core permanently.
#[inline(never)]
pub fn abort_core(reason: Abort) -> ! {
    trace!(Trace::Abort(reason));
    write_epitaph(&reason);
    arch::halt(&reason)
}

/// Stops the calling core at the request of the generic panic path.
pub fn panic_stop() -> ! {
    abort_core(Abort::PanicStop)
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    write_epitaph(info);
    arch::halt(&Abort::Panic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eulogist_truncates() {
        let mut buf = [0u8; 8];
        let mut w = Eulogist { dest: &mut buf[..] };
        write!(w, "{}", Abort::EntryReturned).unwrap();
        assert_eq!(&buf, b"hypervis");
    }

    #[test]
    #[should_panic(expected = "core aborted: panic stop")]
    fn panic_stop_halts() {
        panic_stop();
    }

    #[test]
    fn abort_leaves_a_record() {
        let r = std::panic::catch_unwind(|| {
            abort_core(Abort::UnexpectedTrap { esr: 0x5a00_0000 })
        });
        assert!(r.is_err());
        assert!(has_failed());
        assert!(crate::trace::snapshot().iter().any(|e| e.payload
            == Trace::Abort(Abort::UnexpectedTrap { esr: 0x5a00_0000 })));
        // Some core wrote the epitaph first; it is never blank.
        let text = epitaph().unwrap();
        assert_ne!(text[0], 0);
    }
}
