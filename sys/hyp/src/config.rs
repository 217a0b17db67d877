// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time constants and checks on loader-supplied configuration.
//!
//! `MAX_CPUS`, `PERCPU_STACK_SIZE` and `PLATFORM` come from the
//! `HYP_KCONFIG` RON document, see `build.rs`.

use core::mem::size_of;

use abi::{HypervisorHeader, HEADER_SIGNATURE};

use crate::bootmap::{self, block_address};
use crate::err::ConfigError;
use crate::percpu::PerCpuArea;

include!(concat!(env!("OUT_DIR"), "/consts.rs"));

/// Checks a header the loader has filled in for an image placed at
/// `image_base`.
///
/// Besides layout agreement this rejects an image/console pair that the
/// bootstrap map could not separate, and an image that would spill out of
/// the block the bootstrap map gives it. Both would otherwise only show up
/// as a core stopping during entry.
pub fn validate_header(
    header: &HypervisorHeader,
    image_base: u64,
) -> Result<(), ConfigError> {
    if header.signature != HEADER_SIGNATURE {
        return Err(ConfigError::BadSignature);
    }

    let expected = size_of::<PerCpuArea>() as u64;
    if header.percpu_size != expected {
        return Err(ConfigError::PercpuSizeMismatch {
            header: header.percpu_size,
            expected,
        });
    }

    let max = MAX_CPUS as u32;
    if header.max_cpus > max || header.online_cpus > header.max_cpus {
        return Err(ConfigError::TooManyCpus {
            online: header.online_cpus,
            max: header.max_cpus.min(max),
        });
    }

    let level =
        bootmap::plan(image_base, header.debug_console_base)?.block_level();
    let crosses = match image_base.checked_add(header.core_size) {
        Some(end) if header.core_size > 0 => {
            block_address(image_base, level) != block_address(end - 1, level)
        }
        Some(_) => false,
        None => true,
    };
    if crosses {
        return Err(ConfigError::ImageCrossesBlock {
            base: image_base,
            size: header.core_size,
        });
    }

    Ok(())
}
