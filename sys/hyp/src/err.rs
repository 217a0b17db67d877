// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types shared across the hypervisor core.

use core::fmt;

/// Failure to build the bootstrap identity map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootMapError {
    /// The image and device addresses fall into the same 2 MiB block, the
    /// finest granularity the bootstrap map can express.
    Collision { image: u64, device: u64 },
}

impl fmt::Display for BootMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collision { image, device } => write!(
                f,
                "image {image:#x} and device {device:#x} share a 2M block"
            ),
        }
    }
}

/// Problems with configuration supplied by the loader, detected before any
/// core is committed to the hypervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    BadSignature,
    /// More CPUs were brought online than the image was built for.
    TooManyCpus { online: u32, max: u32 },
    /// The loader and the image disagree on the per-CPU area layout.
    PercpuSizeMismatch { header: u64, expected: u64 },
    /// The image would not be covered by the single block the bootstrap
    /// map gives it.
    ImageCrossesBlock { base: u64, size: u64 },
    BootMap(BootMapError),
    /// A blob is shorter than its own header claims.
    Truncated { needed: usize, actual: usize },
    /// A cell descriptor names CPUs the image has no per-CPU area for.
    CpuOutOfRange { cpu_set: u64 },
    BadName,
    /// A blob is not aligned for in-place viewing.
    Misaligned,
    /// A load targets memory the cell can't be loaded into.
    NotLoadable { address: u64 },
}

impl From<BootMapError> for ConfigError {
    fn from(e: BootMapError) -> Self {
        Self::BootMap(e)
    }
}

/// Returned by `control::RemoteCpu::request_power_on`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerOnError {
    /// The target is not waiting for power-on.
    AlreadyOn,
}
