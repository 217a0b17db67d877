// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_consts()?;

    Ok(())
}

fn generate_consts() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=HYP_KCONFIG");
    let config: HypConfig = match env::var("HYP_KCONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(_) => HypConfig::default(),
    };

    if config.max_cpus == 0 || config.max_cpus > 64 {
        return Err(format!(
            "max_cpus must be in 1..=64, got {}",
            config.max_cpus
        )
        .into());
    }
    // The stack top must stay 16-byte aligned for the entry stub.
    if config.percpu_stack_size % 4096 != 0 {
        return Err(format!(
            "percpu_stack_size must be a multiple of 4096, got {}",
            config.percpu_stack_size
        )
        .into());
    }

    let out = &PathBuf::from(env::var_os("OUT_DIR").unwrap());
    let mut file = File::create(out.join("consts.rs")).unwrap();

    writeln!(file, "// See build.rs for details")?;
    writeln!(file, "pub const MAX_CPUS: usize = {};", config.max_cpus)?;
    writeln!(
        file,
        "pub const PERCPU_STACK_SIZE: usize = {};",
        config.percpu_stack_size
    )?;
    writeln!(
        file,
        "pub static PLATFORM: abi::PlatformInfo = abi::PlatformInfo {{ \
         maintenance_irq: {} }};",
        config.platform.maintenance_irq
    )?;

    Ok(())
}

/// Mirror of the `HYP_KCONFIG` document. Every field may be omitted.
#[derive(Deserialize)]
#[serde(default)]
struct HypConfig {
    max_cpus: usize,
    percpu_stack_size: usize,
    platform: abi::PlatformInfo,
}

impl Default for HypConfig {
    fn default() -> Self {
        Self {
            max_cpus: 8,
            percpu_stack_size: 16 * 1024,
            // GIC maintenance PPI on most virt-style boards
            platform: abi::PlatformInfo { maintenance_irq: 25 },
        }
    }
}
