//! Platform identity helpers.

use anyhow::{bail, Context, Result};
use std::process::Command;

/// Reads this BMC's position in the pair out of the u-boot environment.
/// A missing or unparseable position is a configuration error.
pub fn read_bmc_position() -> Result<u64> {
    let output = Command::new("fw_printenv")
        .args(["-n", "bmc_position"])
        .output()
        .context("running fw_printenv for bmc_position")?;

    if !output.status.success() {
        bail!(
            "fw_printenv -n bmc_position failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<u64>()
        .with_context(|| format!("could not parse bmc_position from {text:?}"))
}
