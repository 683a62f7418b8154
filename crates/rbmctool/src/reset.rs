//! Sibling BMC reset via GPIO.
//!
//! Runs in the synchronous CLI context; the 50 ms pulse uses a plain
//! blocking sleep.

use anyhow::{bail, Context, Result};
use gpio_cdev::{Chip, Line, LineRequestFlags};
use std::time::Duration;
use tracing::info;

const GPIO_NAME: &str = "sibling-bmc-reset";
const CONSUMER: &str = "Sibling BMC Reset";
const PULSE_WIDTH: Duration = Duration::from_millis(50);

pub fn reset_sibling() -> Result<()> {
    let (line, active_low) = find_reset_line()?;

    let mut flags = LineRequestFlags::OUTPUT;
    if active_low {
        flags |= LineRequestFlags::ACTIVE_LOW;
    }

    info!("Asserting sibling BMC reset GPIO");
    line.request(flags.clone(), 1, CONSUMER)
        .context("asserting the sibling reset line")?;

    std::thread::sleep(PULSE_WIDTH);

    info!("Releasing sibling BMC reset GPIO");
    line.request(flags, 0, CONSUMER)
        .context("releasing the sibling reset line")?;

    println!("Sibling BMC reset");
    Ok(())
}

/// Finds the reset line by name, falling back to the active-low variant.
fn find_reset_line() -> Result<(Line, bool)> {
    let active_low_name = format!("{GPIO_NAME}-n");

    for chip in gpio_cdev::chips().context("enumerating GPIO chips")? {
        let mut chip: Chip = match chip {
            Ok(chip) => chip,
            Err(_) => continue,
        };

        for line in chip.lines() {
            let Ok(line_info) = line.info() else {
                continue;
            };
            match line_info.name() {
                Some(name) if name == GPIO_NAME => return Ok((line, false)),
                Some(name) if name == active_low_name => return Ok((line, true)),
                _ => {}
            }
        }
    }

    bail!("Could not find sibling reset GPIO {GPIO_NAME}");
}
