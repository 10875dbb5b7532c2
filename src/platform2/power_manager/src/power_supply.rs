// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use log::info;

use crate::util::read_file_to_u64;
use crate::util::read_file_trimmed;
use crate::util::PowerError;

const POWER_SUPPLY_PATH: &str = "sys/class/power_supply";
const POWER_SUPPLY_TYPE: &str = "type";
const POWER_SUPPLY_ONLINE: &str = "online";
const POWER_SUPPLY_CAPACITY: &str = "capacity";

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PowerStatus {
    pub battery_percentage: f64,
    pub line_power_on: bool,
}

pub trait PowerSupply: Send {
    /// Reads the current power status from the hardware, bypassing any cache.
    fn refresh_immediately(&self) -> Result<PowerStatus>;
}

/// See `power_supply_type_text` in the linux kernel.
#[derive(Copy, Clone, Debug, PartialEq)]
enum PowerSupplyType {
    Battery,
    Mains,
    Usb,
    Other,
}

impl FromStr for PowerSupplyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim_end() {
            "Battery" => PowerSupplyType::Battery,
            "Mains" => PowerSupplyType::Mains,
            s if s.starts_with("USB") => PowerSupplyType::Usb,
            _ => PowerSupplyType::Other,
        })
    }
}

#[derive(Clone, Debug)]
pub struct DirectoryPowerSupply {
    pub root: PathBuf,
}

impl PowerSupply for DirectoryPowerSupply {
    /// Iterates through the power supplies in sysfs. The first battery provides the charge
    /// percentage; any online mains or USB supply means line power is connected.
    fn refresh_immediately(&self) -> Result<PowerStatus> {
        let path = self.root.join(POWER_SUPPLY_PATH);
        let dirs = path
            .read_dir()
            .with_context(|| format!("Failed to enumerate power supplies in {}", path.display()))?;

        let mut battery_percentage = None;
        let mut line_power_on = false;

        for result in dirs {
            let supply_path = result?.path();
            let type_path = supply_path.join(POWER_SUPPLY_TYPE);
            if !type_path.exists() {
                continue;
            }
            let supply_type = PowerSupplyType::from_str(&read_file_trimmed(&type_path)?)?;

            match supply_type {
                PowerSupplyType::Battery => {
                    if battery_percentage.is_some() {
                        info!("Ignoring additional battery {}", supply_path.display());
                        continue;
                    }
                    let capacity_path = supply_path.join(POWER_SUPPLY_CAPACITY);
                    let capacity = read_file_to_u64(&capacity_path).with_context(|| {
                        format!("Error reading capacity from {}", capacity_path.display())
                    })?;
                    battery_percentage = Some((capacity as f64).min(100.0));
                }
                PowerSupplyType::Mains | PowerSupplyType::Usb => {
                    let online_path = supply_path.join(POWER_SUPPLY_ONLINE);
                    if !online_path.exists() {
                        continue;
                    }
                    let online = read_file_to_u64(&online_path).with_context(|| {
                        format!("Error reading online from {}", online_path.display())
                    })?;
                    line_power_on |= online == 1;
                }
                PowerSupplyType::Other => {}
            }
        }

        let battery_percentage = battery_percentage
            .ok_or_else(|| PowerError::NoBattery(path.display().to_string()))?;

        Ok(PowerStatus {
            battery_percentage,
            line_power_on,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    fn write_supply(root: &Path, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let dir = root.join(POWER_SUPPLY_PATH).join(name);
        fs::create_dir_all(&dir)?;
        for (attr, value) in attrs {
            fs::write(dir.join(attr), value)?;
        }
        Ok(())
    }

    #[test]
    fn test_battery_only() -> Result<()> {
        let root = tempdir()?;
        write_supply(
            root.path(),
            "BAT0",
            &[("type", "Battery\n"), ("capacity", "57\n")],
        )?;
        let supply = DirectoryPowerSupply {
            root: root.path().to_path_buf(),
        };
        assert_eq!(
            supply.refresh_immediately()?,
            PowerStatus {
                battery_percentage: 57.0,
                line_power_on: false
            }
        );
        Ok(())
    }

    #[test]
    fn test_line_power() -> Result<()> {
        let root = tempdir()?;
        write_supply(
            root.path(),
            "BAT0",
            &[("type", "Battery\n"), ("capacity", "80\n")],
        )?;
        write_supply(root.path(), "AC", &[("type", "Mains\n"), ("online", "0\n")])?;
        let supply = DirectoryPowerSupply {
            root: root.path().to_path_buf(),
        };
        assert!(!supply.refresh_immediately()?.line_power_on);

        write_supply(
            root.path(),
            "CROS_USBPD_CHARGER0",
            &[("type", "USB_PD\n"), ("online", "1\n")],
        )?;
        assert!(supply.refresh_immediately()?.line_power_on);
        Ok(())
    }

    #[test]
    fn test_no_battery() -> Result<()> {
        let root = tempdir()?;
        let supply = DirectoryPowerSupply {
            root: root.path().to_path_buf(),
        };
        // No power_supply directory at all.
        assert!(supply.refresh_immediately().is_err());

        write_supply(root.path(), "AC", &[("type", "Mains\n"), ("online", "1\n")])?;
        let err = supply.refresh_immediately().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PowerError>(),
            Some(PowerError::NoBattery(_))
        ));
        Ok(())
    }
}
