// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::error;

use crate::util::PowerError;

/// Read-write preferences, written by tests and developers.
pub const DEFAULT_PREFS_DIR: &str = "/var/lib/power_manager";
/// Read-only preferences shipped with the board.
pub const DEFAULT_READ_ONLY_PREFS_DIR: &str = "/usr/share/power_manager";

pub const RETRY_SUSPEND_MS_PREF: &str = "retry_suspend_ms";
pub const RETRY_SUSPEND_ATTEMPTS_PREF: &str = "retry_suspend_attempts";
pub const MAX_SUSPEND_DELAY_TIMEOUT_MS_PREF: &str = "max_suspend_delay_timeout_ms";
pub const MAX_DARK_SUSPEND_DELAY_TIMEOUT_MS_PREF: &str = "max_dark_suspend_delay_timeout_ms";
pub const DARK_RESUME_SUSPEND_DURATIONS_PREF: &str = "dark_resume_suspend_durations";
pub const DISABLE_DARK_RESUME_PREF: &str = "disable_dark_resume";
pub const DARK_RESUME_DEVICES_PREF: &str = "dark_resume_devices";
pub const DARK_RESUME_SOURCES_PREF: &str = "dark_resume_sources";
pub const SHUTDOWN_FROM_SUSPEND_SEC_PREF: &str = "shutdown_from_suspend_sec";

pub trait PrefsProvider {
    /// Returns the raw value of `name` with trailing whitespace removed, or None if no
    /// preference source defines it.
    fn read_pref(&self, name: &str) -> Result<Option<String>>;
}

/// Reads one file per preference from a list of directories. Earlier directories take
/// precedence.
#[derive(Clone, Debug)]
pub struct DirectoryPrefsProvider {
    pub dirs: Vec<PathBuf>,
}

impl DirectoryPrefsProvider {
    pub fn new_default() -> Self {
        DirectoryPrefsProvider {
            dirs: vec![
                PathBuf::from(DEFAULT_PREFS_DIR),
                PathBuf::from(DEFAULT_READ_ONLY_PREFS_DIR),
            ],
        }
    }
}

impl PrefsProvider for DirectoryPrefsProvider {
    fn read_pref(&self, name: &str) -> Result<Option<String>> {
        for dir in &self.dirs {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            let value = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read pref {}", path.display()))?;
            return Ok(Some(value.trim_end().to_string()));
        }
        Ok(None)
    }
}

fn read_u64_pref(prefs: &dyn PrefsProvider, name: &str, default: u64) -> Result<u64> {
    match prefs.read_pref(name)? {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| PowerError::InvalidPref(name.to_string(), value).into()),
    }
}

fn read_bool_pref(prefs: &dyn PrefsProvider, name: &str, default: bool) -> Result<bool> {
    Ok(read_u64_pref(prefs, name, default as u64)? != 0)
}

fn read_paths_pref(prefs: &dyn PrefsProvider, name: &str) -> Result<Vec<PathBuf>> {
    Ok(prefs
        .read_pref(name)?
        .map(|value| {
            value
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default())
}

/// One row of the dark resume table: at or above `battery_percentage`, suspend for
/// `duration`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SuspendDurationEntry {
    pub battery_percentage: f64,
    pub duration: Duration,
}

/// Parses `"<percent> <seconds>"` lines into a table sorted by battery percentage.
pub fn parse_suspend_durations(value: &str) -> Result<Vec<SuspendDurationEntry>> {
    let mut table = Vec::new();
    for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let entry = match fields.as_slice() {
            [percent, secs] => match (percent.parse::<f64>(), secs.parse::<u64>()) {
                (Ok(battery_percentage), Ok(secs)) if battery_percentage >= 0.0 => {
                    SuspendDurationEntry {
                        battery_percentage,
                        duration: Duration::from_secs(secs),
                    }
                }
                _ => return Err(PowerError::MalformedDurationTable(line.to_string()).into()),
            },
            _ => return Err(PowerError::MalformedDurationTable(line.to_string()).into()),
        };
        table.push(entry);
    }
    table.sort_by(|a, b| a.battery_percentage.total_cmp(&b.battery_percentage));
    Ok(table)
}

/// Everything the suspend machinery reads from preferences at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct SuspendConfig {
    /// Root of the filesystem holding sysfs/procfs. "/" outside of tests.
    pub root: PathBuf,
    pub retry_delay: Duration,
    pub max_retries: u64,
    pub max_delay_timeout: Duration,
    pub max_dark_delay_timeout: Duration,
    pub suspend_durations: Vec<SuspendDurationEntry>,
    pub disable_dark_resume: bool,
    pub dark_resume_devices: Vec<PathBuf>,
    pub dark_resume_sources: Vec<PathBuf>,
    /// Zero disables shutting down from suspend.
    pub shutdown_from_suspend: Duration,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        SuspendConfig {
            root: PathBuf::from("/"),
            retry_delay: Duration::from_millis(10000),
            max_retries: 10,
            max_delay_timeout: Duration::from_millis(10000),
            max_dark_delay_timeout: Duration::from_millis(20000),
            suspend_durations: Vec::new(),
            disable_dark_resume: true,
            dark_resume_devices: Vec::new(),
            dark_resume_sources: Vec::new(),
            shutdown_from_suspend: Duration::ZERO,
        }
    }
}

impl SuspendConfig {
    pub fn load(prefs: &dyn PrefsProvider, root: &Path) -> Result<SuspendConfig> {
        let default = SuspendConfig::default();

        let suspend_durations = match prefs.read_pref(DARK_RESUME_SUSPEND_DURATIONS_PREF)? {
            None => Vec::new(),
            Some(value) => parse_suspend_durations(&value).unwrap_or_else(|e| {
                error!("Ignoring dark resume suspend durations: {:#}", e);
                Vec::new()
            }),
        };

        Ok(SuspendConfig {
            root: root.to_path_buf(),
            retry_delay: Duration::from_millis(read_u64_pref(
                prefs,
                RETRY_SUSPEND_MS_PREF,
                default.retry_delay.as_millis() as u64,
            )?),
            max_retries: read_u64_pref(prefs, RETRY_SUSPEND_ATTEMPTS_PREF, default.max_retries)?,
            max_delay_timeout: Duration::from_millis(read_u64_pref(
                prefs,
                MAX_SUSPEND_DELAY_TIMEOUT_MS_PREF,
                default.max_delay_timeout.as_millis() as u64,
            )?),
            max_dark_delay_timeout: Duration::from_millis(read_u64_pref(
                prefs,
                MAX_DARK_SUSPEND_DELAY_TIMEOUT_MS_PREF,
                default.max_dark_delay_timeout.as_millis() as u64,
            )?),
            suspend_durations,
            disable_dark_resume: read_bool_pref(
                prefs,
                DISABLE_DARK_RESUME_PREF,
                default.disable_dark_resume,
            )?,
            dark_resume_devices: read_paths_pref(prefs, DARK_RESUME_DEVICES_PREF)?,
            dark_resume_sources: read_paths_pref(prefs, DARK_RESUME_SOURCES_PREF)?,
            shutdown_from_suspend: Duration::from_secs(read_u64_pref(
                prefs,
                SHUTDOWN_FROM_SUSPEND_SEC_PREF,
                0,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn write_pref(dir: &Path, name: &str, value: &str) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(name), value)?;
        Ok(())
    }

    #[test]
    fn test_load_defaults() -> Result<()> {
        let root = tempdir()?;
        let prefs = DirectoryPrefsProvider {
            dirs: vec![root.path().join("missing")],
        };
        let config = SuspendConfig::load(&prefs, root.path())?;
        assert_eq!(
            config,
            SuspendConfig {
                root: root.path().to_path_buf(),
                ..Default::default()
            }
        );
        Ok(())
    }

    #[test]
    fn test_read_write_dir_takes_precedence() -> Result<()> {
        let root = tempdir()?;
        let rw = root.path().join("var/lib/power_manager");
        let ro = root.path().join("usr/share/power_manager");
        write_pref(&ro, RETRY_SUSPEND_ATTEMPTS_PREF, "5\n")?;
        write_pref(&ro, RETRY_SUSPEND_MS_PREF, "2000\n")?;
        write_pref(&rw, RETRY_SUSPEND_MS_PREF, "500\n")?;
        write_pref(&ro, DISABLE_DARK_RESUME_PREF, "0")?;
        write_pref(&ro, SHUTDOWN_FROM_SUSPEND_SEC_PREF, "3600")?;

        let prefs = DirectoryPrefsProvider { dirs: vec![rw, ro] };
        let config = SuspendConfig::load(&prefs, root.path())?;
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.max_retries, 5);
        assert!(!config.disable_dark_resume);
        assert_eq!(config.shutdown_from_suspend, Duration::from_secs(3600));
        Ok(())
    }

    #[test]
    fn test_invalid_number_is_an_error() -> Result<()> {
        let root = tempdir()?;
        write_pref(root.path(), RETRY_SUSPEND_ATTEMPTS_PREF, "many")?;
        let prefs = DirectoryPrefsProvider {
            dirs: vec![root.path().to_path_buf()],
        };
        let err = SuspendConfig::load(&prefs, root.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PowerError>(),
            Some(PowerError::InvalidPref(name, _)) if name == RETRY_SUSPEND_ATTEMPTS_PREF
        ));
        Ok(())
    }

    #[test]
    fn test_parse_suspend_durations() -> Result<()> {
        let table = parse_suspend_durations("50.0 100\n0.0 10\n\n20.0 50\n")?;
        assert_eq!(
            table,
            vec![
                SuspendDurationEntry {
                    battery_percentage: 0.0,
                    duration: Duration::from_secs(10)
                },
                SuspendDurationEntry {
                    battery_percentage: 20.0,
                    duration: Duration::from_secs(50)
                },
                SuspendDurationEntry {
                    battery_percentage: 50.0,
                    duration: Duration::from_secs(100)
                },
            ]
        );
        assert!(parse_suspend_durations("")?.is_empty());
        assert!(parse_suspend_durations("10").is_err());
        assert!(parse_suspend_durations("ten 10").is_err());
        assert!(parse_suspend_durations("10 -5").is_err());
        Ok(())
    }

    #[test]
    fn test_malformed_table_disables_dark_resume_table() -> Result<()> {
        let root = tempdir()?;
        write_pref(root.path(), DARK_RESUME_SUSPEND_DURATIONS_PREF, "0.0 10\nbogus")?;
        write_pref(
            root.path(),
            DARK_RESUME_DEVICES_PREF,
            "/sys/devices/a\n\n/sys/devices/b\n",
        )?;
        let prefs = DirectoryPrefsProvider {
            dirs: vec![root.path().to_path_buf()],
        };
        let config = SuspendConfig::load(&prefs, root.path())?;
        assert!(config.suspend_durations.is_empty());
        assert_eq!(
            config.dark_resume_devices,
            vec![
                PathBuf::from("/sys/devices/a"),
                PathBuf::from("/sys/devices/b")
            ]
        );
        Ok(())
    }
}
