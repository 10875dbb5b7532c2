// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Common error type and sysfs helpers used throughout the crate.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use anyhow::Context;
use anyhow::Result;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum PowerError {
    /// A preference file held a value that could not be parsed.
    #[error("Invalid value for pref {0}: {1:?}")]
    InvalidPref(String, String),
    /// A line of the battery-to-duration table was malformed.
    #[error("Malformed suspend duration entry: {0:?}")]
    MalformedDurationTable(String),
    /// A suspend delay was registered with a negative timeout.
    #[error("Negative suspend delay timeout: {0} ms")]
    NegativeDelayTimeout(i64),
    /// A suspend delay was registered without a description.
    #[error("Suspend delay description is empty")]
    EmptyDelayDescription,
    /// Only the default suspend flavor is supported.
    #[error("Unsupported suspend flavor: {0}")]
    UnsupportedFlavor(u32),
    /// Display modes other than normal (0) and presentation (1) are rejected.
    #[error("Invalid display mode: {0}")]
    InvalidDisplayMode(u32),
    /// Log levels run from 0 (off) to 5 (trace).
    #[error("Unsupported log level: {0}")]
    InvalidLogLevel(u8),
    /// No battery was found under the power supply directory.
    #[error("No battery found in {0}")]
    NoBattery(String),
    /// A spawned process exited unsuccessfully.
    #[error("Spawned process exited with {0}")]
    SpawnedProcessError(i32),
}

fn parse_file_to_u64<R: BufRead>(reader: R) -> Result<u64> {
    let first_line = reader.lines().next().context("No content in buffer")??;
    first_line
        .trim()
        .parse()
        .with_context(|| format!("Couldn't parse \"{}\" as u64", first_line))
}

/// Get the first line in a file and parse as u64.
pub fn read_file_to_u64<P: AsRef<Path>>(filename: P) -> Result<u64> {
    let reader = File::open(filename).map(BufReader::new)?;
    parse_file_to_u64(reader)
}

/// Reads a whole file with trailing whitespace removed.
pub fn read_file_trimmed<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content.trim_end().to_string())
}

/// Writes `value` to a sysfs attribute in a single write call.
///
/// sysfs attributes report errors (EBUSY, EINVAL, ...) from the write itself, so the raw
/// `io::Error` is returned for callers that need to inspect it.
pub fn write_sysfs<P: AsRef<Path>>(path: P, value: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.as_bytes())
}

/// Runs `command` to completion and converts its exit status into a Result.
pub fn checked_command(command: &mut Command) -> Result<()> {
    let mut child = command.spawn().context("Failed to spawn child process")?;
    let exit_status = child.wait().context("Failed to wait for child")?;
    if exit_status.success() {
        Ok(())
    } else {
        let code = exit_status.code().unwrap_or(-2);
        Err(PowerError::SpawnedProcessError(code)).context(format!(
            "Command {} failed with code {}",
            command.get_program().to_string_lossy(),
            code
        ))
    }
}
