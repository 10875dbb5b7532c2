// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decides what to do when the system wakes without the user present ("dark resume").

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::config::SuspendConfig;
use crate::config::SuspendDurationEntry;
use crate::power_supply::PowerSupply;
use crate::util::read_file_trimmed;
use crate::util::write_sysfs;

const POWER_DIR: &str = "power";
const DARK_RESUME_ACTIVE_FILE: &str = "dark_resume_active";
const WAKEUP_TYPE_FILE: &str = "wakeup_type";
const ACTIVE_ENABLED: &str = "enabled";
const ACTIVE_DISABLED: &str = "disabled";
const WAKEUP_TYPE_ENABLED: &str = "automatic";
const WAKEUP_TYPE_DISABLED: &str = "unknown";

const WAKEUP_TYPE_PATH: &str = "sys/power/wakeup_type";
const LEGACY_STATE_PATH: &str = "sys/power/dark_resume_state";
const PM_TEST_PATH: &str = "sys/power/pm_test";
const POWER_STATE_PATH: &str = "sys/power/state";

/// What to do with the next suspend attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Suspend,
    ShutDown,
}

pub trait DarkResumeInterface: Send {
    /// Called when a new suspend request starts.
    fn prepare_for_request(&mut self);

    /// Called before every suspend attempt. The duration, if any, bounds the next sleep.
    fn get_action_for_suspend_attempt(&mut self) -> (Action, Option<Duration>);

    /// Re-reads whether the last wake was a dark resume.
    fn handle_successful_resume(&mut self);

    fn in_dark_resume(&self) -> bool;

    fn is_enabled(&self) -> bool;

    /// Transitions devices out of dark resume. Returns false on failure.
    fn exit_dark_resume(&mut self) -> bool;

    /// Called when the suspend request finishes.
    fn undo_prepare_for_request(&mut self);
}

pub struct DarkResumePolicy<P: PowerSupply> {
    power_supply: P,
    root: PathBuf,
    enabled: bool,
    suspend_durations: Vec<SuspendDurationEntry>,
    dark_resume_devices: Vec<PathBuf>,
    dark_resume_sources: Vec<PathBuf>,

    in_dark_resume: bool,
    // Battery charge below which a dark resume shuts the system down.
    battery_shutdown_threshold: f64,
    // Set between prepare_for_request() and undo_prepare_for_request().
    recheck_armed: bool,
}

impl<P: PowerSupply> DarkResumePolicy<P> {
    pub fn new(power_supply: P, config: &SuspendConfig) -> Self {
        let enabled = !config.disable_dark_resume && !config.suspend_durations.is_empty();
        info!(
            "Dark resume user space {}",
            if enabled { "enabled" } else { "disabled" }
        );
        let policy = DarkResumePolicy {
            power_supply,
            root: config.root.clone(),
            enabled,
            suspend_durations: config.suspend_durations.clone(),
            dark_resume_devices: config.dark_resume_devices.clone(),
            dark_resume_sources: config.dark_resume_sources.clone(),
            in_dark_resume: false,
            battery_shutdown_threshold: 0.0,
            recheck_armed: false,
        };
        policy.set_devices_state(enabled);
        policy
    }

    /// Computes the action for the current battery state and updates the shutdown
    /// threshold.
    pub fn get_action(
        &mut self,
        battery_percentage: f64,
        line_power_on: bool,
        in_dark_resume: bool,
    ) -> (Action, Option<Duration>) {
        let duration = self
            .suspend_durations
            .iter()
            .rev()
            .find(|entry| entry.battery_percentage <= battery_percentage)
            .map(|entry| entry.duration);

        if !in_dark_resume || battery_percentage > self.battery_shutdown_threshold {
            self.battery_shutdown_threshold = battery_percentage;
        }

        if in_dark_resume && battery_percentage < self.battery_shutdown_threshold && !line_power_on
        {
            info!(
                "Battery dropped to {:.1}% (threshold {:.1}%) in dark resume",
                battery_percentage, self.battery_shutdown_threshold
            );
            return (Action::ShutDown, None);
        }
        (Action::Suspend, duration)
    }

    fn set_devices_state(&self, enabled: bool) {
        let (active, wakeup_type) = if enabled {
            (ACTIVE_ENABLED, WAKEUP_TYPE_ENABLED)
        } else {
            (ACTIVE_DISABLED, WAKEUP_TYPE_DISABLED)
        };
        for device in &self.dark_resume_devices {
            write_device_attr(device, DARK_RESUME_ACTIVE_FILE, active);
        }
        for source in &self.dark_resume_sources {
            write_device_attr(source, WAKEUP_TYPE_FILE, wakeup_type);
        }
    }

    fn read_dark_resume_state(&self) -> Result<bool> {
        let wakeup_type_path = self.root.join(WAKEUP_TYPE_PATH);
        if wakeup_type_path.exists() {
            return Ok(read_file_trimmed(&wakeup_type_path)? == WAKEUP_TYPE_ENABLED);
        }
        let legacy_path = self.root.join(LEGACY_STATE_PATH);
        Ok(read_file_trimmed(&legacy_path)? == "1")
    }

    fn pm_test_resuspend(&self) -> Result<()> {
        let pm_test = self.root.join(PM_TEST_PATH);
        write_sysfs(&pm_test, "devices").context("Failed to set pm_test to devices")?;
        let suspend_result =
            write_sysfs(self.root.join(POWER_STATE_PATH), "mem").context("Failed to resuspend");
        // pm_test must be reset even if the resuspend failed.
        write_sysfs(&pm_test, "none").context("Failed to reset pm_test")?;
        suspend_result
    }
}

fn write_device_attr(device: &Path, file: &str, value: &str) {
    let path = device.join(POWER_DIR).join(file);
    if let Err(e) = fs::write(&path, value) {
        error!("Failed to write {} to {}: {}", value, path.display(), e);
    }
}

impl<P: PowerSupply> DarkResumeInterface for DarkResumePolicy<P> {
    fn prepare_for_request(&mut self) {
        self.recheck_armed = self.enabled;
    }

    fn get_action_for_suspend_attempt(&mut self) -> (Action, Option<Duration>) {
        if !self.enabled {
            return (Action::Suspend, None);
        }
        let status = match self.power_supply.refresh_immediately() {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to refresh power status; suspending indefinitely: {:#}", e);
                return (Action::Suspend, None);
            }
        };
        let (action, duration) = self.get_action(
            status.battery_percentage,
            status.line_power_on,
            self.in_dark_resume,
        );
        debug!(
            "Dark resume action {:?} for {:.1}% battery, duration {:?}",
            action, status.battery_percentage, duration
        );
        if self.recheck_armed {
            (action, duration)
        } else {
            (action, None)
        }
    }

    fn handle_successful_resume(&mut self) {
        if !self.enabled {
            self.in_dark_resume = false;
            return;
        }
        self.in_dark_resume = match self.read_dark_resume_state() {
            Ok(in_dark_resume) => in_dark_resume,
            Err(e) => {
                error!("Unable to read dark resume state: {:#}", e);
                false
            }
        };
        if self.in_dark_resume {
            info!("In dark resume");
        }
    }

    fn in_dark_resume(&self) -> bool {
        self.in_dark_resume
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn exit_dark_resume(&mut self) -> bool {
        info!("Exiting dark resume");
        match self.pm_test_resuspend() {
            Ok(()) => {
                self.in_dark_resume = false;
                true
            }
            Err(e) => {
                error!("Failed to exit dark resume: {:#}", e);
                false
            }
        }
    }

    fn undo_prepare_for_request(&mut self) {
        self.recheck_armed = false;
        if self.in_dark_resume && !self.exit_dark_resume() {
            warn!("Devices may still be in the dark resume state");
        }
    }
}

impl<P: PowerSupply> Drop for DarkResumePolicy<P> {
    fn drop(&mut self) {
        if self.enabled {
            self.set_devices_state(false);
        }
    }
}
