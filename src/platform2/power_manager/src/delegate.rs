// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Production [`Delegate`] that suspends the system through sysfs.

use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::metrics::MetricsLogger;
use crate::suspender::DarkResumeWakeRecord;
use crate::suspender::Delegate;
use crate::suspender::SuspendResult;
use crate::util::checked_command;
use crate::util::read_file_to_u64;
use crate::util::read_file_trimmed;
use crate::util::write_sysfs;

const WAKEUP_COUNT_PATH: &str = "sys/power/wakeup_count";
const POWER_STATE_PATH: &str = "sys/power/state";
const WAKE_ALARM_PATH: &str = "sys/class/rtc/rtc0/wakealarm";
const LID_STATE_GLOB: &str = "proc/acpi/button/lid/*/state";

/// Present while the system is suspended, so an unclean shutdown in suspend can be detected.
const SUSPENDED_MARKER_PATH: &str = "var/lib/power_manager/powerd_suspended";
/// Present between SuspendImminent and SuspendDone. Survives a restart of the daemon.
const SUSPEND_ANNOUNCED_PATH: &str = "run/power_manager/power/suspend_announced";

pub const SHUTDOWN_PROGRAM: &str = "shutdown";

// Suspend ids carry the pid in their upper bits so ids from successive runs differ.
const MAX_PID_BITS: u32 = 32768;
const SUSPEND_IDS_PER_RUN: i32 = 65536;

pub struct SystemDelegate {
    root: PathBuf,
    metrics: MetricsLogger,
    shutdown_program: String,
}

impl SystemDelegate {
    pub fn new(root: &Path, metrics: MetricsLogger, shutdown_program: &str) -> Self {
        SystemDelegate {
            root: root.to_path_buf(),
            metrics,
            shutdown_program: shutdown_program.to_string(),
        }
    }

    fn shut_down(&mut self, reason: &str) {
        info!("Shutting down: {}", reason);
        if let Err(e) = checked_command(Command::new(&self.shutdown_program).args(["-P", "now"]))
        {
            error!("Failed to shut down: {:#}", e);
        }
    }

    fn flush_metrics(&mut self) {
        if let Err(e) = self.metrics.flush() {
            warn!("Failed to send suspend metrics: {:#}", e);
        }
    }

    fn write_wake_alarm(&self, value: &str) -> io::Result<()> {
        write_sysfs(self.root.join(WAKE_ALARM_PATH), value)
    }
}

fn initial_suspend_id() -> i32 {
    (std::process::id() % MAX_PID_BITS) as i32 * SUSPEND_IDS_PER_RUN + 1
}

fn create_marker(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(())
}

fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

impl Delegate for SystemDelegate {
    fn get_initial_suspend_id(&self) -> i32 {
        initial_suspend_id()
    }

    fn get_initial_dark_suspend_id(&self) -> i32 {
        initial_suspend_id() + MAX_PID_BITS as i32
    }

    fn is_lid_closed_for_suspend(&self) -> bool {
        let pattern = self.root.join(LID_STATE_GLOB);
        let paths = match glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Bad lid state pattern {}: {}", pattern.display(), e);
                return false;
            }
        };
        for path in paths.flatten() {
            match read_file_trimmed(&path) {
                Ok(state) => return state.contains("closed"),
                Err(e) => warn!("{:#}", e),
            }
        }
        false
    }

    fn read_suspend_wakeup_count(&mut self) -> Option<u64> {
        let path = self.root.join(WAKEUP_COUNT_PATH);
        match read_file_to_u64(&path) {
            Ok(count) => Some(count),
            Err(e) => {
                error!("Failed to read {}: {:#}", path.display(), e);
                None
            }
        }
    }

    fn set_suspend_announced(&mut self, announced: bool) {
        let path = self.root.join(SUSPEND_ANNOUNCED_PATH);
        let result = if announced {
            create_marker(&path)
        } else {
            remove_marker(&path)
        };
        if let Err(e) = result {
            error!("{:#}", e);
        }
    }

    fn get_suspend_announced(&self) -> bool {
        self.root.join(SUSPEND_ANNOUNCED_PATH).exists()
    }

    fn prepare_to_suspend(&mut self) {
        if let Err(e) = create_marker(&self.root.join(SUSPENDED_MARKER_PATH)) {
            warn!("{:#}", e);
        }
        debug!("Syncing filesystems");
        // This is safe because sync() does not modify memory.
        unsafe {
            libc::sync();
        }
    }

    fn do_suspend(
        &mut self,
        wakeup_count: u64,
        wakeup_count_valid: bool,
        duration: Option<Duration>,
    ) -> SuspendResult {
        // The kernel rejects a stale count, meaning a wakeup event arrived after it was read.
        if wakeup_count_valid {
            let count_path = self.root.join(WAKEUP_COUNT_PATH);
            if let Err(e) = write_sysfs(count_path, &wakeup_count.to_string()) {
                info!("Wakeup count {} was rejected: {}", wakeup_count, e);
                return SuspendResult::Canceled;
            }
        }

        if let Some(duration) = duration {
            if let Err(e) = self.write_wake_alarm(&format!("+{}", duration.as_secs())) {
                warn!("Failed to program wake alarm for {:?}: {}", duration, e);
            }
        }

        let result = match write_sysfs(self.root.join(POWER_STATE_PATH), "mem") {
            Ok(()) => SuspendResult::Success,
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBUSY) | Some(libc::EAGAIN)) => {
                info!("Suspend was aborted by a wakeup event: {}", e);
                SuspendResult::Canceled
            }
            Err(e) => {
                error!("Failed to write to {}: {}", POWER_STATE_PATH, e);
                SuspendResult::Failure
            }
        };

        if duration.is_some() {
            if let Err(e) = self.write_wake_alarm("0") {
                warn!("Failed to clear wake alarm: {}", e);
            }
        }
        result
    }

    fn undo_prepare_to_suspend(&mut self, success: bool, num_suspend_attempts: u32) {
        if let Err(e) = remove_marker(&self.root.join(SUSPENDED_MARKER_PATH)) {
            warn!("{:#}", e);
        }
        self.metrics.log_suspend_attempts(success, num_suspend_attempts);
        self.flush_metrics();
    }

    fn generate_dark_resume_metrics(
        &mut self,
        wake_records: &[DarkResumeWakeRecord],
        suspend_duration: Duration,
    ) {
        self.metrics
            .log_dark_resume_metrics(wake_records, suspend_duration);
        self.flush_metrics();
    }

    fn shut_down_for_failed_suspend(&mut self) {
        self.shut_down("failed to suspend");
    }

    fn shut_down_from_suspend(&mut self) {
        self.shut_down("shutting down from suspend");
    }
}
