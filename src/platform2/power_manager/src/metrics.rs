// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Collects suspend metrics and sends them to UMA through metrics_client.

use std::collections::VecDeque;
use std::process::Command;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;

use crate::suspender::DarkResumeWakeRecord;

pub const METRICS_CLIENT: &str = "metrics_client";

pub const SUSPEND_ATTEMPTS_BEFORE_SUCCESS: &str = "Power.SuspendAttemptsBeforeSuccess";
pub const SUSPEND_ATTEMPTS_BEFORE_CANCEL: &str = "Power.SuspendAttemptsBeforeCancel";
const SUSPEND_ATTEMPTS_MAX: isize = 20;

pub const DARK_RESUME_WAKEUPS_PER_HOUR: &str = "Power.DarkResumeWakeupsPerHour";
const DARK_RESUME_WAKEUPS_PER_HOUR_MAX: isize = 60;

pub const DARK_RESUME_WAKE_DURATION_MS: &str = "Power.DarkResumeWakeDurationMs";
const DARK_RESUME_WAKE_DURATION_MS_MAX: isize = 10 * 60 * 1000;

const DEFAULT_BUCKETS: usize = 50;
const SECONDS_PER_HOUR: u64 = 60 * 60;

pub enum DurationMetricUnit {
    Milliseconds,
    Seconds,
}

/// A sample point for a histogram in UMA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsSample {
    name: String,
    value: isize,
    min: isize,
    max: isize,
    buckets: usize,
}

impl MetricsSample {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> isize {
        self.value
    }
}

/// Buffers samples until [`MetricsLogger::flush`].
pub struct MetricsLogger {
    buf: VecDeque<MetricsSample>,
    client: String,
}

impl MetricsLogger {
    pub fn new(client: &str) -> Self {
        Self {
            buf: VecDeque::new(),
            client: client.to_string(),
        }
    }

    pub fn log_metric(&mut self, name: &str, value: isize, min: isize, max: isize, buckets: usize) {
        debug!("Logging metric {} = {}", name, value);
        self.buf.push_back(MetricsSample {
            name: name.to_string(),
            value,
            min,
            // The UMA max is exclusive; callers pass the largest expected value.
            max: max + 1,
            buckets,
        });
    }

    pub fn log_duration_sample(
        &mut self,
        histogram: &str,
        duration: Duration,
        unit: DurationMetricUnit,
        max: isize,
    ) {
        let value = match unit {
            DurationMetricUnit::Milliseconds => duration.as_millis() as u64,
            DurationMetricUnit::Seconds => duration.as_secs(),
        };
        let value = isize::try_from(value).unwrap_or(isize::MAX);
        self.log_metric(histogram, value, 0, max, DEFAULT_BUCKETS);
    }

    /// Logs how many attempts a suspend request took, under the success or cancel histogram.
    pub fn log_suspend_attempts(&mut self, success: bool, num_attempts: u32) {
        let name = if success {
            SUSPEND_ATTEMPTS_BEFORE_SUCCESS
        } else {
            SUSPEND_ATTEMPTS_BEFORE_CANCEL
        };
        self.log_metric(
            name,
            num_attempts as isize,
            1,
            SUSPEND_ATTEMPTS_MAX,
            SUSPEND_ATTEMPTS_MAX as usize + 1,
        );
    }

    /// Logs the dark resume wake rate of a request along with the length of each wake.
    pub fn log_dark_resume_metrics(
        &mut self,
        wake_records: &[DarkResumeWakeRecord],
        suspend_duration: Duration,
    ) {
        let secs = suspend_duration.as_secs();
        if secs == 0 {
            return;
        }
        // Scaled so that requests shorter than an hour still report.
        let wakeups_per_hour = wake_records.len() as u64 * SECONDS_PER_HOUR / secs;
        self.log_metric(
            DARK_RESUME_WAKEUPS_PER_HOUR,
            wakeups_per_hour as isize,
            0,
            DARK_RESUME_WAKEUPS_PER_HOUR_MAX,
            DEFAULT_BUCKETS,
        );

        for record in wake_records {
            self.log_duration_sample(
                DARK_RESUME_WAKE_DURATION_MS,
                record.duration,
                DurationMetricUnit::Milliseconds,
                DARK_RESUME_WAKE_DURATION_MS_MAX,
            );
            self.log_duration_sample(
                &format!("{}.{}", DARK_RESUME_WAKE_DURATION_MS, record.reason),
                record.duration,
                DurationMetricUnit::Milliseconds,
                DARK_RESUME_WAKE_DURATION_MS_MAX,
            );
        }
    }

    /// Sends every buffered sample. Samples that fail to send are dropped.
    pub fn flush(&mut self) -> Result<()> {
        let mut failures = 0;
        for sample in self.buf.drain(..) {
            if let Err(e) = send_sample(&self.client, &sample) {
                warn!("Failed to send metric {}: {:#}", sample.name, e);
                failures += 1;
            }
        }
        if failures > 0 {
            bail!("{} metric(s) failed to send", failures);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Vec<MetricsSample> {
        self.buf.iter().cloned().collect()
    }
}

fn send_sample(client: &str, sample: &MetricsSample) -> Result<()> {
    let status = Command::new(client)
        .arg("--")
        .arg(&sample.name)
        .arg(sample.value.to_string())
        .arg(sample.min.to_string())
        .arg(sample.max.to_string())
        .arg(sample.buckets.to_string())
        .status()
        .with_context(|| format!("Failed to run {}", client))?;
    if !status.success() {
        bail!("{} exited with {:?}", client, status.code());
    }
    Ok(())
}
