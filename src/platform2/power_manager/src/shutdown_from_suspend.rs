// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shuts the system down after it has spent too long suspended on battery.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use log::warn;

use crate::config::SuspendConfig;
use crate::dark_resume::Action;
use crate::event_loop::EventLoop;
use crate::event_loop::OneShotTimer;
use crate::event_loop::TimerKind;
use crate::event_loop::TimerToken;
use crate::power_supply::PowerSupply;

pub trait ShutdownFromSuspendInterface: Send {
    /// Called before every suspend attempt.
    fn prepare_for_suspend_attempt(&mut self) -> Action;

    fn handle_dark_resume(&mut self);

    fn handle_full_resume(&mut self);

    /// Delivers a firing of the shutdown timer.
    fn handle_timer(&mut self, token: TimerToken);
}

pub struct ShutdownFromSuspendPolicy<P: PowerSupply> {
    power_supply: P,
    enabled: bool,
    shutdown_after: Duration,
    in_dark_resume: bool,
    timer_fired: bool,
    timer: OneShotTimer,
}

impl<P: PowerSupply> ShutdownFromSuspendPolicy<P> {
    pub fn new(power_supply: P, config: &SuspendConfig, event_loop: Arc<dyn EventLoop>) -> Self {
        let enabled = !config.shutdown_from_suspend.is_zero() && !config.disable_dark_resume;
        if enabled {
            info!(
                "Shutting down after {} s of suspend on battery",
                config.shutdown_from_suspend.as_secs()
            );
        }
        ShutdownFromSuspendPolicy {
            power_supply,
            enabled,
            shutdown_after: config.shutdown_from_suspend,
            in_dark_resume: false,
            timer_fired: false,
            timer: OneShotTimer::new(TimerKind::ShutdownFromSuspend, true, event_loop),
        }
    }

    fn on_line_power(&self) -> bool {
        match self.power_supply.refresh_immediately() {
            Ok(status) => status.line_power_on,
            Err(e) => {
                // Powering off on a stale reading could drop a charging device.
                warn!("Failed to refresh power status: {:#}", e);
                true
            }
        }
    }
}

impl<P: PowerSupply> ShutdownFromSuspendInterface for ShutdownFromSuspendPolicy<P> {
    fn prepare_for_suspend_attempt(&mut self) -> Action {
        if !self.enabled {
            return Action::Suspend;
        }

        if self.in_dark_resume && self.timer_fired {
            if self.on_line_power() {
                info!("Shutdown timer expired but line power is connected");
                return Action::Suspend;
            }
            info!("Shutting down after {:?} in suspend", self.shutdown_after);
            return Action::ShutDown;
        }

        if !self.timer.is_running() {
            self.timer.start(self.shutdown_after);
        }
        Action::Suspend
    }

    fn handle_dark_resume(&mut self) {
        self.in_dark_resume = true;
    }

    fn handle_full_resume(&mut self) {
        self.in_dark_resume = false;
        self.timer.stop();
        self.timer_fired = false;
    }

    fn handle_timer(&mut self, token: TimerToken) {
        if self.timer.claim(token) {
            info!("Shutdown-from-suspend timer fired");
            self.timer_fired = true;
        }
    }
}
