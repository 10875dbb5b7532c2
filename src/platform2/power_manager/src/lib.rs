// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Suspend and resume orchestration for the power manager.

pub mod clock;
pub mod config;
pub mod dark_resume;
pub mod dbus;
pub mod delegate;
pub mod event_loop;
pub mod metrics;
pub mod power_supply;
pub mod shutdown_from_suspend;
pub mod suspend_delay;
pub mod suspender;
pub mod syslog;
pub mod util;

#[cfg(test)]
mod test_utils;
