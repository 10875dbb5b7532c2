// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::process;

pub use log::LevelFilter;
use log::SetLoggerError;
use stderrlog::StdErrLog;
use syslog::BasicLogger;
use syslog::Facility;
use syslog::Formatter3164;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unix socket syslog setup failed: {0}")]
    SyslogUnix(#[source] syslog::Error),
    #[error("failed to set logger: {0}")]
    SetLoggerError(#[source] SetLoggerError),
}

pub type Result<T> = std::result::Result<T, Error>;

fn get_syslog_logger(ident: String) -> Result<BasicLogger> {
    Ok(BasicLogger::new(
        syslog::unix(Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            pid: process::id(),
            process: ident,
        })
        .map_err(Error::SyslogUnix)?,
    ))
}

/// Initialize logging to the system log, and to stderr too if `log_to_stderr` is true.
pub fn init_with_level(ident: String, log_to_stderr: bool, max_level: LevelFilter) -> Result<()> {
    let syslog_logger = Box::new(get_syslog_logger(ident)?);

    if log_to_stderr {
        let mut stderr_logger = StdErrLog::new();
        stderr_logger.verbosity(max_level as usize);

        match max_level.to_level() {
            Some(level) => {
                multi_log::MultiLogger::init(vec![Box::new(stderr_logger), syslog_logger], level)
            }
            // Nothing to initialize when logging is off.
            None => Ok(()),
        }
    } else {
        log::set_boxed_logger(syslog_logger).map(|()| log::set_max_level(max_level))
    }
    .map_err(Error::SetLoggerError)
}

/// Maps the numeric levels accepted over D-Bus to a filter: 0 is off, 5 is trace.
pub fn level_from_u8(level: u8) -> Option<LevelFilter> {
    match level {
        0 => Some(LevelFilter::Off),
        1 => Some(LevelFilter::Error),
        2 => Some(LevelFilter::Warn),
        3 => Some(LevelFilter::Info),
        4 => Some(LevelFilter::Debug),
        5 => Some(LevelFilter::Trace),
        _ => None,
    }
}
