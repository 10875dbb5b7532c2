// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hosts the suspend machinery of the power manager as a D-Bus service.

use std::path::PathBuf;

use anyhow::bail;
use anyhow::Result;
use getopts::Options;
use log::error;
use log::info;
use power_manager::config::DirectoryPrefsProvider;
use power_manager::config::DEFAULT_PREFS_DIR;
use power_manager::config::DEFAULT_READ_ONLY_PREFS_DIR;
use power_manager::dbus;
use power_manager::syslog;
use tokio::runtime::Builder;

const IDENT: &str = "powerd_suspend";

fn usage(options: &Options) -> String {
    options.usage(&format!("Usage: {} [options]", IDENT))
}

fn main() -> Result<()> {
    let mut opts = Options::new();
    opts.optflag("h", "help", "Print this help text");
    opts.optflag("", "log_to_stderr", "Log to stderr in addition to syslog");
    opts.optflag("v", "verbose", "Log debug messages");
    opts.optopt(
        "",
        "prefs_dir",
        &format!("Read-write preferences directory (default {})", DEFAULT_PREFS_DIR),
        "DIR",
    );
    opts.optopt(
        "",
        "default_prefs_dir",
        &format!(
            "Read-only preferences directory (default {})",
            DEFAULT_READ_ONLY_PREFS_DIR
        ),
        "DIR",
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let matches = match opts.parse(args) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", usage(&opts));
            bail!("Failed to parse arguments: {}", e);
        }
    };
    if matches.opt_present("h") {
        println!("{}", usage(&opts));
        return Ok(());
    }

    let level = if matches.opt_present("v") {
        syslog::LevelFilter::Debug
    } else {
        syslog::LevelFilter::Info
    };
    // The default log level can be changed later with the SetLogLevel method.
    if let Err(e) = syslog::init_with_level(
        IDENT.to_string(),
        matches.opt_present("log_to_stderr"),
        level,
    ) {
        bail!("Failed to initialize syslog: {}", e);
    }

    let mut prefs = DirectoryPrefsProvider::new_default();
    if let Some(dir) = matches.opt_str("prefs_dir") {
        prefs.dirs[0] = PathBuf::from(dir);
    }
    if let Some(dir) = matches.opt_str("default_prefs_dir") {
        prefs.dirs[1] = PathBuf::from(dir);
    }

    info!("Starting {}", IDENT);

    let rt = Builder::new_current_thread().enable_all().build()?;
    if let Err(err) = rt.block_on(dbus::service_main(prefs)) {
        error!("The D-Bus service main returns error: {:#}", err);
        return Err(err);
    }

    Ok(())
}
