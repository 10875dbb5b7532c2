// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::mem;
use std::time::Duration;

use log::error;

/// Source of monotonic time that keeps counting while the system is suspended.
pub trait Clock: Send + Sync {
    fn boot_time(&self) -> Duration;
}

/// Reads CLOCK_BOOTTIME.
#[derive(Clone, Copy, Debug, Default)]
pub struct BootClock;

impl Clock for BootClock {
    fn boot_time(&self) -> Duration {
        // Safe because a zeroed timespec is a valid value for the kernel to overwrite.
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        // Safe because ts is a valid, owned timespec and the return value is checked.
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
        if ret != 0 {
            error!(
                "clock_gettime(CLOCK_BOOTTIME) failed: {}",
                std::io::Error::last_os_error()
            );
            return Duration::ZERO;
        }
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_clock_is_monotonic() {
        let clock = BootClock;
        let first = clock.boot_time();
        let second = clock.boot_time();
        assert!(first > Duration::ZERO);
        assert!(second >= first);
    }
}
