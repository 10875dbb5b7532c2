// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deferred work and one-shot timers for the suspend machinery.
//!
//! Every component runs on one logical thread. Work that must not run re-entrantly (the
//! "all delays are ready" notification of an empty barrier, timer expirations) is posted as
//! a [`LoopMessage`] and dispatched by the owner of the loop once the current call returns.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::ptr::null_mut;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use libc::itimerspec;
use libc::time_t;
use libc::timerfd_create;
use libc::timerfd_settime;
use libc::CLOCK_BOOTTIME;
use libc::CLOCK_BOOTTIME_ALARM;
use libc::TFD_CLOEXEC;
use libc::TFD_NONBLOCK;
use log::debug;
use log::error;
use log::warn;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Identifies one of the two delay barriers owned by the suspender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    Normal,
    Dark,
}

impl BarrierKind {
    pub fn name(self) -> &'static str {
        match self {
            BarrierKind::Normal => "suspend",
            BarrierKind::Dark => "dark suspend",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    DelayExpiration(BarrierKind),
    Resuspend,
    ShutdownFromSuspend,
}

/// Names one arming of a timer. Firings carrying a stale generation are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopMessage {
    /// A barrier was prepared with no registered delays.
    DelaysReady {
        barrier: BarrierKind,
        attempt_id: i32,
    },
    TimerFired(TimerToken),
    /// Events were queued from outside an event handler.
    ProcessQueuedEvents,
}

pub trait EventLoop: Send + Sync {
    /// Queues `msg` for the next loop iteration.
    fn post(&self, msg: LoopMessage);

    /// Arms a timer that posts `LoopMessage::TimerFired(token)` after `delay`. A timer of the
    /// same kind that is still pending is replaced. Wake-capable timers also fire (and wake
    /// the system) while it is suspended.
    fn start_timer(&self, token: TimerToken, delay: Duration, wake_capable: bool);

    fn cancel_timer(&self, kind: TimerKind);
}

/// A single-shot timer driven by an [`EventLoop`].
pub struct OneShotTimer {
    kind: TimerKind,
    wake_capable: bool,
    generation: u64,
    running: bool,
    event_loop: Arc<dyn EventLoop>,
}

impl OneShotTimer {
    pub fn new(kind: TimerKind, wake_capable: bool, event_loop: Arc<dyn EventLoop>) -> Self {
        OneShotTimer {
            kind,
            wake_capable,
            generation: 0,
            running: false,
            event_loop,
        }
    }

    /// (Re)starts the timer. Any earlier arming is forgotten.
    pub fn start(&mut self, delay: Duration) {
        self.generation += 1;
        self.running = true;
        self.event_loop.start_timer(
            TimerToken {
                kind: self.kind,
                generation: self.generation,
            },
            delay,
            self.wake_capable,
        );
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.generation += 1;
        self.running = false;
        self.event_loop.cancel_timer(self.kind);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns true if `token` is the firing of the current arming, and marks the timer as
    /// stopped.
    pub fn claim(&mut self, token: TimerToken) -> bool {
        if !self.running || token.kind != self.kind || token.generation != self.generation {
            debug!("Ignoring stale {:?} timer firing", token.kind);
            return false;
        }
        self.running = false;
        true
    }
}

/// A timerfd whose expiration can be awaited from tokio.
struct AlarmTimer {
    fd: AsyncFd<File>,
}

impl AlarmTimer {
    /// Arms a timerfd on CLOCK_BOOTTIME_ALARM, falling back to CLOCK_BOOTTIME if the process
    /// lacks CAP_WAKE_ALARM.
    fn new(delay: Duration) -> Result<Self> {
        let file = match create_timer_fd(CLOCK_BOOTTIME_ALARM) {
            Ok(file) => file,
            Err(e) => {
                warn!("Wake-capable timers unavailable, using CLOCK_BOOTTIME: {:#}", e);
                create_timer_fd(CLOCK_BOOTTIME)?
            }
        };

        // Safe since spec is a c struct where all-zeros is valid
        let mut spec: itimerspec = unsafe { mem::zeroed() };
        spec.it_value.tv_sec = delay.as_secs() as time_t;
        spec.it_value.tv_nsec = delay.subsec_nanos() as libc::c_long;
        if delay.is_zero() {
            // An all-zero it_value disarms the timer instead of firing immediately.
            spec.it_value.tv_nsec = 1;
        }

        // Safe because it doesn't modify memory and we check the return value.
        let ret = unsafe { timerfd_settime(file.as_raw_fd(), 0, &spec, null_mut()) };
        if ret < 0 {
            bail!(
                "Failed to arm timer fd: {}",
                std::io::Error::last_os_error()
            );
        }

        Ok(AlarmTimer {
            fd: AsyncFd::new(file).context("Failed to register timer fd")?,
        })
    }

    async fn wait(&self) -> Result<()> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut expirations = [0u8; 8];
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(&mut expirations)
            }) {
                Ok(result) => {
                    result.context("Failed to read timer fd")?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

fn create_timer_fd(clock_id: libc::clockid_t) -> Result<File> {
    // Safe because we check the return value.
    let timer_fd = unsafe { timerfd_create(clock_id, TFD_CLOEXEC | TFD_NONBLOCK) };
    if timer_fd < 0 {
        bail!(
            "Failed to create timer fd: {}",
            std::io::Error::last_os_error()
        );
    }
    // Safe since we own the fd
    Ok(unsafe { File::from_raw_fd(timer_fd) })
}

/// [`EventLoop`] backed by a tokio channel. The receiver returned by [`TokioEventLoop::new`]
/// must be drained by the task that owns the suspender.
pub struct TokioEventLoop {
    sender: UnboundedSender<LoopMessage>,
    timers: Mutex<HashMap<TimerKind, JoinHandle<()>>>,
}

impl TokioEventLoop {
    pub fn new() -> (Self, UnboundedReceiver<LoopMessage>) {
        let (sender, receiver) = unbounded_channel();
        (
            TokioEventLoop {
                sender,
                timers: Mutex::new(HashMap::new()),
            },
            receiver,
        )
    }

    fn replace_timer(&self, kind: TimerKind, handle: Option<JoinHandle<()>>) {
        let mut timers = match self.timers.lock() {
            Ok(timers) => timers,
            Err(e) => {
                error!("Timer table lock poisoned: {}", e);
                return;
            }
        };
        let old = match handle {
            Some(handle) => timers.insert(kind, handle),
            None => timers.remove(&kind),
        };
        if let Some(old) = old {
            old.abort();
        }
    }
}

impl EventLoop for TokioEventLoop {
    fn post(&self, msg: LoopMessage) {
        if self.sender.send(msg).is_err() {
            error!("Event loop is gone, dropping {:?}", msg);
        }
    }

    fn start_timer(&self, token: TimerToken, delay: Duration, wake_capable: bool) {
        let sender = self.sender.clone();
        let msg = LoopMessage::TimerFired(token);

        let alarm = if wake_capable {
            match AlarmTimer::new(delay) {
                Ok(alarm) => Some(alarm),
                Err(e) => {
                    error!("Failed to create alarm timer for {:?}: {:#}", token.kind, e);
                    None
                }
            }
        } else {
            None
        };

        let handle = tokio::spawn(async move {
            match alarm {
                Some(alarm) => {
                    if let Err(e) = alarm.wait().await {
                        error!("Waiting for alarm timer failed: {:#}", e);
                        return;
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            // If the receiver is gone the daemon is exiting.
            let _ = sender.send(msg);
        });
        self.replace_timer(token.kind, Some(handle));
    }

    fn cancel_timer(&self, kind: TimerKind) {
        self.replace_timer(kind, None);
    }
}
