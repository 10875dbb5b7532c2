// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sequences suspend requests: waiting for suspend delays, suspending the system, dark
//! resume cycles, retries, and cancellation.
//!
//! A request starts when [`Suspender::request_suspend`] is called in the idle state. Clients
//! that registered suspend delays are sent a SuspendImminent signal and must report
//! readiness (or time out) before the system is suspended. If the system wakes into dark
//! resume, clients holding dark suspend delays get DarkSuspendImminent and the system is
//! resuspended once they are ready. The request ends with a SuspendDone signal after a full
//! resume, or when it is canceled by user activity.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::clock::Clock;
use crate::config::SuspendConfig;
use crate::dark_resume::Action;
use crate::dark_resume::DarkResumeInterface;
use crate::event_loop::BarrierKind;
use crate::event_loop::EventLoop;
use crate::event_loop::LoopMessage;
use crate::event_loop::OneShotTimer;
use crate::event_loop::TimerKind;
use crate::event_loop::TimerToken;
use crate::shutdown_from_suspend::ShutdownFromSuspendInterface;
use crate::suspend_delay::DelayBarrier;

/// Reason reported for a dark resume wake until a client records a better one.
pub const DEFAULT_WAKE_REASON: &str = "Other";

const INITIAL_DELAY_ID: i32 = 1;
const INITIAL_DARK_DELAY_ID: i32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendResult {
    /// The system suspended and resumed.
    Success,
    /// A wakeup event raced the suspend.
    Canceled,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendReason {
    Idle = 0,
    LidClosed = 1,
    Other = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayMode {
    Normal,
    Presentation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendState {
    Idle,
    WaitingForNormalDelays,
    WaitingForDarkDelays,
    WaitingToRetry,
    ShuttingDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuspendRequest {
    pub reason: SuspendReason,
    pub external_wakeup_count: Option<u64>,
    pub duration: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendEvent {
    SuspendRequested(SuspendRequest),
    NormalDelaysReady,
    ReadyToResuspend,
    UserActivity,
    WakeNotification,
    DisplayModeChange,
    ShutdownStarted,
}

/// One dark resume wake cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DarkResumeWakeRecord {
    pub reason: String,
    pub duration: Duration,
}

/// Performs the system-level work on behalf of [`Suspender`].
pub trait Delegate: Send {
    /// First suspend id; used so ids from successive daemon runs don't collide.
    fn get_initial_suspend_id(&self) -> i32;

    fn get_initial_dark_suspend_id(&self) -> i32;

    fn is_lid_closed_for_suspend(&self) -> bool;

    /// Returns the kernel wakeup count, or None if it couldn't be read.
    fn read_suspend_wakeup_count(&mut self) -> Option<u64>;

    /// Persists whether a SuspendImminent signal was sent without a matching SuspendDone.
    fn set_suspend_announced(&mut self, announced: bool);

    fn get_suspend_announced(&self) -> bool;

    fn prepare_to_suspend(&mut self);

    /// Suspends the system. When `wakeup_count_valid` is set, the suspend is canceled if
    /// the kernel wakeup count no longer matches `wakeup_count`. A duration programs a
    /// wake alarm.
    fn do_suspend(
        &mut self,
        wakeup_count: u64,
        wakeup_count_valid: bool,
        duration: Option<Duration>,
    ) -> SuspendResult;

    fn undo_prepare_to_suspend(&mut self, success: bool, num_suspend_attempts: u32);

    fn generate_dark_resume_metrics(
        &mut self,
        wake_records: &[DarkResumeWakeRecord],
        suspend_duration: Duration,
    );

    fn shut_down_for_failed_suspend(&mut self);

    fn shut_down_from_suspend(&mut self);
}

/// Emits the suspend D-Bus signals.
pub trait SignalSender: Send + Sync {
    fn suspend_imminent(&self, suspend_id: i32, reason: SuspendReason);

    fn dark_suspend_imminent(&self, suspend_id: i32);

    fn suspend_done(&self, suspend_id: i32, suspend_duration: Duration);
}

type EventQueue = Arc<Mutex<VecDeque<SuspendEvent>>>;

fn push_event(queue: &EventQueue, event: SuspendEvent) {
    match queue.lock() {
        Ok(mut queue) => queue.push_back(event),
        Err(e) => error!("Suspend event queue lock poisoned, dropping {:?}: {}", event, e),
    }
}

/// Feeds events to a [`Suspender`] without borrowing it. Events are handled once the
/// suspender finishes the event it is currently handling, or on the next loop iteration.
#[derive(Clone)]
pub struct SuspenderHandle {
    queue: EventQueue,
    event_loop: Arc<dyn EventLoop>,
}

impl SuspenderHandle {
    fn push(&self, event: SuspendEvent) {
        push_event(&self.queue, event);
        self.event_loop.post(LoopMessage::ProcessQueuedEvents);
    }

    pub fn request_suspend(&self, reason: SuspendReason, duration: Option<Duration>) {
        self.push(SuspendEvent::SuspendRequested(SuspendRequest {
            reason,
            external_wakeup_count: None,
            duration,
        }));
    }

    pub fn handle_shutdown(&self) {
        self.push(SuspendEvent::ShutdownStarted);
    }
}

// A dark resume wake whose duration is not known yet.
struct WakeInProgress {
    reason: String,
    start: Duration,
}

pub struct Suspender<D: Delegate, R: DarkResumeInterface, F: ShutdownFromSuspendInterface> {
    delegate: D,
    dark_resume: R,
    shutdown_from_suspend: F,
    signals: Arc<dyn SignalSender>,
    event_loop: Arc<dyn EventLoop>,
    clock: Arc<dyn Clock>,

    normal_barrier: DelayBarrier,
    dark_barrier: DelayBarrier,
    resuspend_timer: OneShotTimer,
    retry_delay: Duration,
    max_retries: u64,

    state: SuspendState,
    queue: EventQueue,
    handling_event: bool,

    suspend_id: i32,
    dark_suspend_id: i32,
    suspend_request_start: Duration,
    // Requested length of the next suspend; cleared after a successful one.
    suspend_duration: Option<Duration>,
    wakeup_count: u64,
    wakeup_count_valid: bool,
    // The request carried a wakeup count from its caller.
    external_wakeup_count: bool,
    current_num_attempts: u32,
    initial_num_attempts: u32,
    display_mode: DisplayMode,

    wake_in_progress: Option<WakeInProgress>,
    wake_records: Vec<DarkResumeWakeRecord>,
}

impl<D: Delegate, R: DarkResumeInterface, F: ShutdownFromSuspendInterface> Suspender<D, R, F> {
    pub fn new(
        mut delegate: D,
        dark_resume: R,
        shutdown_from_suspend: F,
        signals: Arc<dyn SignalSender>,
        event_loop: Arc<dyn EventLoop>,
        clock: Arc<dyn Clock>,
        config: &SuspendConfig,
    ) -> Self {
        // Ids are bumped before use and wrap around instead of overflowing.
        let suspend_id = delegate.get_initial_suspend_id().wrapping_sub(1);
        let dark_suspend_id = delegate.get_initial_dark_suspend_id().wrapping_sub(1);

        // A SuspendImminent without SuspendDone means powerd died mid-request. Clients may
        // still be waiting, so let them know it's over.
        if delegate.get_suspend_announced() {
            info!("Previous run exited mid-suspend; emitting SuspendDone");
            signals.suspend_done(0, Duration::ZERO);
            delegate.set_suspend_announced(false);
        }

        Suspender {
            delegate,
            dark_resume,
            shutdown_from_suspend,
            signals,
            normal_barrier: DelayBarrier::new(
                BarrierKind::Normal,
                INITIAL_DELAY_ID,
                config.max_delay_timeout,
                event_loop.clone(),
            ),
            dark_barrier: DelayBarrier::new(
                BarrierKind::Dark,
                INITIAL_DARK_DELAY_ID,
                config.max_dark_delay_timeout,
                event_loop.clone(),
            ),
            resuspend_timer: OneShotTimer::new(TimerKind::Resuspend, false, event_loop.clone()),
            event_loop,
            clock,
            retry_delay: config.retry_delay,
            max_retries: config.max_retries,
            state: SuspendState::Idle,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            handling_event: false,
            suspend_id,
            dark_suspend_id,
            suspend_request_start: Duration::ZERO,
            suspend_duration: None,
            wakeup_count: 0,
            wakeup_count_valid: false,
            external_wakeup_count: false,
            current_num_attempts: 0,
            initial_num_attempts: 0,
            display_mode: DisplayMode::Normal,
            wake_in_progress: None,
            wake_records: Vec::new(),
        }
    }

    pub fn handle(&self) -> SuspenderHandle {
        SuspenderHandle {
            queue: self.queue.clone(),
            event_loop: self.event_loop.clone(),
        }
    }

    pub fn state(&self) -> SuspendState {
        self.state
    }

    /// Id of the current (or most recent) suspend request.
    pub fn suspend_id(&self) -> i32 {
        self.suspend_id
    }

    pub fn dark_suspend_id(&self) -> i32 {
        self.dark_suspend_id
    }

    /// Starts a suspend request unless one is already in progress.
    pub fn request_suspend(&mut self, reason: SuspendReason, duration: Option<Duration>) {
        self.handle_event(SuspendEvent::SuspendRequested(SuspendRequest {
            reason,
            external_wakeup_count: None,
            duration,
        }));
    }

    /// Like [`Suspender::request_suspend`], but suspends against `wakeup_count` and ends the
    /// request instead of retrying if the suspend is canceled.
    pub fn request_suspend_with_external_wakeup_count(
        &mut self,
        reason: SuspendReason,
        wakeup_count: u64,
        duration: Option<Duration>,
    ) {
        self.handle_event(SuspendEvent::SuspendRequested(SuspendRequest {
            reason,
            external_wakeup_count: Some(wakeup_count),
            duration,
        }));
    }

    pub fn register_suspend_delay(
        &mut self,
        timeout: Duration,
        owner: &str,
        description: &str,
    ) -> i32 {
        self.normal_barrier.register(timeout, owner, description)
    }

    pub fn register_dark_suspend_delay(
        &mut self,
        timeout: Duration,
        owner: &str,
        description: &str,
    ) -> i32 {
        self.dark_barrier.register(timeout, owner, description)
    }

    pub fn unregister_suspend_delay(&mut self, delay_id: i32) {
        let ready = self.normal_barrier.unregister(delay_id);
        self.on_barrier_ready(BarrierKind::Normal, ready);
    }

    pub fn unregister_dark_suspend_delay(&mut self, delay_id: i32) {
        let ready = self.dark_barrier.unregister(delay_id);
        self.on_barrier_ready(BarrierKind::Dark, ready);
    }

    pub fn handle_suspend_readiness(&mut self, delay_id: i32, suspend_id: i32) {
        let ready = self.normal_barrier.report_ready(delay_id, suspend_id);
        self.on_barrier_ready(BarrierKind::Normal, ready);
    }

    pub fn handle_dark_suspend_readiness(&mut self, delay_id: i32, suspend_id: i32) {
        let ready = self.dark_barrier.report_ready(delay_id, suspend_id);
        self.on_barrier_ready(BarrierKind::Dark, ready);
    }

    pub fn handle_owner_disconnected(&mut self, owner: &str) {
        let ready = self.normal_barrier.handle_owner_disconnected(owner);
        self.on_barrier_ready(BarrierKind::Normal, ready);
        let ready = self.dark_barrier.handle_owner_disconnected(owner);
        self.on_barrier_ready(BarrierKind::Dark, ready);
    }

    pub fn record_dark_resume_wake_reason(&mut self, reason: &str) {
        match self.wake_in_progress.as_mut() {
            Some(wake) => {
                if wake.reason != DEFAULT_WAKE_REASON {
                    warn!(
                        "Overwriting dark resume wake reason {} with {}",
                        wake.reason, reason
                    );
                }
                wake.reason = reason.to_string();
            }
            None => warn!("Ignoring wake reason {} received outside dark resume", reason),
        }
    }

    pub fn handle_lid_opened(&mut self) {
        self.handle_event(SuspendEvent::UserActivity);
    }

    pub fn handle_user_activity(&mut self) {
        self.handle_event(SuspendEvent::UserActivity);
    }

    pub fn handle_wake_notification(&mut self) {
        self.handle_event(SuspendEvent::WakeNotification);
    }

    pub fn handle_display_mode_change(&mut self, mode: DisplayMode) {
        self.display_mode = mode;
        self.handle_event(SuspendEvent::DisplayModeChange);
    }

    pub fn handle_shutdown(&mut self) {
        self.handle_event(SuspendEvent::ShutdownStarted);
    }

    pub fn handle_loop_message(&mut self, msg: LoopMessage) {
        match msg {
            LoopMessage::DelaysReady {
                barrier,
                attempt_id,
            } => {
                let ready = self
                    .barrier_mut(barrier)
                    .take_deferred_ready(attempt_id)
                    .then_some(attempt_id);
                self.on_barrier_ready(barrier, ready);
            }
            LoopMessage::TimerFired(token) => self.handle_timer(token),
            LoopMessage::ProcessQueuedEvents => self.process_queued_events(),
        }
    }

    fn handle_timer(&mut self, token: TimerToken) {
        match token.kind {
            TimerKind::DelayExpiration(barrier) => {
                let ready = self.barrier_mut(barrier).handle_timeout(token);
                self.on_barrier_ready(barrier, ready);
            }
            TimerKind::Resuspend => {
                if !self.resuspend_timer.claim(token) {
                    return;
                }
                if !self.wakeup_count_valid {
                    self.read_wakeup_count();
                }
                self.handle_event(SuspendEvent::ReadyToResuspend);
            }
            TimerKind::ShutdownFromSuspend => self.shutdown_from_suspend.handle_timer(token),
        }
    }

    fn barrier_mut(&mut self, kind: BarrierKind) -> &mut DelayBarrier {
        match kind {
            BarrierKind::Normal => &mut self.normal_barrier,
            BarrierKind::Dark => &mut self.dark_barrier,
        }
    }

    fn on_barrier_ready(&mut self, kind: BarrierKind, attempt_id: Option<i32>) {
        let attempt_id = match attempt_id {
            Some(attempt_id) => attempt_id,
            None => return,
        };
        match kind {
            BarrierKind::Normal => {
                if self.state == SuspendState::WaitingForNormalDelays
                    && attempt_id == self.suspend_id
                {
                    self.handle_event(SuspendEvent::NormalDelaysReady);
                }
            }
            BarrierKind::Dark => {
                if self.state == SuspendState::WaitingForDarkDelays
                    && attempt_id == self.dark_suspend_id
                {
                    // Work done in dark resume bumps the wakeup count.
                    self.read_wakeup_count();
                    self.handle_event(SuspendEvent::ReadyToResuspend);
                }
            }
        }
    }

    fn handle_event(&mut self, event: SuspendEvent) {
        push_event(&self.queue, event);
        self.process_queued_events();
    }

    fn process_queued_events(&mut self) {
        // Events raised while an event is being handled wait for it to finish.
        if self.handling_event {
            return;
        }
        self.handling_event = true;
        while let Some(event) = self.pop_event() {
            self.handle_event_internal(event);
        }
        self.handling_event = false;
    }

    fn pop_event(&self) -> Option<SuspendEvent> {
        match self.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(e) => {
                error!("Suspend event queue lock poisoned: {}", e);
                None
            }
        }
    }

    fn handle_event_internal(&mut self, event: SuspendEvent) {
        debug!("Handling {:?} in {:?}", event, self.state);
        let old_state = self.state;
        match (self.state, event) {
            (SuspendState::Idle, SuspendEvent::SuspendRequested(request)) => {
                self.start_request(request);
                self.state = SuspendState::WaitingForNormalDelays;
            }
            (SuspendState::Idle, SuspendEvent::ShutdownStarted) => {
                self.state = SuspendState::ShuttingDown;
            }
            (SuspendState::WaitingForNormalDelays, SuspendEvent::NormalDelaysReady) => {
                self.state = self.suspend();
            }
            (
                SuspendState::WaitingForDarkDelays | SuspendState::WaitingToRetry,
                SuspendEvent::ReadyToResuspend,
            ) => {
                self.state = self.suspend();
            }
            (
                SuspendState::WaitingForNormalDelays
                | SuspendState::WaitingForDarkDelays
                | SuspendState::WaitingToRetry,
                SuspendEvent::UserActivity
                | SuspendEvent::WakeNotification
                | SuspendEvent::DisplayModeChange,
            ) => {
                // Opening the lid or touching the keyboard while docked are the only ways
                // to cancel with the lid closed. Anything else is probably spurious.
                if self.delegate.is_lid_closed_for_suspend()
                    && self.display_mode != DisplayMode::Presentation
                {
                    debug!("Ignoring {:?} with the lid closed", event);
                    return;
                }
                info!("Aborting suspend request {} for {:?}", self.suspend_id, event);
                self.finish_request(false);
                self.state = SuspendState::Idle;
            }
            (
                SuspendState::WaitingForNormalDelays
                | SuspendState::WaitingForDarkDelays
                | SuspendState::WaitingToRetry,
                SuspendEvent::ShutdownStarted,
            ) => {
                self.finish_request(false);
                self.state = SuspendState::ShuttingDown;
            }
            (state, SuspendEvent::SuspendRequested(_)) => {
                debug!("Ignoring suspend request in {:?}", state);
            }
            _ => {}
        }
        if self.state != old_state {
            debug!("Suspend state {:?} -> {:?}", old_state, self.state);
        }
    }

    fn read_wakeup_count(&mut self) {
        match self.delegate.read_suspend_wakeup_count() {
            Some(count) => {
                self.wakeup_count = count;
                self.wakeup_count_valid = true;
            }
            None => self.wakeup_count_valid = false,
        }
    }

    fn start_request(&mut self, request: SuspendRequest) {
        self.suspend_id = self.suspend_id.wrapping_add(1);
        match request.external_wakeup_count {
            Some(count) => {
                self.wakeup_count = count;
                self.wakeup_count_valid = true;
                self.external_wakeup_count = true;
            }
            None => {
                self.read_wakeup_count();
                self.external_wakeup_count = false;
            }
        }
        self.suspend_duration = request.duration;
        self.suspend_request_start = self.clock.boot_time();
        self.current_num_attempts = 0;
        self.initial_num_attempts = 0;
        self.wake_in_progress = None;
        self.wake_records.clear();

        info!(
            "Starting suspend request {} ({})",
            self.suspend_id, request.reason
        );
        self.dark_resume.prepare_for_request();
        self.delegate.prepare_to_suspend();
        self.normal_barrier.prepare(self.suspend_id);
        self.delegate.set_suspend_announced(true);
        self.signals.suspend_imminent(self.suspend_id, request.reason);
    }

    /// Makes one suspend attempt and returns the next state.
    fn suspend(&mut self) -> SuspendState {
        if self.shutdown_from_suspend.prepare_for_suspend_attempt() == Action::ShutDown {
            return self.shut_down_from_suspend();
        }
        let (action, dark_resume_duration) = self.dark_resume.get_action_for_suspend_attempt();
        if action == Action::ShutDown {
            return self.shut_down_from_suspend();
        }
        let duration = self.suspend_duration.or(dark_resume_duration);

        self.current_num_attempts += 1;
        let pre_suspend_time = self.clock.boot_time();
        info!(
            "Suspend attempt {} for request {} (wakeup count {}, duration {:?})",
            self.current_num_attempts,
            self.suspend_id,
            if self.wakeup_count_valid {
                self.wakeup_count.to_string()
            } else {
                "none".to_string()
            },
            duration
        );
        let result = self
            .delegate
            .do_suspend(self.wakeup_count, self.wakeup_count_valid, duration);
        info!("Suspend attempt result: {:?}", result);

        if result == SuspendResult::Success {
            self.suspend_duration = None;
            self.dark_resume.handle_successful_resume();
            if let Some(wake) = self.wake_in_progress.take() {
                self.wake_records.push(DarkResumeWakeRecord {
                    reason: wake.reason,
                    duration: pre_suspend_time.saturating_sub(wake.start),
                });
            }
        }

        if self.dark_resume.in_dark_resume() {
            self.handle_dark_resume(result)
        } else {
            self.handle_normal_resume(result)
        }
    }

    fn handle_normal_resume(&mut self, result: SuspendResult) -> SuspendState {
        match result {
            SuspendResult::Success => {
                self.finish_request(true);
                SuspendState::Idle
            }
            SuspendResult::Canceled if self.external_wakeup_count => {
                info!("Suspend canceled against the caller's wakeup count");
                self.finish_request(false);
                SuspendState::Idle
            }
            _ => self.handle_unsuccessful_suspend(result),
        }
    }

    fn handle_dark_resume(&mut self, result: SuspendResult) -> SuspendState {
        let over_retries = u64::from(self.current_num_attempts) > self.max_retries;
        if result == SuspendResult::Failure || (result == SuspendResult::Canceled && over_retries)
        {
            return self.handle_unsuccessful_suspend(result);
        }

        if self.initial_num_attempts == 0 {
            self.initial_num_attempts = self.current_num_attempts;
        }
        self.dark_suspend_id = self.dark_suspend_id.wrapping_add(1);
        self.shutdown_from_suspend.handle_dark_resume();

        if result == SuspendResult::Success {
            self.wake_in_progress = Some(WakeInProgress {
                reason: DEFAULT_WAKE_REASON.to_string(),
                start: self.clock.boot_time(),
            });
            self.current_num_attempts = 0;
        }

        info!("Dark suspend attempt {} starting", self.dark_suspend_id);
        self.dark_barrier.prepare(self.dark_suspend_id);
        self.signals.dark_suspend_imminent(self.dark_suspend_id);
        SuspendState::WaitingForDarkDelays
    }

    fn handle_unsuccessful_suspend(&mut self, result: SuspendResult) -> SuspendState {
        if u64::from(self.current_num_attempts) > self.max_retries {
            error!(
                "Unsuccessfully attempted to suspend {} times; shutting down",
                self.current_num_attempts
            );
            self.delegate.shut_down_for_failed_suspend();
            return SuspendState::ShuttingDown;
        }

        match result {
            // Reread when the retry timer fires.
            SuspendResult::Canceled => self.wakeup_count_valid = false,
            _ => self.read_wakeup_count(),
        }
        warn!(
            "Suspend attempt {} failed; retrying in {} ms",
            self.current_num_attempts,
            self.retry_delay.as_millis()
        );
        self.resuspend_timer.start(self.retry_delay);
        SuspendState::WaitingToRetry
    }

    fn shut_down_from_suspend(&mut self) -> SuspendState {
        info!("Shutting down from suspend request {}", self.suspend_id);
        self.delegate.shut_down_from_suspend();
        SuspendState::ShuttingDown
    }

    fn finish_request(&mut self, success: bool) {
        self.resuspend_timer.stop();
        self.normal_barrier.finish_attempt();
        self.dark_barrier.finish_attempt();
        self.shutdown_from_suspend.handle_full_resume();

        let now = self.clock.boot_time();
        let suspend_duration = now.saturating_sub(self.suspend_request_start);
        info!(
            "Finishing suspend request {} {} after {} ms",
            self.suspend_id,
            if success { "successfully" } else { "unsuccessfully" },
            suspend_duration.as_millis()
        );
        self.signals.suspend_done(self.suspend_id, suspend_duration);
        self.delegate.set_suspend_announced(false);

        let num_attempts = if self.initial_num_attempts != 0 {
            self.initial_num_attempts
        } else {
            self.current_num_attempts
        };
        self.delegate.undo_prepare_to_suspend(success, num_attempts);

        if let Some(wake) = self.wake_in_progress.take() {
            self.wake_records.push(DarkResumeWakeRecord {
                reason: wake.reason,
                duration: now.saturating_sub(wake.start),
            });
        }
        if self.dark_resume.is_enabled() {
            self.delegate
                .generate_dark_resume_metrics(&self.wake_records, suspend_duration);
        }

        self.wake_records.clear();
        self.current_num_attempts = 0;
        self.initial_num_attempts = 0;
        self.dark_resume.undo_prepare_for_request();
    }

    #[cfg(test)]
    pub(crate) fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    #[cfg(test)]
    pub(crate) fn dark_resume_mut(&mut self) -> &mut R {
        &mut self.dark_resume
    }

    #[cfg(test)]
    pub(crate) fn shutdown_from_suspend_mut(&mut self) -> &mut F {
        &mut self.shutdown_from_suspend
    }
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SuspendReason::Idle => "idle",
            SuspendReason::LidClosed => "lid closed",
            SuspendReason::Other => "other",
        };
        write!(f, "{}", name)
    }
}
