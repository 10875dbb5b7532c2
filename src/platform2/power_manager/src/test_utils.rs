// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::mem;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::anyhow;
    use anyhow::Result;

    use crate::clock::Clock;
    use crate::dark_resume::Action;
    use crate::dark_resume::DarkResumeInterface;
    use crate::event_loop::EventLoop;
    use crate::event_loop::LoopMessage;
    use crate::event_loop::TimerKind;
    use crate::event_loop::TimerToken;
    use crate::power_supply::PowerStatus;
    use crate::power_supply::PowerSupply;
    use crate::shutdown_from_suspend::ShutdownFromSuspendInterface;
    use crate::suspender::DarkResumeWakeRecord;
    use crate::suspender::Delegate;
    use crate::suspender::SignalSender;
    use crate::suspender::SuspendReason;
    use crate::suspender::SuspendResult;

    pub const TEST_INITIAL_SUSPEND_ID: i32 = 213;
    pub const TEST_INITIAL_DARK_SUSPEND_ID: i32 = 12701;

    // Actions recorded by TestDelegate.
    pub const NO_ACTIONS: &str = "";
    pub const PREPARE: &str = "prepare";
    pub const SUSPEND: &str = "suspend";
    pub const UNPREPARE: &str = "unprepare";
    pub const SHUT_DOWN: &str = "shutdown";

    pub fn join_actions(actions: &[&str]) -> String {
        actions.join(",")
    }

    #[derive(Default)]
    struct FakeLoopState {
        posted: Vec<LoopMessage>,
        timers: HashMap<TimerKind, (TimerToken, Duration, bool)>,
    }

    /// Records posted messages and armed timers. Tests deliver them by hand.
    #[derive(Default)]
    pub struct FakeEventLoop {
        state: Mutex<FakeLoopState>,
    }

    impl FakeEventLoop {
        pub fn take_posted(&self) -> Vec<LoopMessage> {
            mem::take(&mut self.state.lock().unwrap().posted)
        }

        /// Disarms the timer of `kind` and returns the token its firing would carry.
        pub fn take_timer(&self, kind: TimerKind) -> Option<TimerToken> {
            self.state
                .lock()
                .unwrap()
                .timers
                .remove(&kind)
                .map(|(token, _, _)| token)
        }

        pub fn timer_delay(&self, kind: TimerKind) -> Option<Duration> {
            self.state
                .lock()
                .unwrap()
                .timers
                .get(&kind)
                .map(|(_, delay, _)| *delay)
        }

        pub fn timer_armed(&self, kind: TimerKind) -> bool {
            self.state.lock().unwrap().timers.contains_key(&kind)
        }

        pub fn timer_is_wake_capable(&self, kind: TimerKind) -> bool {
            self.state
                .lock()
                .unwrap()
                .timers
                .get(&kind)
                .map_or(false, |(_, _, wake_capable)| *wake_capable)
        }
    }

    impl EventLoop for FakeEventLoop {
        fn post(&self, msg: LoopMessage) {
            self.state.lock().unwrap().posted.push(msg);
        }

        fn start_timer(&self, token: TimerToken, delay: Duration, wake_capable: bool) {
            self.state
                .lock()
                .unwrap()
                .timers
                .insert(token.kind, (token, delay, wake_capable));
        }

        fn cancel_timer(&self, kind: TimerKind) {
            self.state.lock().unwrap().timers.remove(&kind);
        }
    }

    /// Power supply whose status is set by the test. Clones share the status.
    #[derive(Clone, Default)]
    pub struct PowerSupplyStub {
        status: Arc<Mutex<Option<PowerStatus>>>,
    }

    impl PowerSupplyStub {
        pub fn set_status(&self, battery_percentage: f64, line_power_on: bool) {
            *self.status.lock().unwrap() = Some(PowerStatus {
                battery_percentage,
                line_power_on,
            });
        }

        pub fn set_refresh_fails(&self) {
            *self.status.lock().unwrap() = None;
        }
    }

    impl PowerSupply for PowerSupplyStub {
        fn refresh_immediately(&self) -> Result<PowerStatus> {
            let status = *self.status.lock().unwrap();
            status.ok_or_else(|| anyhow!("power status unavailable"))
        }
    }

    pub struct FakeClock {
        now: Mutex<Duration>,
    }

    impl FakeClock {
        pub fn new(now: Duration) -> Self {
            FakeClock {
                now: Mutex::new(now),
            }
        }

        pub fn advance(&self, delta: Duration) {
            *self.now.lock().unwrap() += delta;
        }
    }

    impl Clock for FakeClock {
        fn boot_time(&self) -> Duration {
            *self.now.lock().unwrap()
        }
    }

    pub type Callback = Box<dyn FnMut() + Send>;

    /// Delegate that records the suspender's calls as a list of actions.
    pub struct TestDelegate {
        clock: Arc<FakeClock>,
        actions: Vec<&'static str>,

        // Inputs.
        pub suspend_result: SuspendResult,
        /// Added to the clock during each suspend.
        pub suspend_advance_time: Duration,
        pub wakeup_count: Option<u64>,
        pub lid_closed: bool,
        pub suspend_announced: bool,
        pub initial_suspend_id: i32,
        pub initial_dark_suspend_id: i32,
        /// Run at the end of undo_prepare_to_suspend.
        pub completion_callback: Option<Callback>,
        /// Run when shutting down.
        pub shutdown_callback: Option<Callback>,

        // Arguments of the last calls.
        pub suspend_wakeup_count: u64,
        pub suspend_wakeup_count_valid: bool,
        pub suspend_duration: Option<Duration>,
        pub suspend_was_successful: bool,
        pub num_suspend_attempts: u32,
        pub dark_resume_wake_records: Vec<DarkResumeWakeRecord>,
        pub dark_resume_metrics_total: Option<Duration>,
    }

    impl TestDelegate {
        pub fn new(clock: Arc<FakeClock>) -> Self {
            TestDelegate {
                clock,
                actions: Vec::new(),
                suspend_result: SuspendResult::Success,
                suspend_advance_time: Duration::ZERO,
                wakeup_count: Some(0),
                lid_closed: false,
                suspend_announced: false,
                initial_suspend_id: TEST_INITIAL_SUSPEND_ID,
                initial_dark_suspend_id: TEST_INITIAL_DARK_SUSPEND_ID,
                completion_callback: None,
                shutdown_callback: None,
                suspend_wakeup_count: 0,
                suspend_wakeup_count_valid: false,
                suspend_duration: None,
                suspend_was_successful: false,
                num_suspend_attempts: 0,
                dark_resume_wake_records: Vec::new(),
                dark_resume_metrics_total: None,
            }
        }

        /// Returns the actions recorded since the last call, comma-separated.
        pub fn take_actions(&mut self) -> String {
            join_actions(&mem::take(&mut self.actions))
        }

        fn shut_down(&mut self) {
            self.actions.push(SHUT_DOWN);
            if let Some(callback) = self.shutdown_callback.as_mut() {
                callback();
            }
        }
    }

    impl Delegate for TestDelegate {
        fn get_initial_suspend_id(&self) -> i32 {
            self.initial_suspend_id
        }

        fn get_initial_dark_suspend_id(&self) -> i32 {
            self.initial_dark_suspend_id
        }

        fn is_lid_closed_for_suspend(&self) -> bool {
            self.lid_closed
        }

        fn read_suspend_wakeup_count(&mut self) -> Option<u64> {
            self.wakeup_count
        }

        fn set_suspend_announced(&mut self, announced: bool) {
            self.suspend_announced = announced;
        }

        fn get_suspend_announced(&self) -> bool {
            self.suspend_announced
        }

        fn prepare_to_suspend(&mut self) {
            self.actions.push(PREPARE);
        }

        fn do_suspend(
            &mut self,
            wakeup_count: u64,
            wakeup_count_valid: bool,
            duration: Option<Duration>,
        ) -> SuspendResult {
            self.actions.push(SUSPEND);
            self.suspend_wakeup_count = wakeup_count;
            self.suspend_wakeup_count_valid = wakeup_count_valid;
            self.suspend_duration = duration;
            self.clock.advance(self.suspend_advance_time);
            self.suspend_result
        }

        fn undo_prepare_to_suspend(&mut self, success: bool, num_suspend_attempts: u32) {
            self.actions.push(UNPREPARE);
            self.suspend_was_successful = success;
            self.num_suspend_attempts = num_suspend_attempts;
            if let Some(callback) = self.completion_callback.as_mut() {
                callback();
            }
        }

        fn generate_dark_resume_metrics(
            &mut self,
            wake_records: &[DarkResumeWakeRecord],
            suspend_duration: Duration,
        ) {
            self.dark_resume_wake_records = wake_records.to_vec();
            self.dark_resume_metrics_total = Some(suspend_duration);
        }

        fn shut_down_for_failed_suspend(&mut self) {
            self.shut_down();
        }

        fn shut_down_from_suspend(&mut self) {
            self.shut_down();
        }
    }

    pub struct DarkResumeStub {
        pub in_dark_resume: bool,
        pub enabled: bool,
        pub action: Action,
        pub duration: Option<Duration>,
        pub undo_prepares: u32,
    }

    impl Default for DarkResumeStub {
        fn default() -> Self {
            DarkResumeStub {
                in_dark_resume: false,
                enabled: true,
                action: Action::Suspend,
                duration: None,
                undo_prepares: 0,
            }
        }
    }

    impl DarkResumeInterface for DarkResumeStub {
        fn prepare_for_request(&mut self) {}

        fn get_action_for_suspend_attempt(&mut self) -> (Action, Option<Duration>) {
            (self.action, self.duration)
        }

        fn handle_successful_resume(&mut self) {}

        fn in_dark_resume(&self) -> bool {
            self.in_dark_resume
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn exit_dark_resume(&mut self) -> bool {
            self.in_dark_resume = false;
            true
        }

        fn undo_prepare_for_request(&mut self) {
            self.undo_prepares += 1;
        }
    }

    pub struct ShutdownFromSuspendStub {
        pub action: Action,
        pub dark_resumes: u32,
        pub full_resumes: u32,
    }

    impl Default for ShutdownFromSuspendStub {
        fn default() -> Self {
            ShutdownFromSuspendStub {
                action: Action::Suspend,
                dark_resumes: 0,
                full_resumes: 0,
            }
        }
    }

    impl ShutdownFromSuspendInterface for ShutdownFromSuspendStub {
        fn prepare_for_suspend_attempt(&mut self) -> Action {
            self.action
        }

        fn handle_dark_resume(&mut self) {
            self.dark_resumes += 1;
        }

        fn handle_full_resume(&mut self) {
            self.full_resumes += 1;
        }

        fn handle_timer(&mut self, _token: TimerToken) {}
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Signal {
        SuspendImminent(i32, SuspendReason),
        DarkSuspendImminent(i32),
        SuspendDone(i32, Duration),
    }

    #[derive(Default)]
    pub struct RecordingSignalSender {
        signals: Mutex<Vec<Signal>>,
    }

    impl RecordingSignalSender {
        pub fn take(&self) -> Vec<Signal> {
            mem::take(&mut self.signals.lock().unwrap())
        }
    }

    impl SignalSender for RecordingSignalSender {
        fn suspend_imminent(&self, suspend_id: i32, reason: SuspendReason) {
            self.signals
                .lock()
                .unwrap()
                .push(Signal::SuspendImminent(suspend_id, reason));
        }

        fn dark_suspend_imminent(&self, suspend_id: i32) {
            self.signals
                .lock()
                .unwrap()
                .push(Signal::DarkSuspendImminent(suspend_id));
        }

        fn suspend_done(&self, suspend_id: i32, suspend_duration: Duration) {
            self.signals
                .lock()
                .unwrap()
                .push(Signal::SuspendDone(suspend_id, suspend_duration));
        }
    }
}
