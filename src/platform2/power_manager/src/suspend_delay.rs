// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tracks the suspend delays registered by other processes and whether all of them have
//! reported readiness for the current suspend attempt.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::info;
use log::warn;

use crate::event_loop::BarrierKind;
use crate::event_loop::EventLoop;
use crate::event_loop::LoopMessage;
use crate::event_loop::OneShotTimer;
use crate::event_loop::TimerKind;
use crate::event_loop::TimerToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuspendDelay {
    pub timeout: Duration,
    /// D-Bus unique name of the registering client.
    pub owner: String,
    pub description: String,
}

/// Collects readiness from registered delays before a (dark) suspend attempt.
///
/// Methods that can complete the current attempt return `Some(attempt_id)` exactly once
/// per [`DelayBarrier::prepare`] call. When `prepare` finds no registered delays, readiness
/// is instead posted as [`LoopMessage::DelaysReady`] and confirmed through
/// [`DelayBarrier::take_deferred_ready`].
pub struct DelayBarrier {
    kind: BarrierKind,
    delays: BTreeMap<i32, SuspendDelay>,
    next_delay_id: i32,
    max_timeout: Duration,

    attempt_id: i32,
    attempt_active: bool,
    pending: BTreeSet<i32>,
    // Set once readiness has been reported for the current attempt.
    notified: bool,

    timer: OneShotTimer,
    event_loop: Arc<dyn EventLoop>,
}

impl DelayBarrier {
    pub fn new(
        kind: BarrierKind,
        initial_delay_id: i32,
        max_timeout: Duration,
        event_loop: Arc<dyn EventLoop>,
    ) -> Self {
        DelayBarrier {
            kind,
            delays: BTreeMap::new(),
            next_delay_id: initial_delay_id,
            max_timeout,
            attempt_id: 0,
            attempt_active: false,
            pending: BTreeSet::new(),
            notified: false,
            timer: OneShotTimer::new(
                TimerKind::DelayExpiration(kind),
                false,
                event_loop.clone(),
            ),
            event_loop,
        }
    }

    /// Registers a delay and returns its id. The delay only blocks attempts prepared after
    /// this call.
    pub fn register(&mut self, timeout: Duration, owner: &str, description: &str) -> i32 {
        let delay_id = self.next_delay_id;
        self.next_delay_id += 1;

        let timeout = if timeout > self.max_timeout {
            info!(
                "Capping {} delay {} timeout of {:?} at {:?}",
                self.kind.name(),
                delay_id,
                timeout,
                self.max_timeout
            );
            self.max_timeout
        } else {
            timeout
        };

        info!(
            "Registering {} delay {} ({}) of {} ms on behalf of {}",
            self.kind.name(),
            delay_id,
            description,
            timeout.as_millis(),
            owner
        );
        self.delays.insert(
            delay_id,
            SuspendDelay {
                timeout,
                owner: owner.to_string(),
                description: description.to_string(),
            },
        );
        delay_id
    }

    pub fn unregister(&mut self, delay_id: i32) -> Option<i32> {
        match self.delays.remove(&delay_id) {
            Some(delay) => {
                info!(
                    "Unregistering {} delay {} ({}) on behalf of {}",
                    self.kind.name(),
                    delay_id,
                    delay.description,
                    delay.owner
                );
                self.remove_from_pending(delay_id)
            }
            None => {
                warn!(
                    "Ignoring request to unregister unknown {} delay {}",
                    self.kind.name(),
                    delay_id
                );
                None
            }
        }
    }

    pub fn report_ready(&mut self, delay_id: i32, attempt_id: i32) -> Option<i32> {
        let description = match self.delays.get(&delay_id) {
            Some(delay) => delay.description.clone(),
            None => {
                warn!(
                    "Ignoring readiness report for unknown {} delay {}",
                    self.kind.name(),
                    delay_id
                );
                return None;
            }
        };
        if !self.attempt_active || attempt_id != self.attempt_id {
            warn!(
                "Ignoring {} readiness for attempt {} from delay {} ({}); current attempt is {}",
                self.kind.name(),
                attempt_id,
                delay_id,
                description,
                self.attempt_id
            );
            return None;
        }
        if !self.pending.contains(&delay_id) {
            warn!(
                "Ignoring repeated readiness report from {} delay {} ({})",
                self.kind.name(),
                delay_id,
                description
            );
            return None;
        }
        debug!(
            "{} delay {} ({}) is ready for attempt {}",
            self.kind.name(),
            delay_id,
            description,
            attempt_id
        );
        self.remove_from_pending(delay_id)
    }

    /// Drops every delay registered by `owner`.
    pub fn handle_owner_disconnected(&mut self, owner: &str) -> Option<i32> {
        let owned: Vec<i32> = self
            .delays
            .iter()
            .filter(|(_, delay)| delay.owner == owner)
            .map(|(id, _)| *id)
            .collect();

        let mut ready = None;
        for delay_id in owned {
            if let Some(delay) = self.delays.remove(&delay_id) {
                info!(
                    "{} left; removing {} delay {} ({})",
                    owner,
                    self.kind.name(),
                    delay_id,
                    delay.description
                );
            }
            ready = ready.or(self.remove_from_pending(delay_id));
        }
        ready
    }

    /// Starts a new attempt that waits for every currently registered delay.
    pub fn prepare(&mut self, attempt_id: i32) {
        self.timer.stop();
        self.attempt_id = attempt_id;
        self.attempt_active = true;
        self.notified = false;
        self.pending = self.delays.keys().copied().collect();

        if self.pending.is_empty() {
            debug!(
                "No {} delays registered for attempt {}",
                self.kind.name(),
                attempt_id
            );
            self.event_loop.post(LoopMessage::DelaysReady {
                barrier: self.kind,
                attempt_id,
            });
            return;
        }

        let timeout = self
            .delays
            .values()
            .map(|delay| delay.timeout)
            .max()
            .unwrap_or_default()
            .min(self.max_timeout);
        debug!(
            "Waiting up to {} ms for {} {} delay(s) for attempt {}",
            timeout.as_millis(),
            self.pending.len(),
            self.kind.name(),
            attempt_id
        );
        self.timer.start(timeout);
    }

    pub fn is_ready(&self) -> bool {
        self.pending.is_empty()
    }

    /// Ends the current attempt. Later reports and timer firings for it are ignored.
    pub fn finish_attempt(&mut self) {
        self.timer.stop();
        self.pending.clear();
        self.attempt_active = false;
    }

    /// Confirms a readiness notification posted by [`DelayBarrier::prepare`].
    pub fn take_deferred_ready(&mut self, attempt_id: i32) -> bool {
        if attempt_id != self.attempt_id || !self.pending.is_empty() {
            return false;
        }
        self.notify().is_some()
    }

    /// Handles expiration of the readiness timeout. Outstanding delays are treated as
    /// ready.
    pub fn handle_timeout(&mut self, token: TimerToken) -> Option<i32> {
        if !self.timer.claim(token) || !self.attempt_active {
            return None;
        }
        for delay_id in &self.pending {
            if let Some(delay) = self.delays.get(delay_id) {
                warn!(
                    "Timed out waiting for {} delay {} ({}) owned by {} for attempt {}",
                    self.kind.name(),
                    delay_id,
                    delay.description,
                    delay.owner,
                    self.attempt_id
                );
            }
        }
        self.pending.clear();
        self.notify()
    }

    fn remove_from_pending(&mut self, delay_id: i32) -> Option<i32> {
        if !self.attempt_active || !self.pending.remove(&delay_id) || !self.pending.is_empty() {
            return None;
        }
        self.notify()
    }

    fn notify(&mut self) -> Option<i32> {
        self.timer.stop();
        if !self.attempt_active || self.notified {
            return None;
        }
        self.notified = true;
        info!(
            "All {} delays are ready for attempt {}",
            self.kind.name(),
            self.attempt_id
        );
        Some(self.attempt_id)
    }

    #[cfg(test)]
    pub(crate) fn delay(&self, delay_id: i32) -> Option<&SuspendDelay> {
        self.delays.get(&delay_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::tests::FakeEventLoop;

    const MAX_TIMEOUT: Duration = Duration::from_secs(10);
    const OWNER: &str = ":1.42";

    fn new_barrier() -> (DelayBarrier, Arc<FakeEventLoop>) {
        let event_loop = Arc::new(FakeEventLoop::default());
        (
            DelayBarrier::new(BarrierKind::Normal, 1, MAX_TIMEOUT, event_loop.clone()),
            event_loop,
        )
    }

    fn fire_timeout(barrier: &mut DelayBarrier, event_loop: &FakeEventLoop) -> Option<i32> {
        let token = event_loop
            .take_timer(TimerKind::DelayExpiration(BarrierKind::Normal))
            .expect("delay timer not armed");
        barrier.handle_timeout(token)
    }

    #[test]
    fn test_no_delays_posts_readiness() {
        let (mut barrier, event_loop) = new_barrier();
        barrier.prepare(5);
        assert!(barrier.is_ready());
        assert_eq!(
            event_loop.take_posted(),
            vec![LoopMessage::DelaysReady {
                barrier: BarrierKind::Normal,
                attempt_id: 5
            }]
        );
        assert!(barrier.take_deferred_ready(5));
        // Only once per attempt.
        assert!(!barrier.take_deferred_ready(5));
    }

    #[test]
    fn test_deferred_readiness_for_old_attempt_is_ignored() {
        let (mut barrier, _event_loop) = new_barrier();
        barrier.prepare(1);
        barrier.prepare(2);
        assert!(!barrier.take_deferred_ready(1));
        assert!(barrier.take_deferred_ready(2));
    }

    #[test]
    fn test_report_ready() {
        let (mut barrier, event_loop) = new_barrier();
        let first = barrier.register(Duration::from_secs(8), OWNER, "first");
        let second = barrier.register(Duration::from_secs(8), ":1.43", "second");
        assert_ne!(first, second);

        barrier.prepare(7);
        assert!(!barrier.is_ready());
        assert!(event_loop.take_posted().is_empty());
        assert_eq!(
            event_loop.timer_delay(TimerKind::DelayExpiration(BarrierKind::Normal)),
            Some(Duration::from_secs(8))
        );

        // Wrong attempt and unknown delays are ignored.
        assert_eq!(barrier.report_ready(first, 6), None);
        assert_eq!(barrier.report_ready(1000, 7), None);
        assert!(!barrier.is_ready());

        assert_eq!(barrier.report_ready(first, 7), None);
        assert_eq!(barrier.report_ready(first, 7), None);
        assert!(!barrier.is_ready());
        assert_eq!(barrier.report_ready(second, 7), Some(7));
        assert!(barrier.is_ready());
        assert!(!event_loop.timer_armed(TimerKind::DelayExpiration(BarrierKind::Normal)));
    }

    #[test]
    fn test_timeout_is_capped() {
        let (mut barrier, event_loop) = new_barrier();
        let delay_id = barrier.register(Duration::from_secs(60), OWNER, "slow");
        assert_eq!(barrier.delay(delay_id).unwrap().timeout, MAX_TIMEOUT);
        barrier.register(Duration::from_secs(2), OWNER, "fast");
        barrier.prepare(1);
        assert_eq!(
            event_loop.timer_delay(TimerKind::DelayExpiration(BarrierKind::Normal)),
            Some(MAX_TIMEOUT)
        );
    }

    #[test]
    fn test_timeout_forces_readiness() {
        let (mut barrier, event_loop) = new_barrier();
        let delay_id = barrier.register(Duration::from_millis(8), OWNER, "stuck");
        barrier.prepare(3);
        assert_eq!(fire_timeout(&mut barrier, &event_loop), Some(3));
        assert!(barrier.is_ready());
        // A late report changes nothing.
        assert_eq!(barrier.report_ready(delay_id, 3), None);
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        let (mut barrier, event_loop) = new_barrier();
        barrier.register(Duration::from_millis(8), OWNER, "stuck");
        barrier.prepare(1);
        let stale = event_loop
            .take_timer(TimerKind::DelayExpiration(BarrierKind::Normal))
            .unwrap();
        barrier.prepare(2);
        assert_eq!(barrier.handle_timeout(stale), None);
        assert!(!barrier.is_ready());
        assert_eq!(fire_timeout(&mut barrier, &event_loop), Some(2));
    }

    #[test]
    fn test_unregister() {
        let (mut barrier, _event_loop) = new_barrier();
        let delay_id = barrier.register(Duration::from_secs(8), OWNER, "only");
        barrier.prepare(1);
        assert_eq!(barrier.unregister(delay_id), Some(1));
        assert!(barrier.is_ready());
        assert_eq!(barrier.unregister(delay_id), None);

        // Ids are never reused.
        assert_ne!(barrier.register(Duration::from_secs(8), OWNER, "again"), delay_id);
    }

    #[test]
    fn test_owner_disconnected() {
        let (mut barrier, _event_loop) = new_barrier();
        barrier.register(Duration::from_secs(8), OWNER, "a");
        barrier.register(Duration::from_secs(8), OWNER, "b");
        let other = barrier.register(Duration::from_secs(8), ":1.99", "c");
        barrier.prepare(1);

        assert_eq!(barrier.handle_owner_disconnected(":1.7"), None);
        assert_eq!(barrier.handle_owner_disconnected(OWNER), None);
        assert!(!barrier.is_ready());
        assert_eq!(barrier.report_ready(other, 1), Some(1));
    }

    #[test]
    fn test_only_delay_owner_disconnects() {
        let (mut barrier, _event_loop) = new_barrier();
        barrier.register(Duration::from_secs(8), OWNER, "only");
        barrier.prepare(1);
        assert_eq!(barrier.handle_owner_disconnected(OWNER), Some(1));
        assert!(barrier.is_ready());
    }

    #[test]
    fn test_late_registration_does_not_block_attempt() {
        let (mut barrier, event_loop) = new_barrier();
        barrier.prepare(1);
        let delay_id = barrier.register(Duration::from_secs(8), OWNER, "late");
        assert!(barrier.is_ready());
        assert!(barrier.take_deferred_ready(1));
        event_loop.take_posted();

        // The next attempt waits for it.
        barrier.prepare(2);
        assert!(!barrier.is_ready());
        assert_eq!(barrier.report_ready(delay_id, 2), Some(2));
    }

    #[test]
    fn test_finished_attempt_ignores_reports() {
        let (mut barrier, event_loop) = new_barrier();
        let delay_id = barrier.register(Duration::from_secs(8), OWNER, "only");
        barrier.prepare(1);
        barrier.finish_attempt();
        assert!(!event_loop.timer_armed(TimerKind::DelayExpiration(BarrierKind::Normal)));
        assert_eq!(barrier.report_ready(delay_id, 1), None);
        assert_eq!(barrier.unregister(delay_id), None);
    }
}
