use std::time::Duration;

use crate::types::{PollPhase, PollerConfig};

/// Side effect the runtime must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Arm the wake-up timer, replacing any pending one.
    ScheduleWake(Duration),
    /// Fan out one fetch per registered session.
    StartCycle,
    /// Abort the in-flight cycle and discard its results.
    CancelCycle,
    /// Disarm the wake-up timer.
    CancelWake,
}

/// Pure scheduler state: the run condition inputs and the current phase.
///
/// A cycle may start only while the app is in the foreground, the network is
/// reachable, at least one session is registered, and no cycle is in flight.
#[derive(Debug, Clone)]
pub struct PollStateMachine {
    phase: PollPhase,
    foreground: bool,
    network_reachable: bool,
    has_sessions: bool,
    initial_delay: Duration,
    poll_interval: Duration,
}

impl PollStateMachine {
    pub fn new(config: &PollerConfig) -> Self {
        Self {
            phase: PollPhase::Idle,
            foreground: config.foreground,
            network_reachable: config.network_reachable,
            has_sessions: false,
            initial_delay: config.initial_delay,
            poll_interval: config.poll_interval,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub fn is_network_reachable(&self) -> bool {
        self.network_reachable
    }

    pub fn can_run(&self) -> bool {
        self.foreground && self.network_reachable && self.has_sessions
    }

    pub fn on_foreground(&mut self, foreground: bool) -> Option<PollAction> {
        self.foreground = foreground;
        self.reevaluate()
    }

    pub fn on_network_reachable(&mut self, reachable: bool) -> Option<PollAction> {
        self.network_reachable = reachable;
        self.reevaluate()
    }

    pub fn on_sessions_changed(&mut self, has_sessions: bool) -> Option<PollAction> {
        self.has_sessions = has_sessions;
        self.reevaluate()
    }

    /// The wake-up timer fired. Ignored unless a wake-up is actually pending.
    pub fn on_wake(&mut self) -> Option<PollAction> {
        if self.phase != PollPhase::Scheduled {
            return None;
        }
        if !self.can_run() {
            self.phase = PollPhase::Idle;
            return None;
        }
        self.phase = PollPhase::Polling;
        Some(PollAction::StartCycle)
    }

    /// All requests of the current cycle completed and feedback was applied.
    pub fn on_cycle_finished(&mut self, has_sessions: bool) -> Option<PollAction> {
        self.has_sessions = has_sessions;
        if self.phase != PollPhase::Polling {
            return None;
        }
        if self.can_run() {
            self.phase = PollPhase::Scheduled;
            Some(PollAction::ScheduleWake(self.poll_interval))
        } else {
            self.phase = PollPhase::Idle;
            None
        }
    }

    /// Pull a pending wake-up forward. Skipped while idle or polling.
    pub fn poll_now(&mut self) -> Option<PollAction> {
        (self.phase == PollPhase::Scheduled && self.can_run())
            .then_some(PollAction::ScheduleWake(Duration::ZERO))
    }

    fn reevaluate(&mut self) -> Option<PollAction> {
        match (self.phase, self.can_run()) {
            (PollPhase::Idle, true) => {
                self.phase = PollPhase::Scheduled;
                Some(PollAction::ScheduleWake(self.initial_delay))
            }
            (PollPhase::Scheduled, false) => {
                self.phase = PollPhase::Idle;
                Some(PollAction::CancelWake)
            }
            (PollPhase::Polling, false) => {
                self.phase = PollPhase::Idle;
                Some(PollAction::CancelCycle)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> PollStateMachine {
        PollStateMachine::new(&PollerConfig {
            poll_interval: Duration::from_millis(750),
            initial_delay: Duration::from_millis(10),
            ..PollerConfig::default()
        })
    }

    #[test]
    fn runs_happy_path_cycle() {
        let mut sm = machine();
        assert_eq!(sm.phase(), PollPhase::Idle);

        assert_eq!(
            sm.on_sessions_changed(true),
            Some(PollAction::ScheduleWake(Duration::from_millis(10)))
        );
        assert_eq!(sm.phase(), PollPhase::Scheduled);

        assert_eq!(sm.on_wake(), Some(PollAction::StartCycle));
        assert_eq!(sm.phase(), PollPhase::Polling);

        assert_eq!(
            sm.on_cycle_finished(true),
            Some(PollAction::ScheduleWake(Duration::from_millis(750)))
        );
        assert_eq!(sm.phase(), PollPhase::Scheduled);
    }

    #[test]
    fn stale_wake_during_polling_is_skipped() {
        let mut sm = machine();
        sm.on_sessions_changed(true);
        sm.on_wake();

        assert_eq!(sm.on_wake(), None);
        assert_eq!(sm.poll_now(), None);
        assert_eq!(sm.phase(), PollPhase::Polling);
    }

    #[test]
    fn backgrounding_cancels_in_flight_cycle() {
        let mut sm = machine();
        sm.on_sessions_changed(true);
        sm.on_wake();

        assert_eq!(sm.on_foreground(false), Some(PollAction::CancelCycle));
        assert_eq!(sm.phase(), PollPhase::Idle);
        assert_eq!(sm.on_cycle_finished(true), None);
        assert_eq!(sm.phase(), PollPhase::Idle);
    }

    #[test]
    fn losing_network_cancels_pending_wake() {
        let mut sm = machine();
        sm.on_sessions_changed(true);

        assert_eq!(sm.on_network_reachable(false), Some(PollAction::CancelWake));
        assert_eq!(sm.phase(), PollPhase::Idle);
        assert_eq!(sm.on_wake(), None);

        assert_eq!(
            sm.on_network_reachable(true),
            Some(PollAction::ScheduleWake(Duration::from_millis(10)))
        );
    }

    #[test]
    fn never_schedules_without_sessions() {
        let mut sm = machine();
        assert_eq!(sm.on_foreground(true), None);
        assert_eq!(sm.on_network_reachable(true), None);
        assert_eq!(sm.poll_now(), None);
        assert!(!sm.can_run());
    }

    #[test]
    fn idles_when_last_session_removed_by_cycle_feedback() {
        let mut sm = machine();
        sm.on_sessions_changed(true);
        sm.on_wake();

        assert_eq!(sm.on_cycle_finished(false), None);
        assert_eq!(sm.phase(), PollPhase::Idle);
    }

    #[test]
    fn poll_now_collapses_pending_wake() {
        let mut sm = machine();
        sm.on_sessions_changed(true);
        assert_eq!(sm.poll_now(), Some(PollAction::ScheduleWake(Duration::ZERO)));
        assert_eq!(sm.phase(), PollPhase::Scheduled);
    }

    #[test]
    fn starts_idle_when_configured_in_background() {
        let mut sm = PollStateMachine::new(&PollerConfig {
            foreground: false,
            ..PollerConfig::default()
        });
        assert_eq!(sm.on_sessions_changed(true), None);
        assert_eq!(
            sm.on_foreground(true),
            Some(PollAction::ScheduleWake(Duration::ZERO))
        );
    }
}
