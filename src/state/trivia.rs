//! Client-local countdown and reveal timeline of a trivia activity.
//!
//! The change feed decides *whether* a trivia activity is live; this client's
//! clock, seeded once from the activation signal, decides how much time is
//! left and when to reveal. Time-driven transitions are computed from
//! instants rather than decremented counters, so a stalled client catches up
//! on its next evaluation.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Phases of the trivia timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriviaPhase {
    /// No trivia activity is running.
    Waiting,
    /// Lead-in before answers open.
    Countdown,
    /// Answers accepted until the deadline.
    Answering,
    /// Deadline reached or the host ended the activity.
    Revealing,
    /// Correct answer shown.
    Completed,
}

/// Signals fed into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriviaEvent {
    /// A trivia activity became live.
    Activated {
        /// Activity that went live.
        activity_id: Uuid,
        /// Answering window.
        duration: Duration,
    },
    /// The live trivia activity was ended.
    Deactivated {
        /// Activity that stopped.
        activity_id: Uuid,
    },
    /// Explicit reset or room-wide response reset.
    Reset,
}

/// Error returned when an event cannot be applied in the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// Phase the machine was in.
    pub from: TriviaPhase,
    /// Rejected event.
    pub event: TriviaEvent,
}

/// Current timeline, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriviaState {
    /// Activity the timeline belongs to.
    pub activity_id: Option<Uuid>,
    /// Current phase.
    pub phase: TriviaPhase,
    /// When answering opened.
    pub start_time: Option<Instant>,
    /// When answering closes.
    pub end_time: Option<Instant>,
    /// Whether the correct answer may be shown.
    pub correct_answer_revealed: bool,
    /// When this client observed the switch to `revealing`.
    pub revealing_since: Option<Instant>,
    /// The live activity was explicitly deactivated.
    deactivated: bool,
}

impl TriviaState {
    fn waiting() -> Self {
        Self {
            activity_id: None,
            phase: TriviaPhase::Waiting,
            start_time: None,
            end_time: None,
            correct_answer_revealed: false,
            revealing_since: None,
            deactivated: false,
        }
    }
}

/// Trivia phase state machine.
#[derive(Debug)]
pub struct TriviaMachine {
    state: TriviaState,
    lead_in: Duration,
    reveal_delay: Duration,
    epoch: u64,
}

impl TriviaMachine {
    /// Machine in `waiting`.
    pub fn new(lead_in: Duration, reveal_delay: Duration) -> Self {
        Self {
            state: TriviaState::waiting(),
            lead_in,
            reveal_delay,
            epoch: 0,
        }
    }

    /// Current timeline.
    pub fn state(&self) -> &TriviaState {
        &self.state
    }

    /// Current phase.
    pub fn phase(&self) -> TriviaPhase {
        self.state.phase
    }

    /// Generation counter; bumped whenever the timeline restarts or resets.
    ///
    /// Timer tasks compare it with the value they were spawned with and stop
    /// as soon as it differs.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Apply a signal. `Ok(false)` means the signal was a harmless duplicate.
    pub fn handle(&mut self, event: TriviaEvent, now: Instant) -> Result<bool, InvalidTransition> {
        match event {
            TriviaEvent::Activated {
                activity_id,
                duration,
            } => {
                let duplicate = self.state.activity_id == Some(activity_id)
                    && self.state.phase != TriviaPhase::Waiting
                    && !self.state.deactivated;
                if duplicate {
                    return Ok(false);
                }
                self.epoch += 1;
                self.state = TriviaState {
                    activity_id: Some(activity_id),
                    phase: TriviaPhase::Countdown,
                    start_time: Some(now),
                    end_time: Some(now + duration),
                    ..TriviaState::waiting()
                };
                self.advance(now);
                Ok(true)
            }
            TriviaEvent::Deactivated { activity_id } => {
                if self.state.activity_id != Some(activity_id) {
                    return Err(InvalidTransition {
                        from: self.state.phase,
                        event,
                    });
                }
                match self.state.phase {
                    TriviaPhase::Countdown | TriviaPhase::Answering => {
                        self.state.deactivated = true;
                        self.enter_revealing(now);
                        Ok(true)
                    }
                    TriviaPhase::Revealing | TriviaPhase::Completed => {
                        self.state.deactivated = true;
                        Ok(false)
                    }
                    TriviaPhase::Waiting => Err(InvalidTransition {
                        from: TriviaPhase::Waiting,
                        event,
                    }),
                }
            }
            TriviaEvent::Reset => {
                if self.state == TriviaState::waiting() {
                    return Ok(false);
                }
                self.epoch += 1;
                self.state = TriviaState::waiting();
                Ok(true)
            }
        }
    }

    /// Apply every time driven transition due at `now`; returns whether the phase moved.
    pub fn advance(&mut self, now: Instant) -> bool {
        let before = self.state.phase;
        loop {
            match self.state.phase {
                TriviaPhase::Countdown => match self.state.start_time {
                    Some(start) if now >= start + self.lead_in => {
                        self.state.phase = TriviaPhase::Answering;
                    }
                    _ => break,
                },
                TriviaPhase::Answering => match self.state.end_time {
                    Some(end) if now >= end => self.enter_revealing(now),
                    _ => break,
                },
                TriviaPhase::Revealing => match self.state.revealing_since {
                    Some(since) if now >= since + self.reveal_delay => {
                        self.state.phase = TriviaPhase::Completed;
                        self.state.correct_answer_revealed = true;
                    }
                    _ => break,
                },
                TriviaPhase::Waiting | TriviaPhase::Completed => break,
            }
        }
        before != self.state.phase
    }

    /// Time left before the deadline, saturating at zero.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        match self.state.phase {
            TriviaPhase::Countdown | TriviaPhase::Answering => self
                .state
                .end_time
                .map(|end| end.saturating_duration_since(now))
                .unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Next instant at which [`advance`](Self::advance) can change the phase.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state.phase {
            TriviaPhase::Countdown => self.state.start_time.map(|start| start + self.lead_in),
            TriviaPhase::Answering => self.state.end_time,
            TriviaPhase::Revealing => self
                .state
                .revealing_since
                .map(|since| since + self.reveal_delay),
            TriviaPhase::Waiting | TriviaPhase::Completed => None,
        }
    }

    /// Activity whose timeline runs and that was not deactivated yet.
    pub fn live_activity(&self) -> Option<Uuid> {
        match self.state.phase {
            TriviaPhase::Waiting => None,
            _ if self.state.deactivated => None,
            _ => self.state.activity_id,
        }
    }

    /// Whether answers for `activity_id` are still accepted.
    ///
    /// Only the tracked activity has an open window; a reset timeline stays
    /// closed until the activity is seen live again.
    pub fn accepts_answers(&self, activity_id: Uuid) -> bool {
        self.state.activity_id == Some(activity_id)
            && matches!(
                self.state.phase,
                TriviaPhase::Countdown | TriviaPhase::Answering
            )
    }

    fn enter_revealing(&mut self, now: Instant) {
        self.state.phase = TriviaPhase::Revealing;
        self.state.revealing_since = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAD_IN: Duration = Duration::from_secs(3);
    const REVEAL: Duration = Duration::from_secs(3);
    const LIMIT: Duration = Duration::from_secs(30);

    fn machine() -> TriviaMachine {
        TriviaMachine::new(LEAD_IN, REVEAL)
    }

    fn activate(machine: &mut TriviaMachine, activity_id: Uuid, now: Instant) {
        machine
            .handle(
                TriviaEvent::Activated {
                    activity_id,
                    duration: LIMIT,
                },
                now,
            )
            .unwrap();
    }

    #[test]
    fn initial_state_is_waiting() {
        let machine = machine();
        assert_eq!(machine.phase(), TriviaPhase::Waiting);
        assert_eq!(machine.time_remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn full_timeline_through_reveal() {
        let mut machine = machine();
        let t0 = Instant::now();
        activate(&mut machine, Uuid::new_v4(), t0);
        assert_eq!(machine.phase(), TriviaPhase::Countdown);

        assert!(machine.advance(t0 + LEAD_IN));
        assert_eq!(machine.phase(), TriviaPhase::Answering);
        assert_eq!(
            machine.time_remaining(t0 + Duration::from_secs(10)),
            Duration::from_secs(20)
        );

        assert!(machine.advance(t0 + LIMIT));
        assert_eq!(machine.phase(), TriviaPhase::Revealing);
        assert!(!machine.state().correct_answer_revealed);

        assert!(machine.advance(t0 + LIMIT + REVEAL));
        assert_eq!(machine.phase(), TriviaPhase::Completed);
        assert!(machine.state().correct_answer_revealed);
    }

    #[test]
    fn stalled_client_reports_zero_and_revealing() {
        let mut machine = machine();
        let t0 = Instant::now();
        activate(&mut machine, Uuid::new_v4(), t0);

        let stalled = t0 + Duration::from_secs(45);
        machine.advance(stalled);
        assert_eq!(machine.time_remaining(stalled), Duration::ZERO);
        assert_eq!(machine.phase(), TriviaPhase::Revealing);
    }

    #[test]
    fn deactivation_before_deadline_reveals_early() {
        let mut machine = machine();
        let t0 = Instant::now();
        let activity_id = Uuid::new_v4();
        activate(&mut machine, activity_id, t0);
        machine.advance(t0 + LEAD_IN);

        let changed = machine
            .handle(TriviaEvent::Deactivated { activity_id }, t0 + Duration::from_secs(8))
            .unwrap();
        assert!(changed);
        assert_eq!(machine.phase(), TriviaPhase::Revealing);
    }

    #[test]
    fn duplicate_activation_is_ignored_but_another_activity_restarts() {
        let mut machine = machine();
        let t0 = Instant::now();
        let first = Uuid::new_v4();
        activate(&mut machine, first, t0);
        let epoch = machine.epoch();

        let later = t0 + Duration::from_secs(5);
        let duplicate = machine
            .handle(
                TriviaEvent::Activated {
                    activity_id: first,
                    duration: LIMIT,
                },
                later,
            )
            .unwrap();
        assert!(!duplicate);
        assert_eq!(machine.epoch(), epoch);
        assert_eq!(machine.state().start_time, Some(t0));

        activate(&mut machine, Uuid::new_v4(), later);
        assert_eq!(machine.epoch(), epoch + 1);
        assert_eq!(machine.state().start_time, Some(later));
        assert_eq!(machine.phase(), TriviaPhase::Countdown);
    }

    #[test]
    fn invalid_transition_returns_error() {
        let mut machine = machine();
        let activity_id = Uuid::new_v4();
        let err = machine
            .handle(TriviaEvent::Deactivated { activity_id }, Instant::now())
            .unwrap_err();
        assert_eq!(err.from, TriviaPhase::Waiting);
    }

    #[test]
    fn reset_returns_to_waiting_from_any_phase() {
        let mut machine = machine();
        let t0 = Instant::now();
        activate(&mut machine, Uuid::new_v4(), t0);
        machine.advance(t0 + LEAD_IN);
        let epoch = machine.epoch();

        assert!(machine.handle(TriviaEvent::Reset, t0).unwrap());
        assert_eq!(machine.phase(), TriviaPhase::Waiting);
        assert_eq!(machine.epoch(), epoch + 1);
        assert!(!machine.handle(TriviaEvent::Reset, t0).unwrap());
    }

    #[test]
    fn answers_close_once_revealing() {
        let mut machine = machine();
        let t0 = Instant::now();
        let activity_id = Uuid::new_v4();
        activate(&mut machine, activity_id, t0);
        assert!(machine.accepts_answers(activity_id));

        machine.advance(t0 + LIMIT);
        assert!(!machine.accepts_answers(activity_id));
        assert!(!machine.accepts_answers(Uuid::new_v4()));
    }
}
