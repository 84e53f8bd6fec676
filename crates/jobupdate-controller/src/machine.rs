//! Update state machine — the lifecycle transition table.
//!
//! [`transition`] is a pure function from (current state, event) to the
//! next state. It never mutates anything; the controller persists the
//! resulting state before making it visible, so a rejected event leaves the
//! update exactly as it was.

use jobupdate_state::UpdateState;

/// Operator commands delivered through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause { reason: String },
    Resume { reason: String },
    Abort { reason: String },
    Pulse,
    /// Manually reverse a forward rollout.
    Rollback { reason: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Pause { .. } => "pause",
            Command::Resume { .. } => "resume",
            Command::Abort { .. } => "abort",
            Command::Pulse => "pulse",
            Command::Rollback { .. } => "rollback",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Command::Pause { reason }
            | Command::Resume { reason }
            | Command::Abort { reason }
            | Command::Rollback { reason } => Some(reason.as_str()),
            Command::Pulse => None,
        }
    }
}

/// Events raised by the control loop itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalEvent {
    /// The update record was created; leave `INITIALIZED`.
    Initialized { pulsed: bool },
    /// A pulse is needed before the next batch.
    AwaitPulse,
    /// The rollback policy rejected the last batch.
    ThresholdExceeded { rollback_on_failure: bool },
    AllInstancesUpdated,
    AllInstancesReverted,
    /// Persisted state contradicts itself.
    Inconsistency,
}

impl InternalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InternalEvent::Initialized { .. } => "initialized",
            InternalEvent::AwaitPulse => "await-pulse",
            InternalEvent::ThresholdExceeded { .. } => "batch-failure-threshold-exceeded",
            InternalEvent::AllInstancesUpdated => "all-instances-updated",
            InternalEvent::AllInstancesReverted => "all-instances-reverted",
            InternalEvent::Inconsistency => "inconsistency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Command(Command),
    Internal(InternalEvent),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Command(c) => c.name(),
            Event::Internal(e) => e.name(),
        }
    }
}

/// Result of applying an event to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move to the given state.
    To(UpdateState),
    /// Accepted, nothing changes (repeated abort).
    Unchanged,
}

/// The event is not legal in the given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub state: UpdateState,
    pub event: &'static str,
}

/// Look up `event` in the transition table for `state`.
pub fn transition(state: UpdateState, event: &Event) -> Result<Step, Rejected> {
    use UpdateState::*;

    let rejected = Rejected {
        state,
        event: event.name(),
    };

    let next = match event {
        // Abort is idempotent: once terminal there is nothing left to stop.
        Event::Command(Command::Abort { .. }) => {
            if state.is_terminal() {
                return Ok(Step::Unchanged);
            }
            Aborted
        }
        Event::Command(Command::Pulse) => match state {
            RollForwardAwaitingPulse => RollingForward,
            RollBackAwaitingPulse => RollingBack,
            _ => return Err(rejected),
        },
        Event::Command(Command::Pause { .. }) => match state {
            RollingForward => RollForwardPaused,
            RollingBack => RollBackPaused,
            _ => return Err(rejected),
        },
        Event::Command(Command::Resume { .. }) => match state {
            RollForwardPaused => RollingForward,
            RollBackPaused => RollingBack,
            _ => return Err(rejected),
        },
        Event::Command(Command::Rollback { .. }) => match state {
            RollingForward | RollForwardPaused | RollForwardAwaitingPulse => RollingBack,
            _ => return Err(rejected),
        },
        Event::Internal(InternalEvent::Initialized { pulsed }) => match state {
            Initialized if *pulsed => RollForwardAwaitingPulse,
            Initialized => RollingForward,
            _ => return Err(rejected),
        },
        Event::Internal(InternalEvent::AwaitPulse) => match state {
            RollingForward => RollForwardAwaitingPulse,
            RollingBack => RollBackAwaitingPulse,
            _ => return Err(rejected),
        },
        Event::Internal(InternalEvent::ThresholdExceeded {
            rollback_on_failure,
        }) => match state {
            RollingForward if *rollback_on_failure => RollingBack,
            RollingForward | RollingBack => Failed,
            _ => return Err(rejected),
        },
        Event::Internal(InternalEvent::AllInstancesUpdated) => match state {
            RollingForward => RolledForward,
            _ => return Err(rejected),
        },
        Event::Internal(InternalEvent::AllInstancesReverted) => match state {
            RollingBack => RolledBack,
            _ => return Err(rejected),
        },
        Event::Internal(InternalEvent::Inconsistency) => {
            if state.is_terminal() {
                return Err(rejected);
            }
            Error
        }
    };
    Ok(Step::To(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use UpdateState::*;

    fn cmd(c: Command) -> Event {
        Event::Command(c)
    }

    fn all_commands() -> Vec<Command> {
        vec![
            Command::Pause { reason: "p".into() },
            Command::Resume { reason: "r".into() },
            Command::Abort { reason: "a".into() },
            Command::Pulse,
            Command::Rollback { reason: "b".into() },
        ]
    }

    #[test]
    fn initialized_auto_transitions() {
        assert_eq!(
            transition(
                Initialized,
                &Event::Internal(InternalEvent::Initialized { pulsed: false })
            ),
            Ok(Step::To(RollingForward))
        );
        assert_eq!(
            transition(
                Initialized,
                &Event::Internal(InternalEvent::Initialized { pulsed: true })
            ),
            Ok(Step::To(RollForwardAwaitingPulse))
        );
    }

    #[test]
    fn pause_and_resume_in_both_directions() {
        let pause = cmd(Command::Pause { reason: "x".into() });
        let resume = cmd(Command::Resume { reason: "x".into() });
        assert_eq!(transition(RollingForward, &pause), Ok(Step::To(RollForwardPaused)));
        assert_eq!(transition(RollingBack, &pause), Ok(Step::To(RollBackPaused)));
        assert_eq!(transition(RollForwardPaused, &resume), Ok(Step::To(RollingForward)));
        assert_eq!(transition(RollBackPaused, &resume), Ok(Step::To(RollingBack)));
    }

    #[test]
    fn pause_rejected_outside_rolling_states() {
        let pause = cmd(Command::Pause { reason: "x".into() });
        for state in UpdateState::ALL {
            if state.is_rolling() {
                continue;
            }
            assert_eq!(
                transition(state, &pause),
                Err(Rejected {
                    state,
                    event: "pause"
                }),
                "{state}"
            );
        }
    }

    #[test]
    fn pulse_only_from_awaiting_pulse() {
        assert_eq!(
            transition(RollForwardAwaitingPulse, &cmd(Command::Pulse)),
            Ok(Step::To(RollingForward))
        );
        assert_eq!(
            transition(RollBackAwaitingPulse, &cmd(Command::Pulse)),
            Ok(Step::To(RollingBack))
        );
        for state in UpdateState::ALL {
            if !state.is_awaiting_pulse() {
                assert!(transition(state, &cmd(Command::Pulse)).is_err(), "{state}");
            }
        }
    }

    #[test]
    fn abort_reaches_aborted_from_every_non_terminal_state() {
        let abort = cmd(Command::Abort { reason: "stop".into() });
        for state in UpdateState::ALL {
            let step = transition(state, &abort).unwrap();
            if state.is_terminal() {
                assert_eq!(step, Step::Unchanged, "{state}");
            } else {
                assert_eq!(step, Step::To(Aborted), "{state}");
            }
        }
    }

    #[test]
    fn terminal_states_accept_no_transition() {
        for state in UpdateState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for command in all_commands() {
                let result = transition(state, &cmd(command.clone()));
                match command {
                    Command::Abort { .. } => assert_eq!(result, Ok(Step::Unchanged)),
                    _ => assert!(result.is_err(), "{state} accepted {}", command.name()),
                }
            }
            assert!(
                transition(state, &Event::Internal(InternalEvent::Inconsistency)).is_err()
            );
        }
    }

    #[test]
    fn threshold_exceeded_respects_rollback_flag() {
        let with = Event::Internal(InternalEvent::ThresholdExceeded {
            rollback_on_failure: true,
        });
        let without = Event::Internal(InternalEvent::ThresholdExceeded {
            rollback_on_failure: false,
        });
        assert_eq!(transition(RollingForward, &with), Ok(Step::To(RollingBack)));
        assert_eq!(transition(RollingForward, &without), Ok(Step::To(Failed)));
        assert_eq!(transition(RollingBack, &with), Ok(Step::To(Failed)));
        assert!(transition(RollForwardPaused, &with).is_err());
    }

    #[test]
    fn completion_events_only_from_matching_direction() {
        let updated = Event::Internal(InternalEvent::AllInstancesUpdated);
        let reverted = Event::Internal(InternalEvent::AllInstancesReverted);
        assert_eq!(transition(RollingForward, &updated), Ok(Step::To(RolledForward)));
        assert_eq!(transition(RollingBack, &reverted), Ok(Step::To(RolledBack)));
        assert!(transition(RollingBack, &updated).is_err());
        assert!(transition(RollingForward, &reverted).is_err());
    }

    #[test]
    fn manual_rollback_from_forward_states() {
        let rollback = cmd(Command::Rollback { reason: "bad".into() });
        for state in [RollingForward, RollForwardPaused, RollForwardAwaitingPulse] {
            assert_eq!(transition(state, &rollback), Ok(Step::To(RollingBack)));
        }
        for state in [Initialized, RollingBack, RollBackPaused, RollBackAwaitingPulse] {
            assert!(transition(state, &rollback).is_err());
        }
    }

    #[test]
    fn await_pulse_keeps_direction() {
        let event = Event::Internal(InternalEvent::AwaitPulse);
        assert_eq!(
            transition(RollingForward, &event),
            Ok(Step::To(RollForwardAwaitingPulse))
        );
        assert_eq!(
            transition(RollingBack, &event),
            Ok(Step::To(RollBackAwaitingPulse))
        );
    }

    #[test]
    fn inconsistency_errors_any_live_update() {
        for state in UpdateState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(
                transition(state, &Event::Internal(InternalEvent::Inconsistency)),
                Ok(Step::To(Error))
            );
        }
    }

    #[test]
    fn every_command_either_moves_or_is_rejected() {
        // Exhaustive: no (state, command) pair yields anything outside the table.
        for state in UpdateState::ALL {
            for command in all_commands() {
                match transition(state, &cmd(command.clone())) {
                    Ok(Step::To(next)) => assert_ne!(next, state),
                    Ok(Step::Unchanged) => {
                        assert!(matches!(command, Command::Abort { .. }) && state.is_terminal())
                    }
                    Err(rejected) => assert_eq!(rejected.state, state),
                }
            }
        }
    }
}
