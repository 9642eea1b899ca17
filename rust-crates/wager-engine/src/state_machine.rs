use crate::{
    config::EngineConfig,
    events::DomainEvent,
    gateway::Submission,
    payout::{
        self,
        PayoutError,
    },
    session::{
        Amount,
        FailureReason,
        GameSession,
        Outcome,
        PlayerAddress,
        RequestId,
        SessionStatus,
    },
};
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub confirmation: Duration,
    pub resolution: Duration,
}

impl TimeoutPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            confirmation: config.confirmation_timeout,
            resolution: config.resolution_timeout,
        }
    }

    /// Deadline for a state entered at `entered`; terminal states have none.
    pub fn deadline_for(&self, status: SessionStatus, entered: Instant) -> Option<Instant> {
        match status {
            SessionStatus::Pending => Some(entered + self.confirmation),
            SessionStatus::WaitingForRandom | SessionStatus::ReadyToResolve => {
                Some(entered + self.resolution)
            }
            SessionStatus::Completed | SessionStatus::TimedOut | SessionStatus::Failed => {
                None
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: SessionStatus,
        to: SessionStatus,
    },
    Ignored {
        status: SessionStatus,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("session {request_id} is already {status}; late {event} discarded")]
    Stale {
        request_id: RequestId,
        status: SessionStatus,
        event: &'static str,
    },
    #[error("{event} is not valid for session {request_id} while {status}")]
    Unexpected {
        request_id: RequestId,
        status: SessionStatus,
        event: &'static str,
    },
    #[error("session {request_id} cannot be resolved: {source}")]
    Payout {
        request_id: RequestId,
        source: PayoutError,
    },
}

/// Sole owner of session lifecycle rules.
#[derive(Clone, Copy, Debug)]
pub struct SessionStateMachine {
    policy: TimeoutPolicy,
}

impl SessionStateMachine {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    /// A freshly submitted bet, `PENDING` until its transaction is mined.
    pub fn open(
        &self,
        submission: &Submission,
        player: PlayerAddress,
        chosen_number: u8,
        bet_amount: Amount,
        now: Instant,
    ) -> GameSession {
        GameSession {
            request_id: submission.request_id.clone(),
            player,
            chosen_number,
            bet_amount,
            tx_hash: submission.tx_hash.clone(),
            status: SessionStatus::Pending,
            outcome: None,
            failure: None,
            confirmed_block: None,
            created_at: Utc::now(),
            resolved_at: None,
            state_entered_at: now,
            deadline: self.policy.deadline_for(SessionStatus::Pending, now),
        }
    }

    pub fn apply(
        &self,
        session: &mut GameSession,
        event: &DomainEvent,
        now: Instant,
    ) -> Result<Transition, TransitionError> {
        let from = session.status;
        if from.is_terminal() {
            return Err(TransitionError::Stale {
                request_id: session.request_id.clone(),
                status: from,
                event: event.label(),
            });
        }

        match (from, event) {
            (SessionStatus::Pending, DomainEvent::Confirmed { block_number }) => {
                session.confirmed_block = Some(*block_number);
                self.enter(session, SessionStatus::WaitingForRandom, now);
            }
            (_, DomainEvent::Confirmed { .. }) => {
                return Ok(Transition::Ignored {
                    status: from,
                    reason: "already confirmed",
                });
            }
            (SessionStatus::Pending, DomainEvent::Reverted { reason }) => {
                session.failure = Some(FailureReason::Reverted {
                    reason: reason.clone(),
                });
                self.enter(session, SessionStatus::Failed, now);
            }
            (SessionStatus::Pending, DomainEvent::Started { block_number }) => {
                // the log proves the transaction was mined
                session.confirmed_block.get_or_insert(*block_number);
                self.enter(session, SessionStatus::WaitingForRandom, now);
                self.enter(session, SessionStatus::ReadyToResolve, now);
            }
            (SessionStatus::WaitingForRandom, DomainEvent::Started { .. }) => {
                self.enter(session, SessionStatus::ReadyToResolve, now);
            }
            (_, DomainEvent::Started { .. }) => {
                return Ok(Transition::Ignored {
                    status: from,
                    reason: "already started",
                });
            }
            (
                SessionStatus::ReadyToResolve,
                DomainEvent::Resolved {
                    result_roll,
                    reported_payout,
                    ..
                },
            ) => {
                let payout =
                    payout::payout(session.chosen_number, *result_roll, session.bet_amount)
                        .map_err(|source| TransitionError::Payout {
                        request_id: session.request_id.clone(),
                        source,
                    })?;
                if payout != *reported_payout {
                    warn!(
                        anomaly = "PAYOUT_MISMATCH",
                        request_id = %session.request_id,
                        reported = %reported_payout,
                        computed = %payout,
                        "contract reported a different payout; keeping the computed one"
                    );
                }
                session.outcome = Some(Outcome {
                    result_roll: *result_roll,
                    payout,
                });
                self.enter(session, SessionStatus::Completed, now);
            }
            (_, DomainEvent::Reverted { .. } | DomainEvent::Resolved { .. }) => {
                return Err(TransitionError::Unexpected {
                    request_id: session.request_id.clone(),
                    status: from,
                    event: event.label(),
                });
            }
        }

        Ok(Transition::Applied {
            from,
            to: session.status,
        })
    }

    /// Times the session out if its current deadline has passed.
    pub fn expire(&self, session: &mut GameSession, now: Instant) -> Option<Transition> {
        let deadline = session.deadline?;
        if now < deadline {
            return None;
        }
        self.time_out(session, now)
    }

    /// Forces `TIMED_OUT` regardless of the deadline, e.g. when the gateway
    /// gave up waiting for a receipt.
    pub fn time_out(&self, session: &mut GameSession, now: Instant) -> Option<Transition> {
        let from = session.status;
        if from.is_terminal() {
            return None;
        }
        session.failure = Some(match from {
            SessionStatus::Pending => FailureReason::ConfirmationTimeout,
            stage => FailureReason::ResolutionTimeout { stage },
        });
        self.enter(session, SessionStatus::TimedOut, now);
        Some(Transition::Applied {
            from,
            to: SessionStatus::TimedOut,
        })
    }

    fn enter(&self, session: &mut GameSession, to: SessionStatus, now: Instant) {
        debug_assert!(
            to.rank() > session.status.rank(),
            "{} -> {to} moves backwards",
            session.status
        );
        session.status = to;
        session.state_entered_at = now;
        session.deadline = self.policy.deadline_for(to, now);
        if to.is_terminal() {
            session.resolved_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::session::TxHash;

    const CONFIRMATION: Duration = Duration::from_secs(10);
    const RESOLUTION: Duration = Duration::from_secs(60);

    fn machine() -> SessionStateMachine {
        SessionStateMachine::new(TimeoutPolicy {
            confirmation: CONFIRMATION,
            resolution: RESOLUTION,
        })
    }

    fn pending(chosen_number: u8, bet_amount: Amount, now: Instant) -> GameSession {
        let submission = Submission {
            tx_hash: TxHash::new("0xfeed"),
            request_id: RequestId::from(1),
        };
        machine().open(
            &submission,
            PlayerAddress::new("0xa11ce"),
            chosen_number,
            bet_amount,
            now,
        )
    }

    fn resolved(result_roll: u8, reported_payout: Amount) -> DomainEvent {
        DomainEvent::Resolved {
            block_number: 12,
            result_roll,
            reported_payout,
        }
    }

    fn ready(chosen_number: u8, bet_amount: Amount, now: Instant) -> GameSession {
        let mut session = pending(chosen_number, bet_amount, now);
        machine()
            .apply(&mut session, &DomainEvent::Confirmed { block_number: 10 }, now)
            .unwrap();
        machine()
            .apply(&mut session, &DomainEvent::Started { block_number: 10 }, now)
            .unwrap();
        session
    }

    #[test]
    fn apply__confirmed_while_pending__waits_for_random_with_new_deadline() {
        // given
        let start = Instant::now();
        let mut session = pending(4, 100, start);
        let later = start + Duration::from_secs(3);

        // when
        let actual = machine()
            .apply(&mut session, &DomainEvent::Confirmed { block_number: 10 }, later)
            .unwrap();

        // then
        assert_eq!(
            Transition::Applied {
                from: SessionStatus::Pending,
                to: SessionStatus::WaitingForRandom,
            },
            actual
        );
        assert_eq!(Some(later + RESOLUTION), session.deadline);
        assert_eq!(Some(10), session.confirmed_block);
    }

    #[test]
    fn apply__resolved_matching_roll__completes_with_multiplied_payout() {
        // given
        let now = Instant::now();
        let mut session = ready(4, 100, now);

        // when
        machine().apply(&mut session, &resolved(4, 600), now).unwrap();

        // then
        assert_eq!(SessionStatus::Completed, session.status);
        assert_eq!(
            Some(Outcome {
                result_roll: 4,
                payout: 600
            }),
            session.outcome
        );
        assert!(session.resolved_at.is_some());
        assert_eq!(None, session.deadline);
    }

    #[test]
    fn apply__resolved_losing_roll__completes_with_zero_payout() {
        let now = Instant::now();
        let mut session = ready(4, 100, now);

        machine().apply(&mut session, &resolved(2, 0), now).unwrap();

        assert_eq!(SessionStatus::Completed, session.status);
        assert_eq!(Some(0), session.outcome.map(|o| o.payout));
    }

    #[test]
    fn apply__reported_payout_disagrees__keeps_computed_payout() {
        let now = Instant::now();
        let mut session = ready(4, 100, now);

        machine().apply(&mut session, &resolved(4, 1), now).unwrap();

        assert_eq!(Some(600), session.outcome.map(|o| o.payout));
    }

    #[test]
    fn apply__started_while_pending__implies_confirmation() {
        // given
        let now = Instant::now();
        let mut session = pending(4, 100, now);

        // when
        let actual = machine()
            .apply(&mut session, &DomainEvent::Started { block_number: 10 }, now)
            .unwrap();

        // then
        assert_eq!(
            Transition::Applied {
                from: SessionStatus::Pending,
                to: SessionStatus::ReadyToResolve,
            },
            actual
        );
        assert_eq!(Some(10), session.confirmed_block);
    }

    #[test]
    fn apply__resolved_before_started__is_unexpected() {
        let now = Instant::now();
        let mut session = pending(4, 100, now);
        machine()
            .apply(&mut session, &DomainEvent::Confirmed { block_number: 10 }, now)
            .unwrap();

        let actual = machine().apply(&mut session, &resolved(4, 600), now);

        assert!(matches!(actual, Err(TransitionError::Unexpected { .. })));
        assert_eq!(SessionStatus::WaitingForRandom, session.status);
    }

    #[test]
    fn apply__roll_outside_die__leaves_session_untouched() {
        let now = Instant::now();
        let mut session = ready(4, 100, now);

        let actual = machine().apply(&mut session, &resolved(7, 0), now);

        assert!(matches!(
            actual,
            Err(TransitionError::Payout {
                source: PayoutError::InvalidRoll(7),
                ..
            })
        ));
        assert_eq!(SessionStatus::ReadyToResolve, session.status);
    }

    #[test]
    fn apply__event_after_terminal__is_stale_and_changes_nothing() {
        // given
        let now = Instant::now();
        let mut session = ready(4, 100, now);
        machine().apply(&mut session, &resolved(4, 600), now).unwrap();
        let before = session.snapshot();

        // when
        let actual = machine().apply(&mut session, &resolved(2, 0), now);

        // then
        assert!(matches!(actual, Err(TransitionError::Stale { .. })));
        assert_eq!(before, session.snapshot());
    }

    #[test]
    fn apply__reverted_while_pending__fails_with_reason() {
        let now = Instant::now();
        let mut session = pending(4, 100, now);

        machine()
            .apply(
                &mut session,
                &DomainEvent::Reverted {
                    reason: Some("bet too small".into()),
                },
                now,
            )
            .unwrap();

        assert_eq!(SessionStatus::Failed, session.status);
        assert_eq!(
            Some(FailureReason::Reverted {
                reason: Some("bet too small".into())
            }),
            session.failure
        );
    }

    #[test]
    fn expire__waiting_past_deadline__times_out_for_good() {
        // given
        let start = Instant::now();
        let mut session = pending(4, 100, start);
        machine()
            .apply(&mut session, &DomainEvent::Confirmed { block_number: 10 }, start)
            .unwrap();

        // when
        let early = machine().expire(&mut session, start + RESOLUTION / 2);
        let late = machine().expire(&mut session, start + RESOLUTION);

        // then
        assert_eq!(None, early);
        assert_eq!(
            Some(Transition::Applied {
                from: SessionStatus::WaitingForRandom,
                to: SessionStatus::TimedOut,
            }),
            late
        );
        assert_eq!(
            Some(FailureReason::ResolutionTimeout {
                stage: SessionStatus::WaitingForRandom
            }),
            session.failure
        );
        let after = machine().apply(
            &mut session,
            &DomainEvent::Started { block_number: 11 },
            start + RESOLUTION,
        );
        assert!(matches!(after, Err(TransitionError::Stale { .. })));
        assert_eq!(SessionStatus::TimedOut, session.status);
    }

    #[test]
    fn expire__pending_past_confirmation_deadline__reports_confirmation_timeout() {
        let start = Instant::now();
        let mut session = pending(4, 100, start);

        machine().expire(&mut session, start + CONFIRMATION);

        assert_eq!(SessionStatus::TimedOut, session.status);
        assert_eq!(Some(FailureReason::ConfirmationTimeout), session.failure);
    }
}
