use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;
use tokio::time::Instant;

/// Wei-denominated bet and payout amounts.
pub type Amount = u128;

/// Contract-assigned identifier correlating a bet with its VRF fulfilment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase `0x` prefixed account address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerAddress(String);

impl PlayerAddress {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    WaitingForRandom,
    ReadyToResolve,
    Completed,
    TimedOut,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::TimedOut | SessionStatus::Failed
        )
    }

    /// Position in the lifecycle; transitions only ever increase it.
    pub(crate) fn rank(self) -> u8 {
        match self {
            SessionStatus::Pending => 0,
            SessionStatus::WaitingForRandom => 1,
            SessionStatus::ReadyToResolve => 2,
            SessionStatus::Completed | SessionStatus::TimedOut | SessionStatus::Failed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::WaitingForRandom => "WAITING_FOR_RANDOM",
            SessionStatus::ReadyToResolve => "READY_TO_RESOLVE",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::TimedOut => "TIMED_OUT",
            SessionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub result_roll: u8,
    pub payout: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Reverted { reason: Option<String> },
    ConfirmationTimeout,
    ResolutionTimeout { stage: SessionStatus },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Reverted { reason: Some(reason) } => {
                write!(f, "transaction reverted: {reason}")
            }
            FailureReason::Reverted { reason: None } => write!(f, "transaction reverted"),
            FailureReason::ConfirmationTimeout => {
                write!(f, "transaction was not mined in time")
            }
            FailureReason::ResolutionTimeout { stage } => {
                write!(f, "no randomness delivered while {stage}")
            }
        }
    }
}

/// One wager from submission to a terminal state.
///
/// Only the state machine moves `status`; every other component reads
/// sessions through [`SessionSnapshot`].
#[derive(Clone, Debug, PartialEq)]
pub struct GameSession {
    pub(crate) request_id: RequestId,
    pub(crate) player: PlayerAddress,
    pub(crate) chosen_number: u8,
    pub(crate) bet_amount: Amount,
    pub(crate) tx_hash: TxHash,
    pub(crate) status: SessionStatus,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) failure: Option<FailureReason>,
    pub(crate) confirmed_block: Option<u64>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) resolved_at: Option<DateTime<Utc>>,
    pub(crate) state_entered_at: Instant,
    pub(crate) deadline: Option<Instant>,
}

impl GameSession {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn player(&self) -> &PlayerAddress {
        &self.player
    }

    pub fn chosen_number(&self) -> u8 {
        self.chosen_number
    }

    pub fn bet_amount(&self) -> Amount {
        self.bet_amount
    }

    pub fn tx_hash(&self) -> &TxHash {
        &self.tx_hash
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            request_id: self.request_id.clone(),
            player: self.player.clone(),
            chosen_number: self.chosen_number,
            bet_amount: self.bet_amount,
            tx_hash: self.tx_hash.clone(),
            status: self.status,
            result_roll: self.outcome.map(|o| o.result_roll),
            payout: self.outcome.map(|o| o.payout),
            failure: self.failure.clone(),
            confirmed_block: self.confirmed_block,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        }
    }
}

/// Immutable view of a session handed to observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub request_id: RequestId,
    pub player: PlayerAddress,
    pub chosen_number: u8,
    pub bet_amount: Amount,
    pub tx_hash: TxHash,
    pub status: SessionStatus,
    pub result_roll: Option<u8>,
    pub payout: Option<Amount>,
    pub failure: Option<FailureReason>,
    pub confirmed_block: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    #[test]
    fn rank__terminal_states__share_the_highest_rank() {
        let terminal = [
            SessionStatus::Completed,
            SessionStatus::TimedOut,
            SessionStatus::Failed,
        ];
        for status in terminal {
            assert!(status.is_terminal());
            assert_eq!(3, status.rank());
        }
        assert!(SessionStatus::Pending.rank() < SessionStatus::WaitingForRandom.rank());
        assert!(
            SessionStatus::WaitingForRandom.rank() < SessionStatus::ReadyToResolve.rank()
        );
    }

    #[test]
    fn serialize__status__uses_screaming_snake_case() {
        let actual = serde_json::to_string(&SessionStatus::WaitingForRandom).unwrap();
        assert_eq!("\"WAITING_FOR_RANDOM\"", actual);
    }

    #[test]
    fn player_address__mixed_case_input__is_normalized() {
        let actual = PlayerAddress::new("0xAbCdEF");
        assert_eq!("0xabcdef", actual.as_str());
    }
}
