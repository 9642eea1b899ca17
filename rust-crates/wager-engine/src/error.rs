use crate::session::{
    Amount,
    PlayerAddress,
    RequestId,
    TxHash,
};
use thiserror::Error;

/// Rejections raised before anything is sent to the chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("chosen number {0} is not a die face (1..=6)")]
    NumberOutOfRange(u8),
    #[error("bet amount must be positive")]
    ZeroAmount,
    #[error("bet amount {amount} is below the contract minimum {min}")]
    BelowMinimum { amount: Amount, min: Amount },
    #[error("bet amount {amount} is above the contract maximum {max}")]
    AboveMaximum { amount: Amount, max: Amount },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("wallet rejected the signature request")]
    UserRejected,
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    /// Transport failure once the transaction may already be in the mempool.
    #[error("bet may have been broadcast: {0}")]
    Broadcast(String),
    #[error("contract rejected the bet: {0}")]
    Rejected(String),
    #[error("transaction {tx_hash} reverted")]
    Reverted {
        tx_hash: TxHash,
        reason: Option<String>,
    },
    #[error("timed out waiting for transaction {tx_hash}")]
    Timeout { tx_hash: TxHash },
}

impl GatewayError {
    pub fn rpc(err: impl std::fmt::Display) -> Self {
        GatewayError::Rpc(err.to_string())
    }

    /// Only transport level failures are worth another attempt. A failure
    /// after broadcast is not: repeating it could place a second bet.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Rpc(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("player {player} already has a wager in flight")]
    SessionInFlight {
        player: PlayerAddress,
        request_id: Option<RequestId>,
    },
    #[error("session {0} is already tracked")]
    DuplicateSession(RequestId),
    #[error("session {0} is not tracked")]
    UnknownSession(RequestId),
    #[error("no reservation is held for player {0}")]
    NotReserved(PlayerAddress),
}

/// Everything `place_bet` can hand back synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceBetError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("player {player} already has a wager in flight")]
    SessionInFlight {
        player: PlayerAddress,
        request_id: Option<RequestId>,
    },
    #[error("wallet rejected the signature request")]
    UserRejected,
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("bet may have been placed; check the chain before retrying: {0}")]
    BroadcastUnknown(String),
    #[error("contract rejected the bet: {0}")]
    Rejected(String),
    #[error(transparent)]
    Store(StoreError),
    #[error("wager engine has stopped")]
    EngineStopped,
}

impl From<GatewayError> for PlaceBetError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UserRejected => PlaceBetError::UserRejected,
            GatewayError::InsufficientFunds(msg) => PlaceBetError::InsufficientFunds(msg),
            GatewayError::Rpc(msg) => PlaceBetError::Rpc(msg),
            GatewayError::Broadcast(msg) => PlaceBetError::BroadcastUnknown(msg),
            GatewayError::Rejected(msg) => PlaceBetError::Rejected(msg),
            GatewayError::Reverted { tx_hash, reason } => PlaceBetError::Rejected(
                reason.unwrap_or_else(|| format!("transaction {tx_hash} reverted")),
            ),
            GatewayError::Timeout { tx_hash } => {
                PlaceBetError::Rpc(format!("timed out submitting {tx_hash}"))
            }
        }
    }
}

impl From<StoreError> for PlaceBetError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionInFlight { player, request_id } => {
                PlaceBetError::SessionInFlight { player, request_id }
            }
            other => PlaceBetError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "contract payout multiplier {reported} does not match the engine's multiplier {expected}"
    )]
    RulesMismatch { reported: Amount, expected: Amount },
    #[error("contract bet limits are inconsistent: min {min_bet} > max {max_bet}")]
    InvalidRules { min_bet: Amount, max_bet: Amount },
    #[error("invalid engine configuration: {0}")]
    Config(String),
    #[error("failed to read engine configuration")]
    ConfigIo(#[from] std::io::Error),
    #[error("failed to parse engine configuration")]
    ConfigParse(#[from] serde_json::Error),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
