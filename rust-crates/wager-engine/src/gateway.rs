use crate::{
    error::GatewayError,
    events::{
        EventFilter,
        EventName,
        RawEvent,
    },
    payout::GameRules,
    session::{
        Amount,
        PlayerAddress,
        RequestId,
        TxHash,
    },
};

pub mod evm;
pub mod local;
pub mod retry;
pub mod subscription;

pub use retry::Retrying;
pub use subscription::{
    PollSettings,
    Subscription,
};

/// Result of handing a bet to the wallet and broadcasting it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub tx_hash: TxHash,
    pub request_id: RequestId,
}

/// A mined, successful bet transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// `GameStarted` decoded from the receipt's own logs, when present.
    pub started: Option<RawEvent>,
}

/// Everything the engine needs from a chain.
pub trait ChainGateway: Send + Sync + 'static {
    /// Account that signs bets through this gateway.
    fn player(&self) -> PlayerAddress;

    fn game_rules(&self) -> impl Future<Output = Result<GameRules, GatewayError>> + Send;

    fn submit_bet(
        &self,
        chosen_number: u8,
        bet_amount: Amount,
    ) -> impl Future<Output = Result<Submission, GatewayError>> + Send;

    /// Resolves once the transaction is mined; a mined but failed
    /// transaction is [`GatewayError::Reverted`].
    fn await_confirmation(
        &self,
        tx_hash: &TxHash,
    ) -> impl Future<Output = Result<Receipt, GatewayError>> + Send;

    fn subscribe(&self, name: EventName, filter: EventFilter) -> Subscription;
}

/// Block-ranged access to decoded contract logs, polled by subscriptions.
pub trait LogSource: Send + Sync + 'static {
    fn latest_block(&self) -> impl Future<Output = Result<u64, GatewayError>> + Send;

    fn logs(
        &self,
        name: EventName,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = Result<Vec<RawEvent>, GatewayError>> + Send;
}
