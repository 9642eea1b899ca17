pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod payout;
pub mod reconciler;
pub mod session;
pub mod state_machine;
pub mod store;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::{
    EngineConfig,
    RetryPolicy,
};
pub use engine::{
    SessionHandle,
    SessionObserver,
    WagerEngine,
};
pub use error::{
    EngineError,
    GatewayError,
    PlaceBetError,
    StoreError,
    ValidationError,
};
pub use payout::{
    GameRules,
    PAYOUT_MULTIPLIER,
};
pub use session::{
    Amount,
    PlayerAddress,
    RequestId,
    SessionSnapshot,
    SessionStatus,
    TxHash,
};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
