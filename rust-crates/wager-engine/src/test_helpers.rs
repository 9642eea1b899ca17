use crate::{
    config::EngineConfig,
    engine::WagerEngine,
    gateway::local::LocalChain,
    session::{
        Amount,
        PlayerAddress,
    },
};
use std::time::Duration;

pub const STARTING_BALANCE: Amount = 1_000_000;

/// Engine wired to an in-process chain, with timings short enough for
/// paused-clock tests.
pub struct TestContext {
    pub chain: LocalChain,
    pub engine: WagerEngine<LocalChain>,
    pub config: EngineConfig,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let chain = LocalChain::new(alice(), STARTING_BALANCE).with_config(&config);
        Self::on_chain(chain, config).await
    }

    pub async fn on_chain(chain: LocalChain, config: EngineConfig) -> Self {
        let engine = WagerEngine::start(chain.clone(), config.clone())
            .await
            .expect("engine should start against the local chain");
        Self {
            chain,
            engine,
            config,
        }
    }
}

pub fn alice() -> PlayerAddress {
    PlayerAddress::new("0xa11ce")
}

pub fn bob() -> PlayerAddress {
    PlayerAddress::new("0xb0b")
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        confirmation_timeout: Duration::from_secs(10),
        resolution_timeout: Duration::from_secs(60),
        reorder_window: Duration::from_secs(5),
        retention_window: Duration::from_secs(120),
        tick_interval: Duration::from_millis(100),
        poll_interval: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}
