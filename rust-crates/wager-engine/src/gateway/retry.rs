use crate::{
    config::RetryPolicy,
    error::GatewayError,
    events::{
        EventFilter,
        EventName,
    },
    gateway::{
        ChainGateway,
        Receipt,
        Submission,
        Subscription,
    },
    payout::GameRules,
    session::{
        Amount,
        PlayerAddress,
        TxHash,
    },
};
use rand::Rng;
use std::time::Duration;
use tracing::warn;

pub(crate) fn jittered_backoff(rng: &mut impl Rng, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // equal jitter: [backoff / 2, backoff]
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.random_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Delay before retry number `attempt` under `policy`, jittered.
pub(crate) fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    jittered_backoff(&mut rand::rng(), policy.backoff_for(attempt))
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are spent.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = retry_delay(policy, attempt);
                warn!(operation, attempt, %err, ?delay, "transient rpc failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Gateway decorator that retries transport failures of the inner gateway.
#[derive(Clone, Debug)]
pub struct Retrying<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G> Retrying<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

impl<G: ChainGateway> ChainGateway for Retrying<G> {
    fn player(&self) -> PlayerAddress {
        self.inner.player()
    }

    async fn game_rules(&self) -> Result<GameRules, GatewayError> {
        with_retry(&self.policy, "game_rules", || self.inner.game_rules()).await
    }

    async fn submit_bet(
        &self,
        chosen_number: u8,
        bet_amount: Amount,
    ) -> Result<Submission, GatewayError> {
        with_retry(&self.policy, "submit_bet", || {
            self.inner.submit_bet(chosen_number, bet_amount)
        })
        .await
    }

    async fn await_confirmation(&self, tx_hash: &TxHash) -> Result<Receipt, GatewayError> {
        with_retry(&self.policy, "await_confirmation", || {
            self.inner.await_confirmation(tx_hash)
        })
        .await
    }

    fn subscribe(&self, name: EventName, filter: EventFilter) -> Subscription {
        // subscriptions recover from transport failures on their own
        self.inner.subscribe(name, filter)
    }
}
