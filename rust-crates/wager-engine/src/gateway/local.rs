use crate::{
    config::EngineConfig,
    error::GatewayError,
    events::{
        EventFilter,
        EventName,
        RawEvent,
    },
    gateway::{
        ChainGateway,
        LogSource,
        PollSettings,
        Receipt,
        Submission,
        Subscription,
        subscription::poll_subscription,
    },
    payout::{
        self,
        DIE_FACES,
        GameRules,
    },
    session::{
        Amount,
        PlayerAddress,
        RequestId,
        TxHash,
    },
};
use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{
    Instrument,
    debug,
    info,
    info_span,
};

/// In-process dice contract with a VRF oracle, for tests and `--simulate`.
///
/// Every submission and every fulfilment mines its own block. Faults can be
/// queued to exercise wallet rejections, reverts, RPC errors and transport
/// drops.
#[derive(Clone)]
pub struct LocalChain {
    chain: Arc<ChainState>,
    player: PlayerAddress,
    confirmation_timeout: Duration,
    settings: PollSettings,
}

struct ChainState {
    inner: Mutex<ChainInner>,
}

#[derive(Default)]
struct Faults {
    reject_signatures: u32,
    insufficient_funds: u32,
    rpc_failures: u32,
    transport_drops: u32,
    revert_next: Option<String>,
    hold_receipts: bool,
    lost_broadcast_replies: u32,
    withhold_started: bool,
}

#[derive(Clone, Debug)]
enum LocalReceipt {
    Mined { block_number: u64, started: RawEvent },
    Reverted { reason: String },
}

#[derive(Clone, Debug)]
struct OpenRequest {
    player: PlayerAddress,
    chosen_number: u8,
    bet_amount: Amount,
}

struct ChainInner {
    height: u64,
    next_request: u64,
    next_tx: u64,
    rules: GameRules,
    balances: HashMap<PlayerAddress, Amount>,
    logs: Vec<RawEvent>,
    receipts: HashMap<TxHash, LocalReceipt>,
    open_requests: BTreeMap<u64, OpenRequest>,
    signature_requests: u64,
    faults: Faults,
}

impl ChainInner {
    fn mine(&mut self) -> u64 {
        self.height += 1;
        self.height
    }

    fn take_rpc_failure(&mut self) -> Result<(), GatewayError> {
        if self.faults.rpc_failures > 0 {
            self.faults.rpc_failures -= 1;
            return Err(GatewayError::Rpc("local node unavailable".into()));
        }
        Ok(())
    }
}

impl LocalChain {
    pub fn new(player: PlayerAddress, balance: Amount) -> Self {
        let config = EngineConfig::default();
        let mut balances = HashMap::new();
        balances.insert(player.clone(), balance);
        let inner = ChainInner {
            height: 0,
            next_request: 1,
            next_tx: 1,
            rules: GameRules::default(),
            balances,
            logs: Vec::new(),
            receipts: HashMap::new(),
            open_requests: BTreeMap::new(),
            signature_requests: 0,
            faults: Faults::default(),
        };
        Self {
            chain: Arc::new(ChainState {
                inner: Mutex::new(inner),
            }),
            player,
            confirmation_timeout: config.confirmation_timeout,
            settings: PollSettings::from_config(&config),
        }
    }

    pub fn with_rules(self, rules: GameRules) -> Self {
        self.chain.inner.lock().rules = rules;
        self
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.confirmation_timeout = config.confirmation_timeout;
        self.settings = PollSettings::from_config(config);
        self
    }

    /// Another account on the same chain, sharing blocks and logs.
    pub fn connect_as(&self, player: PlayerAddress, balance: Amount) -> Self {
        self.chain
            .inner
            .lock()
            .balances
            .insert(player.clone(), balance);
        Self {
            player,
            ..self.clone()
        }
    }

    pub fn height(&self) -> u64 {
        self.chain.inner.lock().height
    }

    pub fn balance(&self) -> Amount {
        self.chain
            .inner
            .lock()
            .balances
            .get(&self.player)
            .copied()
            .unwrap_or_default()
    }

    /// How many times a wallet was asked to sign a bet, on any account.
    pub fn signature_requests(&self) -> u64 {
        self.chain.inner.lock().signature_requests
    }

    pub fn open_requests(&self) -> Vec<RequestId> {
        self.chain
            .inner
            .lock()
            .open_requests
            .keys()
            .map(|id| RequestId::from(*id))
            .collect()
    }

    /// Oracle callback: settles the request with `result_roll` in a new block
    /// and returns that block.
    pub fn fulfill(&self, request_id: &RequestId, result_roll: u8) -> Result<u64, GatewayError> {
        let key: u64 = request_id
            .as_str()
            .parse()
            .map_err(|_| GatewayError::Rpc(format!("unknown request {request_id}")))?;
        let mut inner = self.chain.inner.lock();
        let request = inner
            .open_requests
            .get(&key)
            .cloned()
            .ok_or_else(|| GatewayError::Rpc(format!("request {request_id} is not open")))?;
        let payout = payout::payout(request.chosen_number, result_roll, request.bet_amount)
            .map_err(|err| GatewayError::Rejected(err.to_string()))?;
        inner.open_requests.remove(&key);
        let block_number = inner.mine();
        *inner.balances.entry(request.player).or_default() += payout;
        inner.logs.push(RawEvent::resolved(
            request_id.clone(),
            block_number,
            result_roll,
            payout,
        ));
        debug!(%request_id, result_roll, block_number, "request fulfilled");
        Ok(block_number)
    }

    /// Appends an arbitrary log; the head moves up to its block if needed.
    pub fn emit(&self, event: RawEvent) {
        let mut inner = self.chain.inner.lock();
        inner.height = inner.height.max(event.block_number);
        inner.logs.push(event);
    }

    pub fn mine_empty_blocks(&self, count: u64) {
        self.chain.inner.lock().height += count;
    }

    pub fn reject_next_signatures(&self, count: u32) {
        self.chain.inner.lock().faults.reject_signatures = count;
    }

    pub fn fail_next_funding_checks(&self, count: u32) {
        self.chain.inner.lock().faults.insufficient_funds = count;
    }

    pub fn fail_next_rpc_calls(&self, count: u32) {
        self.chain.inner.lock().faults.rpc_failures = count;
    }

    /// Makes the next `count` head lookups fail as if the socket dropped.
    pub fn drop_transport(&self, count: u32) {
        self.chain.inner.lock().faults.transport_drops = count;
    }

    pub fn revert_next_submission(&self, reason: impl Into<String>) {
        self.chain.inner.lock().faults.revert_next = Some(reason.into());
    }

    /// While held, mined transactions are not reported to waiting callers.
    pub fn hold_receipts(&self, hold: bool) {
        self.chain.inner.lock().faults.hold_receipts = hold;
    }

    /// Mines the next `count` bets but fails their submission replies, as if
    /// the connection dropped after the transaction was sent.
    pub fn lose_next_broadcast_replies(&self, count: u32) {
        self.chain.inner.lock().faults.lost_broadcast_replies = count;
    }

    /// Keeps `GameStarted` out of receipts and log queries, so bets are
    /// confirmed but never seen to start.
    pub fn withhold_started_logs(&self, withhold: bool) {
        self.chain.inner.lock().faults.withhold_started = withhold;
    }

    /// Fulfils every open request with a random roll every `delay`, until the
    /// returned task is aborted.
    pub fn spawn_oracle(&self, delay: Duration) -> JoinHandle<()> {
        let chain = self.clone();
        let task = async move {
            loop {
                tokio::time::sleep(delay).await;
                for request_id in chain.open_requests() {
                    let roll = rand::rng().random_range(DIE_FACES);
                    if let Err(err) = chain.fulfill(&request_id, roll) {
                        debug!(%request_id, %err, "oracle skipped request");
                    }
                }
            }
        };
        tokio::spawn(task.instrument(info_span!("local_oracle")))
    }

    fn submit(&self, chosen_number: u8, bet_amount: Amount) -> Result<Submission, GatewayError> {
        let mut inner = self.chain.inner.lock();
        inner.take_rpc_failure()?;
        inner.signature_requests += 1;
        if inner.faults.reject_signatures > 0 {
            inner.faults.reject_signatures -= 1;
            return Err(GatewayError::UserRejected);
        }
        let balance = inner.balances.get(&self.player).copied().unwrap_or_default();
        if inner.faults.insufficient_funds > 0 || balance < bet_amount {
            inner.faults.insufficient_funds = inner.faults.insufficient_funds.saturating_sub(1);
            return Err(GatewayError::InsufficientFunds(format!(
                "balance {balance} cannot cover {bet_amount}"
            )));
        }

        let tx_number = inner.next_tx;
        inner.next_tx += 1;
        let mut hash = [0u8; 32];
        hash[24..].copy_from_slice(&tx_number.to_be_bytes());
        let tx_hash = TxHash::new(format!("0x{}", hex::encode(hash)));
        let request_number = inner.next_request;
        let request_id = RequestId::from(request_number);
        let block_number = inner.mine();

        let rules = inner.rules;
        let revert_reason = inner.faults.revert_next.take().or_else(|| {
            rules
                .validate_bet(chosen_number, bet_amount)
                .err()
                .map(|err| err.to_string())
        });
        if let Some(reason) = revert_reason {
            inner
                .receipts
                .insert(tx_hash.clone(), LocalReceipt::Reverted { reason });
            return Ok(Submission {
                tx_hash,
                request_id,
            });
        }

        inner.next_request += 1;
        if let Some(balance) = inner.balances.get_mut(&self.player) {
            *balance -= bet_amount;
        }
        let started = RawEvent::started(
            request_id.clone(),
            block_number,
            self.player.clone(),
            chosen_number,
            bet_amount,
        );
        inner.logs.push(started.clone());
        inner.receipts.insert(
            tx_hash.clone(),
            LocalReceipt::Mined {
                block_number,
                started,
            },
        );
        inner.open_requests.insert(
            request_number,
            OpenRequest {
                player: self.player.clone(),
                chosen_number,
                bet_amount,
            },
        );
        info!(%request_id, %tx_hash, block_number, "bet mined");
        if inner.faults.lost_broadcast_replies > 0 {
            inner.faults.lost_broadcast_replies -= 1;
            return Err(GatewayError::Broadcast(
                "connection reset after sending the transaction".into(),
            ));
        }
        Ok(Submission {
            tx_hash,
            request_id,
        })
    }

    fn receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, GatewayError> {
        let mut inner = self.chain.inner.lock();
        inner.take_rpc_failure()?;
        if inner.faults.hold_receipts {
            return Ok(None);
        }
        match inner.receipts.get(tx_hash) {
            Some(LocalReceipt::Mined {
                block_number,
                started,
            }) => Ok(Some(Receipt {
                tx_hash: tx_hash.clone(),
                block_number: *block_number,
                started: (!inner.faults.withhold_started).then(|| started.clone()),
            })),
            Some(LocalReceipt::Reverted { reason }) => Err(GatewayError::Reverted {
                tx_hash: tx_hash.clone(),
                reason: Some(reason.clone()),
            }),
            None => Err(GatewayError::Rpc(format!("unknown transaction {tx_hash}"))),
        }
    }
}

impl ChainGateway for LocalChain {
    fn player(&self) -> PlayerAddress {
        self.player.clone()
    }

    async fn game_rules(&self) -> Result<GameRules, GatewayError> {
        let mut inner = self.chain.inner.lock();
        inner.take_rpc_failure()?;
        Ok(inner.rules)
    }

    async fn submit_bet(
        &self,
        chosen_number: u8,
        bet_amount: Amount,
    ) -> Result<Submission, GatewayError> {
        self.submit(chosen_number, bet_amount)
    }

    async fn await_confirmation(&self, tx_hash: &TxHash) -> Result<Receipt, GatewayError> {
        let poll = async {
            loop {
                if let Some(receipt) = self.receipt(tx_hash)? {
                    return Ok(receipt);
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };
        tokio::time::timeout(self.confirmation_timeout, poll)
            .await
            .map_err(|_| GatewayError::Timeout {
                tx_hash: tx_hash.clone(),
            })?
    }

    fn subscribe(&self, name: EventName, filter: EventFilter) -> Subscription {
        poll_subscription(self.chain.clone(), name, filter, self.settings)
    }
}

impl LogSource for ChainState {
    async fn latest_block(&self) -> Result<u64, GatewayError> {
        let mut inner = self.inner.lock();
        if inner.faults.transport_drops > 0 {
            inner.faults.transport_drops -= 1;
            return Err(GatewayError::Rpc("transport disconnected".into()));
        }
        Ok(inner.height)
    }

    async fn logs(
        &self,
        name: EventName,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>, GatewayError> {
        let inner = self.inner.lock();
        if name == EventName::GameStarted && inner.faults.withhold_started {
            return Ok(Vec::new());
        }
        Ok(inner
            .logs
            .iter()
            .filter(|event| (from_block..=to_block).contains(&event.block_number))
            .filter(|event| event.name() == name && filter.matches(event))
            .cloned()
            .collect())
    }
}
