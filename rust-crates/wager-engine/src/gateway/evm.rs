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
    payout::GameRules,
    session::{
        Amount,
        PlayerAddress,
        RequestId,
        TxHash,
    },
};
use ethers::{
    abi::RawLog,
    contract::{
        EthEvent,
        LogMeta,
        abigen,
    },
    core::types::{
        Address,
        H256,
        Log,
        U64,
        U256,
    },
    middleware::SignerMiddleware,
    providers::{
        Http,
        Middleware,
        Provider,
    },
    signers::{
        LocalWallet,
        Signer,
    },
};
use std::{
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tracing::{
    info,
    warn,
};

abigen!(
    DiceGame,
    r#"[
        function placeBet(uint8 chosenNumber) external payable returns (uint256)
        function minBet() external view returns (uint256)
        function maxBet() external view returns (uint256)
        function payoutMultiplier() external view returns (uint256)
        event GameStarted(uint256 indexed requestId, address indexed player, uint8 chosenNumber, uint256 betAmount)
        event GameResolved(uint256 indexed requestId, uint8 resultRoll, uint256 payout)
    ]"#
);

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Gateway to a deployed dice contract over JSON-RPC.
#[derive(Clone)]
pub struct EvmGateway {
    inner: Arc<EvmInner>,
    player: PlayerAddress,
    confirmation_timeout: Duration,
    settings: PollSettings,
}

struct EvmInner {
    provider: Provider<Http>,
    contract: DiceGame<Client>,
    signer: Address,
}

impl EvmGateway {
    pub fn connect(
        rpc_url: &str,
        contract: Address,
        wallet: LocalWallet,
        chain_id: u64,
        config: &EngineConfig,
    ) -> Result<Self, GatewayError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|err| GatewayError::Rpc(format!("invalid rpc url {rpc_url}: {err}")))?;
        let wallet = wallet.with_chain_id(chain_id);
        let signer = wallet.address();
        let client = Arc::new(SignerMiddleware::new(provider.clone(), wallet));
        let contract = DiceGame::new(contract, client);
        info!(
            player = %format!("{signer:#x}"),
            contract = %format!("{:#x}", contract.address()),
            chain_id,
            "connected to dice contract"
        );
        Ok(Self {
            inner: Arc::new(EvmInner {
                provider,
                contract,
                signer,
            }),
            player: player_address(signer),
            confirmation_timeout: config.confirmation_timeout,
            settings: PollSettings::from_config(config),
        })
    }

    pub fn contract_address(&self) -> Address {
        self.inner.contract.address()
    }
}

impl ChainGateway for EvmGateway {
    fn player(&self) -> PlayerAddress {
        self.player.clone()
    }

    async fn game_rules(&self) -> Result<GameRules, GatewayError> {
        let contract = &self.inner.contract;
        let min_bet = contract.min_bet().call().await.map_err(classify)?;
        let max_bet = contract.max_bet().call().await.map_err(classify)?;
        let payout_multiplier = contract.payout_multiplier().call().await.map_err(classify)?;
        Ok(GameRules {
            min_bet: to_amount(min_bet)?,
            max_bet: to_amount(max_bet)?,
            payout_multiplier: to_amount(payout_multiplier)?,
        })
    }

    async fn submit_bet(
        &self,
        chosen_number: u8,
        bet_amount: Amount,
    ) -> Result<Submission, GatewayError> {
        let call = self
            .inner
            .contract
            .place_bet(chosen_number)
            .from(self.inner.signer)
            .value(U256::from(bet_amount));
        // the dry run returns the request id the contract is about to assign
        let request_id = call.call().await.map_err(classify)?;
        let pending = call.send().await.map_err(|err| match classify(err) {
            GatewayError::Rpc(message) => GatewayError::Broadcast(message),
            other => other,
        })?;
        let tx_hash = pending.tx_hash();
        Ok(Submission {
            tx_hash: TxHash::new(format!("{tx_hash:#x}")),
            request_id: RequestId::new(request_id.to_string()),
        })
    }

    async fn await_confirmation(&self, tx_hash: &TxHash) -> Result<Receipt, GatewayError> {
        let hash = H256::from_str(tx_hash.as_str()).map_err(|err| {
            GatewayError::Rpc(format!("malformed transaction hash {tx_hash}: {err}"))
        })?;
        let poll = async {
            loop {
                match self.inner.provider.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(err) => warn!(%tx_hash, %err, "receipt lookup failed"),
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };
        let receipt = tokio::time::timeout(self.confirmation_timeout, poll)
            .await
            .map_err(|_| GatewayError::Timeout {
                tx_hash: tx_hash.clone(),
            })?;

        if receipt.status == Some(U64::zero()) {
            return Err(GatewayError::Reverted {
                tx_hash: tx_hash.clone(),
                reason: None,
            });
        }
        let block_number = receipt
            .block_number
            .map(|number| number.as_u64())
            .ok_or_else(|| GatewayError::Rpc(format!("receipt for {tx_hash} has no block")))?;
        let contract = self.contract_address();
        let started = receipt
            .logs
            .iter()
            .filter(|log| log.address == contract)
            .find_map(|log| decode_started(log, block_number));
        Ok(Receipt {
            tx_hash: tx_hash.clone(),
            block_number,
            started,
        })
    }

    fn subscribe(&self, name: EventName, filter: EventFilter) -> Subscription {
        poll_subscription(self.inner.clone(), name, filter, self.settings)
    }
}

impl LogSource for EvmInner {
    async fn latest_block(&self) -> Result<u64, GatewayError> {
        self.provider
            .get_block_number()
            .await
            .map(|number| number.as_u64())
            .map_err(GatewayError::rpc)
    }

    async fn logs(
        &self,
        name: EventName,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>, GatewayError> {
        let request_id = request_topic(filter)?;
        match name {
            EventName::GameStarted => {
                let mut query = self
                    .contract
                    .event::<GameStartedFilter>()
                    .from_block(from_block)
                    .to_block(to_block);
                if let Some(request_id) = request_id {
                    query = query.topic1(request_id);
                }
                if let Some(player) = player_topic(filter)? {
                    query = query.topic2(player);
                }
                let found = query
                    .query_with_meta()
                    .await
                    .map_err(GatewayError::rpc)?;
                found
                    .into_iter()
                    .map(|(event, meta)| started_event(event, &meta))
                    .collect()
            }
            EventName::GameResolved => {
                let mut query = self
                    .contract
                    .event::<GameResolvedFilter>()
                    .from_block(from_block)
                    .to_block(to_block);
                if let Some(request_id) = request_id {
                    query = query.topic1(request_id);
                }
                let found = query
                    .query_with_meta()
                    .await
                    .map_err(GatewayError::rpc)?;
                found
                    .into_iter()
                    .map(|(event, meta)| resolved_event(event, &meta))
                    .collect()
            }
        }
    }
}

fn player_address(address: Address) -> PlayerAddress {
    PlayerAddress::new(format!("{address:#x}"))
}

/// Indexed `requestId` topic for `filter`, if it names one.
fn request_topic(filter: &EventFilter) -> Result<Option<U256>, GatewayError> {
    filter
        .request_id
        .as_ref()
        .map(|request_id| {
            U256::from_dec_str(request_id.as_str()).map_err(|err| {
                GatewayError::Rpc(format!("request id {request_id} is not a uint256: {err}"))
            })
        })
        .transpose()
}

/// Indexed `player` topic for `filter`. `GameResolved` does not index the
/// player, so only `GameStarted` queries use it.
fn player_topic(filter: &EventFilter) -> Result<Option<Address>, GatewayError> {
    filter
        .player
        .as_ref()
        .map(|player| {
            Address::from_str(player.as_str()).map_err(|err| {
                GatewayError::Rpc(format!("player {player} is not an address: {err}"))
            })
        })
        .transpose()
}

fn to_amount(value: U256) -> Result<Amount, GatewayError> {
    if value > U256::from(Amount::MAX) {
        return Err(GatewayError::Rpc(format!("amount {value} exceeds 128 bits")));
    }
    Ok(value.as_u128())
}

fn started_event(event: GameStartedFilter, meta: &LogMeta) -> Result<RawEvent, GatewayError> {
    Ok(RawEvent::started(
        RequestId::new(event.request_id.to_string()),
        meta.block_number.as_u64(),
        player_address(event.player),
        event.chosen_number,
        to_amount(event.bet_amount)?,
    )
    .with_log_index(meta.log_index.low_u64()))
}

fn resolved_event(event: GameResolvedFilter, meta: &LogMeta) -> Result<RawEvent, GatewayError> {
    Ok(RawEvent::resolved(
        RequestId::new(event.request_id.to_string()),
        meta.block_number.as_u64(),
        event.result_roll,
        to_amount(event.payout)?,
    )
    .with_log_index(meta.log_index.low_u64()))
}

fn decode_started(log: &Log, block_number: u64) -> Option<RawEvent> {
    if log.topics.first() != Some(&GameStartedFilter::signature()) {
        return None;
    }
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let event = match <GameStartedFilter as EthEvent>::decode_log(&raw) {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "undecodable GameStarted log in receipt");
            return None;
        }
    };
    let bet_amount = to_amount(event.bet_amount).ok()?;
    let log_index = log.log_index.map(|index| index.low_u64()).unwrap_or_default();
    Some(
        RawEvent::started(
            RequestId::new(event.request_id.to_string()),
            block_number,
            player_address(event.player),
            event.chosen_number,
            bet_amount,
        )
        .with_log_index(log_index),
    )
}

/// Maps wallet and node failures onto the gateway's error kinds.
fn classify(err: impl std::fmt::Display) -> GatewayError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("user rejected") || lowered.contains("user denied") {
        GatewayError::UserRejected
    } else if lowered.contains("insufficient funds") {
        GatewayError::InsufficientFunds(message)
    } else if lowered.contains("revert") {
        GatewayError::Rejected(message)
    } else {
        GatewayError::Rpc(message)
    }
}
