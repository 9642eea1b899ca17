use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::{
    DeploymentEnv,
    DeploymentRecord,
    DeploymentStore,
};
use ethers::types::Address;
use futures::StreamExt;
use std::{
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use url::Url;
use wager_engine::{
    Amount,
    EngineConfig,
    PlayerAddress,
    SessionSnapshot,
    WagerEngine,
    gateway::{
        ChainGateway,
        Retrying,
        evm::EvmGateway,
        local::LocalChain,
    },
};

use crate::wallets::{
    find_wallet,
    resolve_wallet_dir,
    unlock_wallet,
};

const SIMULATED_PLAYER: &str = "0x00000000000000000000000000000000000a11ce";
const SIMULATED_BALANCE: Amount = 1_000_000_000_000_000_000_000;

/// Where bets go.
#[derive(Clone, Debug)]
pub enum NetworkTarget {
    /// In-process chain with an oracle that rolls after `oracle_delay`.
    Simulated { oracle_delay: Duration },
    Remote(RemoteTarget),
}

#[derive(Clone, Debug)]
pub struct RemoteTarget {
    pub env: DeploymentEnv,
    pub rpc_url: Option<Url>,
    pub contract: Option<String>,
    pub chain_id: Option<u64>,
    pub wallet: Option<String>,
    pub wallet_dir: Option<String>,
}

#[derive(Clone, Debug)]
pub enum Action {
    Bet {
        number: u8,
        amount: Amount,
        json: bool,
    },
    Rules,
    Record {
        deployment_block: Option<u64>,
    },
}

pub async fn run(target: NetworkTarget, config: EngineConfig, action: Action) -> Result<()> {
    match target {
        NetworkTarget::Simulated { oracle_delay } => {
            if matches!(action, Action::Record { .. }) {
                return Err(eyre!("nothing to record for a simulated chain"));
            }
            let chain = LocalChain::new(PlayerAddress::new(SIMULATED_PLAYER), SIMULATED_BALANCE)
                .with_config(&config);
            let oracle = chain.spawn_oracle(oracle_delay);
            tracing::info!(?oracle_delay, "running against a simulated chain");
            let result = run_with(chain, config, action).await;
            oracle.abort();
            result
        }
        NetworkTarget::Remote(remote) => run_remote(remote, config, action).await,
    }
}

async fn run_remote(remote: RemoteTarget, mut config: EngineConfig, action: Action) -> Result<()> {
    let store = DeploymentStore::new(remote.env)
        .map_err(|e| eyre!(e))
        .wrap_err("opening deployment store")?;
    let record = store
        .load()
        .map_err(|e| eyre!(e))
        .wrap_err("loading deployment record")?;

    let rpc_url = match (&remote.rpc_url, &record) {
        (Some(url), _) => url.to_string(),
        (None, Some(record)) => record.network_url.clone(),
        (None, None) => remote.env.default_rpc_url().to_string(),
    };
    let contract = remote
        .contract
        .clone()
        .or_else(|| record.as_ref().map(|r| r.contract_address.clone()))
        .ok_or_else(|| {
            eyre!("no deployment recorded for {}; pass --contract <address>", remote.env)
        })?;
    let chain_id = remote
        .chain_id
        .or_else(|| record.as_ref().map(|r| r.chain_id))
        .ok_or_else(|| eyre!("unknown chain id for {}; pass --chain-id", remote.env))?;

    if let Action::Record { deployment_block } = action {
        let mut record = DeploymentRecord::new(contract, chain_id, rpc_url);
        record.deployment_block = deployment_block;
        store
            .save(&record)
            .map_err(|e| eyre!(e))
            .wrap_err("recording deployment")?;
        println!("Deployment metadata written to {}", store.path().display());
        return Ok(());
    }

    if config.start_block == 0
        && let Some(block) = record.as_ref().and_then(|r| r.deployment_block)
    {
        config.start_block = block;
    }

    let wallet_name = remote
        .wallet
        .as_deref()
        .ok_or_else(|| eyre!("Specify --wallet <name> to select a keystore"))?;
    let wallet_dir: PathBuf = resolve_wallet_dir(remote.wallet_dir.as_deref())
        .wrap_err("resolving wallet directory")?;
    let descriptor = find_wallet(&wallet_dir, wallet_name).wrap_err("locating requested wallet")?;
    let wallet = unlock_wallet(&descriptor).wrap_err("unlocking keystore")?;

    let contract = Address::from_str(&contract)
        .map_err(|err| eyre!("invalid contract address {contract}: {err}"))?;
    tracing::info!(env = %remote.env, %rpc_url, chain_id, "connecting to dice contract");
    let gateway = EvmGateway::connect(&rpc_url, contract, wallet, chain_id, &config)
        .wrap_err("connecting to the dice contract")?;
    run_with(Retrying::new(gateway, config.retry), config, action).await
}

/// Runs `action` against any gateway.
pub async fn run_with<G: ChainGateway>(
    gateway: G,
    config: EngineConfig,
    action: Action,
) -> Result<()> {
    match action {
        Action::Rules => {
            let rules = gateway
                .game_rules()
                .await
                .wrap_err("fetching game rules")?;
            println!("Minimum bet:       {}", rules.min_bet);
            println!("Maximum bet:       {}", rules.max_bet);
            println!("Payout multiplier: {}x", rules.payout_multiplier);
            if let Err(err) = rules.check() {
                println!("Warning: {err}");
            }
            Ok(())
        }
        Action::Bet {
            number,
            amount,
            json,
        } => {
            let engine = WagerEngine::start(gateway, config)
                .await
                .wrap_err("starting wager engine")?;
            let handle = engine
                .place_bet(number, amount)
                .await
                .wrap_err("placing bet")?;
            if !json {
                println!(
                    "Bet on {number} for {amount} submitted: request {} (tx {})",
                    handle.request_id, handle.tx_hash
                );
            }
            let mut observer = handle.observer;
            while let Some(snapshot) = observer.next().await {
                if json {
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else {
                    println!("{}", describe(&snapshot));
                }
            }
            engine.shutdown().await;
            Ok(())
        }
        Action::Record { .. } => Err(eyre!("recording needs a remote network")),
    }
}

fn describe(snapshot: &SessionSnapshot) -> String {
    let mut line = format!("{:<18}", snapshot.status.as_str());
    if let Some(block) = snapshot.confirmed_block {
        line.push_str(&format!(" block {block}"));
    }
    if let (Some(roll), Some(payout)) = (snapshot.result_roll, snapshot.payout) {
        line.push_str(&format!(" rolled {roll}, payout {payout}"));
    }
    if let Some(failure) = &snapshot.failure {
        line.push_str(&format!(" ({failure})"));
    }
    line
}
