mod client;
mod wallets;

use clap::{
    ArgGroup,
    Args as ClapArgs,
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::DeploymentEnv;
use std::{
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use url::Url;
use wager_engine::{
    Amount,
    EngineConfig,
};

use crate::client::{
    Action,
    NetworkTarget,
    RemoteTarget,
};

const DEFAULT_LOG_FILTER: &str = "wager=info,wager_engine=info";

#[derive(Parser, Debug)]
#[command(
    name = "wager",
    about = "Place dice bets and follow them until they settle",
    version,
    group(
        ArgGroup::new("network")
            .args(["simulate", "devnet", "testnet", "local"])
            .required(true)
    )
)]
struct Args {
    /// Play against an in-process chain with a simulated VRF oracle
    #[arg(long)]
    simulate: bool,

    /// Use the devnet deployment
    #[arg(long)]
    devnet: bool,

    /// Use the testnet deployment
    #[arg(long)]
    testnet: bool,

    /// Use a local node (default RPC http://127.0.0.1:8545)
    #[arg(long)]
    local: bool,

    /// Override RPC URL
    #[arg(long)]
    rpc_url: Option<Url>,

    /// Dice contract address (defaults to the recorded deployment)
    #[arg(long)]
    contract: Option<String>,

    /// Chain id used for signing (defaults to the recorded deployment)
    #[arg(long)]
    chain_id: Option<u64>,

    /// Keystore name, without the .json extension
    #[arg(long)]
    wallet: Option<String>,

    /// Override keystore directory (defaults to ~/.wager/wallets)
    #[arg(long)]
    wallet_dir: Option<String>,

    /// Engine configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    /// Delay before the simulated oracle fulfils a request
    #[arg(long, default_value_t = 1_500)]
    oracle_delay_ms: u64,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Flags that take precedence over the configuration file.
#[derive(ClapArgs, Debug, Default)]
struct ConfigOverrides {
    /// Blocks a log must be buried under before it is delivered
    #[arg(long)]
    confirmations: Option<u64>,

    #[arg(long)]
    confirmation_timeout_secs: Option<u64>,

    #[arg(long)]
    resolution_timeout_secs: Option<u64>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// First block to scan for game events
    #[arg(long)]
    start_block: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Place a bet and print every state change until it settles
    Bet {
        /// Die face to bet on (1-6)
        #[arg(long)]
        number: u8,

        /// Stake in the smallest unit of the native token
        #[arg(long)]
        amount: Amount,

        /// Print snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the contract's betting limits and payout multiplier
    Rules,
    /// Save the contract address for the selected network
    Record {
        /// Block the contract was deployed in
        #[arg(long)]
        deployment_block: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref())?;

    let config = load_config(args.config.as_deref(), &args.overrides)?;
    let target = network_target(&args)?;
    let action = match args.command {
        Command::Bet {
            number,
            amount,
            json,
        } => Action::Bet {
            number,
            amount,
            json,
        },
        Command::Rules => Action::Rules,
        Command::Record { deployment_block } => Action::Record { deployment_block },
    };
    client::run(target, config, action).await
}

fn network_target(args: &Args) -> Result<NetworkTarget> {
    if args.simulate {
        return Ok(NetworkTarget::Simulated {
            oracle_delay: Duration::from_millis(args.oracle_delay_ms),
        });
    }
    deployments::ensure_structure()
        .map_err(|e| eyre!(e))
        .wrap_err("initializing deployment directories")?;
    let env = if args.devnet {
        DeploymentEnv::Dev
    } else if args.testnet {
        DeploymentEnv::Test
    } else {
        DeploymentEnv::Local
    };
    Ok(NetworkTarget::Remote(RemoteTarget {
        env,
        rpc_url: args.rpc_url.clone(),
        contract: args.contract.clone(),
        chain_id: args.chain_id,
        wallet: args.wallet.clone(),
        wallet_dir: args.wallet_dir.clone(),
    }))
}

fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_json_file(path)
            .wrap_err_with(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(confirmations) = overrides.confirmations {
        config.confirmations = confirmations;
    }
    if let Some(secs) = overrides.confirmation_timeout_secs {
        config.confirmation_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.resolution_timeout_secs {
        config.resolution_timeout = Duration::from_secs(secs);
    }
    if let Some(millis) = overrides.poll_interval_ms {
        config.poll_interval = Duration::from_millis(millis);
    }
    if let Some(block) = overrides.start_block {
        config.start_block = block;
    }
    config.validate().wrap_err("invalid engine configuration")?;
    Ok(config)
}

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console = fmt::layer().with_writer(std::io::stderr);
    match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, "wager.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args__definition__is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn args__two_networks__are_rejected() {
        let actual = Args::try_parse_from(["wager", "--simulate", "--local", "rules"]);

        assert!(actual.is_err());
    }

    #[test]
    fn args__bet_subcommand__parses_number_and_amount() {
        let args =
            Args::try_parse_from(["wager", "--simulate", "bet", "--number", "4", "--amount", "100"])
                .unwrap();

        assert!(matches!(
            args.command,
            Command::Bet {
                number: 4,
                amount: 100,
                json: false
            }
        ));
    }

    #[test]
    fn load_config__overrides__win_over_the_file() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "confirmations": 3, "resolution_timeout_ms": 120000 }"#)
            .unwrap();
        let overrides = ConfigOverrides {
            confirmations: Some(5),
            ..ConfigOverrides::default()
        };

        // when
        let actual = load_config(Some(&path), &overrides).unwrap();

        // then
        assert_eq!(5, actual.confirmations);
        assert_eq!(Duration::from_secs(120), actual.resolution_timeout);
    }

    #[test]
    fn load_config__resolution_shorter_than_confirmation__is_rejected() {
        let overrides = ConfigOverrides {
            confirmation_timeout_secs: Some(100),
            resolution_timeout_secs: Some(10),
            ..ConfigOverrides::default()
        };

        assert!(load_config(None, &overrides).is_err());
    }
}
