use crate::bridge::{BridgeConfig, DEFAULT_CHECKPOINT_INTERVAL, ServeMode};
use crate::csn::CsnConfig;
use crate::{DirBlockSource, Error, Paths, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, ScriptBuf};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use utreexo_accumulator::ForestKind;

/// Time granted to a clean shutdown before the process exits anyway.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bitcoin network type.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum Network {
    /// Mainnet.
    Mainnet,
    /// Testnet.
    Testnet,
    /// Signet.
    Signet,
    /// Regtest.
    Regtest,
}

impl From<Network> for bitcoin::Network {
    fn from(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::Bitcoin,
            Network::Testnet => Self::Testnet,
            Network::Signet => Self::Signet,
            Network::Regtest => Self::Regtest,
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct CommonParams {
    /// Specify the chain network.
    #[arg(long, value_name = "NETWORK", default_value = "mainnet")]
    pub net: Network,

    /// Sets a custom logging filter (syntax: `<target>=<level>`).
    ///
    /// Falls back to `RUST_LOG`, then to `info`.
    ///
    /// *Example*: `--log info,utreexo_ttl=debug`.
    #[arg(short = 'l', long, value_name = "LOG_PATTERN")]
    pub log: Option<String>,
}

/// Build the accumulator from a block directory and serve proofs.
#[derive(Debug, Clone, clap::Args)]
pub struct Bridge {
    /// Directory holding `<height>.blk` blocks and `<height>.rev` undo records.
    #[arg(long, value_name = "PATH")]
    pub datadir: PathBuf,

    /// Where to write the forest and proof data.
    #[arg(long, value_name = "PATH", default_value = "utree")]
    pub bridgedir: PathBuf,

    /// Forest storage backend.
    #[arg(long, value_enum, default_value_t = ForestKind::Ram)]
    pub forest: ForestKind,

    /// Pages kept in memory by the copy-on-write forest.
    #[arg(long, default_value_t = 500)]
    pub cowmaxcache: usize,

    /// Stop building after this height.
    #[arg(long)]
    pub quitat: Option<i32>,

    /// Serve the existing proofs without building.
    #[arg(long, conflicts_with = "noserve")]
    pub serve: bool,

    /// Build, then exit without serving.
    #[arg(long)]
    pub noserve: bool,

    /// Address the proof server listens on.
    #[arg(long, default_value = "127.0.0.1:8338")]
    pub listen: String,

    /// Keep open-ended proof streams running as new blocks are built.
    #[arg(long)]
    pub followtip: bool,

    /// Save the forest every this many blocks while building, 0 to save only at the end.
    #[arg(long, default_value_t = DEFAULT_CHECKPOINT_INTERVAL)]
    pub checkpointinterval: i32,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub common_params: CommonParams,
}

/// Validate blocks with proofs streamed by a bridge.
#[derive(Debug, Clone, clap::Args)]
pub struct Csn {
    /// Bridge to connect to.
    #[arg(long, default_value = "127.0.0.1:8338")]
    pub host: String,

    /// Address whose outputs are remembered and reported.
    #[arg(long, value_name = "ADDRESS")]
    pub watchaddr: Option<String>,

    /// Verify input scripts (needs the `checksig` feature).
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    pub checksig: bool,

    /// Remember new outputs spent within this many blocks.
    #[arg(long, default_value_t = 1000)]
    pub lookahead: i32,

    /// Stop after validating this many blocks.
    #[arg(long)]
    pub quitafter: Option<u32>,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub common_params: CommonParams,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run a bridge node.
    Bridge(Bridge),

    /// Run a compact state node.
    Csn(Csn),
}

/// Utreexo bridge node and compact state node.
#[derive(Debug, Parser)]
#[command(name = "utreexo", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Bridge {
    fn config(&self) -> Result<BridgeConfig> {
        if self.quitat.is_some_and(|height| height < 1) {
            return Err(Error::Config("--quitat must be at least 1".to_string()));
        }
        if self.checkpointinterval < 0 {
            return Err(Error::Config("--checkpointinterval must not be negative".to_string()));
        }
        let serve = match (self.serve, self.noserve) {
            (true, _) => ServeMode::ServeOnly,
            (false, true) => ServeMode::Build,
            (false, false) => ServeMode::BuildAndServe,
        };
        Ok(BridgeConfig {
            network: self.common_params.net.into(),
            paths: Paths::new(&self.bridgedir),
            forest: self.forest,
            cow_max_pages: self.cowmaxcache,
            quit_at: self.quitat,
            serve,
            listen: self.listen.clone(),
            follow_tip: self.followtip,
            checkpoint_interval: self.checkpointinterval,
        })
    }
}

impl Csn {
    fn config(&self) -> Result<CsnConfig> {
        let network = self.common_params.net.into();
        if self.checksig && cfg!(not(feature = "checksig")) {
            return Err(Error::Config(
                "--checksig=true needs a build with the `checksig` feature".to_string(),
            ));
        }
        if self.lookahead < 0 {
            return Err(Error::Config("--lookahead must not be negative".to_string()));
        }
        let watch = self
            .watchaddr
            .as_deref()
            .map(|address| parse_watch_address(address, network))
            .transpose()?;
        Ok(CsnConfig {
            network,
            host: self.host.clone(),
            watch,
            check_signatures: self.checksig,
            lookahead: self.lookahead,
            quit_after: self.quitafter,
        })
    }
}

fn parse_watch_address(address: &str, network: bitcoin::Network) -> Result<ScriptBuf> {
    let address = address
        .parse::<Address<NetworkUnchecked>>()
        .and_then(|address| address.require_network(network))
        .map_err(|err| Error::Config(format!("Invalid --watchaddr {address}: {err}")))?;
    Ok(address.script_pubkey())
}

fn init_logger(log: Option<&str>) -> Result<()> {
    let filter = match log {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|err| Error::Config(format!("Invalid --log {directives}: {err}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| Error::Config(format!("Failed to install logger: {err}")))
}

/// Resolves on the first ctrl-c and arms a watchdog bounding the shutdown.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "Failed to listen for the shutdown signal");
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutting down, flushing state");

    let watchdog = std::thread::Builder::new()
        .name("shutdown-watchdog".to_string())
        .spawn(|| {
            std::thread::sleep(SHUTDOWN_TIMEOUT);
            let err = Error::ShutdownTimeout(SHUTDOWN_TIMEOUT);
            tracing::error!("{err}, data written since the last flush may be lost");
            std::process::exit(err.exit_code());
        });
    if let Err(err) = watchdog {
        tracing::warn!(?err, "Failed to start shutdown watchdog");
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("utreexo")
        .build()?)
}

/// Parse and run command line arguments.
pub fn run() -> Result<()> {
    let Cli { command } = Cli::parse();

    match command {
        Command::Bridge(bridge) => {
            init_logger(bridge.common_params.log.as_deref())?;
            let config = bridge.config()?;
            let source = Arc::new(DirBlockSource::open(&bridge.datadir, config.network)?);
            build_runtime()?.block_on(async move {
                crate::bridge::run(config, source, shutdown_signal()).await?;
                Ok(())
            })
        }
        Command::Csn(csn) => {
            init_logger(csn.common_params.log.as_deref())?;
            let config = csn.config()?;
            build_runtime()?.block_on(async move {
                crate::csn::run(config, shutdown_signal()).await?;
                Ok(())
            })
        }
    }
}
