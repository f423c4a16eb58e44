use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use ethers::{
    middleware::SignerMiddleware,
    providers::{Provider, Ws},
    signers::{LocalWallet, Signer},
    types::Address,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::Level;
use wasm_solver_driver::{
    AcceptAll, Driver, DriverConfig, EthersLedger, EventDispatcher, MemoryStore,
    MountedContentStore, OffchainInterpreter, PostgresStore, RetryConfig, SolverContext,
    TaskStore, DEFAULT_CONFIRMATION_BLOCKS,
};

/// Arguments for the `wasm-solver` binary.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Verbosity level (0-4)
    #[arg(long, short, help = "Verbosity level (0-4)", action = ArgAction::Count, env = "VERBOSITY")]
    v: u8,

    /// The Websocket RPC endpoint used to index events and send transactions.
    #[arg(
        long,
        short,
        help = "The Websocket RPC endpoint used to index events and send transactions.",
        env = "WASM_SOLVER_WS"
    )]
    ws_endpoint: String,

    /// The private key of the solver account.
    #[arg(
        long,
        help = "The private key of the solver account.",
        env = "WASM_SOLVER_PRIVATE_KEY",
        hide_env_values = true
    )]
    private_key: String,

    /// The chain id transactions are signed for.
    #[arg(long, help = "The chain id transactions are signed for.", env = "WASM_SOLVER_CHAIN_ID")]
    chain_id: u64,

    /// The address of the incentive layer contract.
    #[arg(
        long,
        short,
        help = "The address of the incentive layer contract.",
        env = "WASM_SOLVER_INCENTIVE_LAYER"
    )]
    incentive_layer: Address,

    /// The address of the file system contract.
    #[arg(
        long,
        short,
        help = "The address of the file system contract.",
        env = "WASM_SOLVER_FILE_SYSTEM"
    )]
    file_system: Address,

    /// The address of the interactive dispute resolution contract.
    #[arg(
        long,
        short,
        help = "The address of the interactive dispute resolution contract.",
        env = "WASM_SOLVER_DISPUTE_LAYER"
    )]
    dispute_layer: Address,

    /// The path of the offchain interpreter binary.
    #[arg(
        long,
        help = "The path of the offchain interpreter binary.",
        env = "WASM_SOLVER_INTERPRETER",
        default_value = "ocaml-offchain/interpreter/wasm"
    )]
    interpreter: PathBuf,

    /// The directory task bundles are written to.
    #[arg(
        long,
        help = "The directory task bundles are written to.",
        env = "WASM_SOLVER_WORK_DIR",
        default_value = "tmp.solver"
    )]
    work_dir: PathBuf,

    /// The directory the content-addressed store is mounted at.
    #[arg(
        long,
        help = "The directory the content-addressed store is mounted at.",
        env = "WASM_SOLVER_CONTENT_ROOT"
    )]
    content_root: PathBuf,

    /// The number of blocks after a move before a game may be finalized.
    #[arg(
        long,
        help = "The number of blocks after a move before a game may be finalized.",
        env = "WASM_SOLVER_CONFIRMATION_BLOCKS",
        default_value_t = DEFAULT_CONFIRMATION_BLOCKS
    )]
    confirmation_blocks: u64,

    /// The block height polling interval, in milliseconds.
    #[arg(
        long,
        help = "The block height polling interval, in milliseconds.",
        env = "WASM_SOLVER_POLL_INTERVAL_MS",
        default_value_t = 4_000
    )]
    poll_interval_ms: u64,

    /// Attempts per external call, including the first.
    #[arg(
        long,
        help = "Attempts per external call, including the first.",
        env = "WASM_SOLVER_RETRY_ATTEMPTS",
        default_value_t = 5
    )]
    retry_attempts: u32,

    /// The pause after the first failed attempt, in milliseconds.
    #[arg(
        long,
        help = "The pause after the first failed attempt, in milliseconds.",
        env = "WASM_SOLVER_RETRY_BACKOFF_MS",
        default_value_t = 500
    )]
    retry_backoff_ms: u64,

    /// The timeout of a single external call, in seconds.
    #[arg(
        long,
        help = "The timeout of a single external call, in seconds.",
        env = "WASM_SOLVER_CALL_TIMEOUT",
        default_value_t = 30
    )]
    call_timeout: u64,

    /// The timeout of a full task execution, in seconds.
    #[arg(
        long,
        help = "The timeout of a full task execution, in seconds.",
        env = "WASM_SOLVER_EXECUTION_TIMEOUT",
        default_value_t = 600
    )]
    execution_timeout: u64,

    /// The postgres database tasks are persisted to. Tasks are kept in memory if unset.
    #[arg(
        long,
        help = "The postgres database tasks are persisted to. Tasks are kept in memory if unset.",
        env = "WASM_SOLVER_POSTGRES_URL",
        hide_env_values = true
    )]
    postgres_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse the command arguments
    let args = Args::parse();

    // Initialize the tracing subscriber
    init_tracing_subscriber(args.v)?;

    let config = DriverConfig {
        confirmation_blocks: args.confirmation_blocks,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        retry: RetryConfig {
            max_attempts: args.retry_attempts.max(1),
            base_backoff: Duration::from_millis(args.retry_backoff_ms),
            call_timeout: Duration::from_secs(args.call_timeout),
            execution_timeout: Duration::from_secs(args.execution_timeout),
        },
    };
    tracing::info!(target: "wasm-solver-cli", "Driver config created successfully.");

    tracing::debug!(target: "wasm-solver-cli", "Connecting to websocket endpoint...");
    let provider = Provider::<Ws>::connect(args.ws_endpoint.clone()).await?;
    let wallet = args
        .private_key
        .parse::<LocalWallet>()
        .map_err(|e| anyhow!("invalid private key: {e}"))?
        .with_chain_id(args.chain_id);
    let account = wallet.address();
    let client = Arc::new(SignerMiddleware::new(provider, wallet));
    tracing::info!(target: "wasm-solver-cli", "Websocket connected @ {}, solving as {:?}", &args.ws_endpoint, account);

    let ledger = Arc::new(EthersLedger::new(
        client,
        args.incentive_layer,
        args.file_system,
        args.dispute_layer,
    ));
    let store: Arc<dyn TaskStore> = match args.postgres_url {
        Some(url) => {
            tracing::info!(target: "wasm-solver-cli", "Persisting tasks to postgres.");
            Arc::new(PostgresStore::connect(url).await?)
        }
        None => {
            tracing::warn!(target: "wasm-solver-cli", "No postgres URL given, task secrets will not survive a restart.");
            Arc::new(MemoryStore::default())
        }
    };

    let ctx = Arc::new(SolverContext::new(
        Arc::clone(&ledger) as _,
        Arc::new(OffchainInterpreter::new(args.interpreter, args.work_dir)),
        Arc::new(MountedContentStore::new(args.content_root)),
        store,
        config,
        StdRng::from_entropy(),
    ));
    let driver = EventDispatcher::new(ctx, ledger, Arc::new(AcceptAll));

    // Stop the driver loop on ctrl-c, letting in-flight handlers finish.
    let cancel = driver.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "wasm-solver-cli", "Received ctrl-c, shutting down...");
            cancel.cancel();
        }
    });

    // Start the driver loop.
    driver.start_loop().await
}

/// Initializes the tracing subscriber
///
/// # Arguments
/// * `verbosity_level` - The verbosity level (0-4)
///
/// # Returns
/// * `Result<()>` - Ok if successful, Err otherwise.
fn init_tracing_subscriber(verbosity_level: u8) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(match verbosity_level {
            0 => Level::ERROR,
            1 => Level::WARN,
            2 => Level::INFO,
            3 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|e| anyhow!(e))
}
