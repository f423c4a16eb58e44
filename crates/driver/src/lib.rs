#![doc = include_str!("../README.md")]

use anyhow::Result;
use async_trait::async_trait;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Provider, Ws},
    signers::LocalWallet,
};

/// Contains the smart contract bindings used by the driver.
mod bindings;

mod config;
pub use config::{DriverConfig, SolverContext, DEFAULT_CONFIRMATION_BLOCKS};

mod error;
pub use error::{EngineError, LedgerError, MissingState, Retryable, SolverError};

mod types;
pub use types::*;

mod retry;
pub use retry::{RetryConfig, RetryPolicy};

mod ledger;
pub use ledger::{EthersLedger, EventSource, Ledger};

mod engine;
pub use engine::{
    BundleFile, CodeBundle, ContentStore, ExecutionEngine, InitialState, MountedContentStore,
    OffchainInterpreter, Solution, TaskVm, CODE_FILE_NAME,
};

mod state;
pub use state::{Registry, Task};

mod store;
pub use store::{MemoryStore, PostgresStore, TaskRecord, TaskStore};

mod commit_reveal;
pub use commit_reveal::{AcceptAll, CommitRevealController, TaskSelector};

mod dispute;
pub use dispute::DisputeGameController;

mod waiter;
pub use waiter::{ConfirmationWaiter, FinalizedHook};

mod drivers;
pub use drivers::EventDispatcher;

#[cfg(test)]
mod test_utils;

/// The signing websocket client used to index events and send transactions.
pub type SignerMiddlewareWS = SignerMiddleware<Provider<Ws>, LocalWallet>;

/// The [Driver] trait defines the interface for all driver loops that are ran by the
/// `wasm-solver` binary.
#[async_trait]
pub trait Driver {
    /// Starts the [Driver] loop. Returns once the loop is cancelled or fails.
    async fn start_loop(self) -> Result<()>;
}
