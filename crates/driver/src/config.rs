//! The `config` module contains the [DriverConfig] and the [SolverContext] shared by the
//! controllers.

use crate::{ContentStore, ExecutionEngine, Ledger, Registry, RetryConfig, RetryPolicy, TaskStore};
use rand::rngs::StdRng;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// The number of blocks to wait after a move before a game may be finalized.
pub const DEFAULT_CONFIRMATION_BLOCKS: u64 = 105;

/// The [DriverConfig] struct contains the protocol-level configuration of the
/// [Driver](crate::Driver) implementations.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Blocks to wait after a move before asking whether the game can be finalized.
    pub confirmation_blocks: u64,
    /// How often the confirmation waiters poll the block height.
    pub poll_interval: Duration,
    /// Timeouts and retry bounds of external calls.
    pub retry: RetryConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            confirmation_blocks: DEFAULT_CONFIRMATION_BLOCKS,
            poll_interval: Duration::from_secs(4),
            retry: RetryConfig::default(),
        }
    }
}

/// The [SolverContext] holds the collaborators and shared tables handed to every controller.
pub struct SolverContext {
    pub ledger: Arc<dyn Ledger>,
    pub engine: Arc<dyn ExecutionEngine>,
    pub content: Arc<dyn ContentStore>,
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<Registry>,
    pub retry: RetryPolicy,
    pub config: DriverConfig,
    /// The randomness source of secrets and commitment slots.
    rng: Mutex<StdRng>,
}

impl SolverContext {
    /// Creates a new [SolverContext] with the given collaborators.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        engine: Arc<dyn ExecutionEngine>,
        content: Arc<dyn ContentStore>,
        store: Arc<dyn TaskStore>,
        config: DriverConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            ledger,
            engine,
            content,
            store,
            registry: Arc::new(Registry::default()),
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Runs `f` with exclusive access to the randomness source.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}
