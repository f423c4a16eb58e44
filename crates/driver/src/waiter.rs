//! The `waiter` module contains the [ConfirmationWaiter], which finalizes games once their
//! confirmation window has passed.

use crate::{error::LedgerError, types::GameId, Ledger, Registry, RetryPolicy, SolverError};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::time::sleep;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Called with the id of every game the waiter finalized.
pub type FinalizedHook = Arc<dyn Fn(GameId) + Send + Sync>;

/// The [ConfirmationWaiter] schedules one background check per `(game, block)` pair. Each
/// check waits until the ledger reaches the trigger block, asks whether the game can be
/// finalized and, if so, submits `gameOver`.
pub struct ConfirmationWaiter {
    ledger: Arc<dyn Ledger>,
    registry: Arc<Registry>,
    retry: RetryPolicy,
    poll_interval: Duration,
    /// Pairs whose check is still running.
    armed: Arc<Mutex<HashSet<(GameId, u64)>>>,
    on_finalized: Option<FinalizedHook>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ConfirmationWaiter {
    /// Creates a new [ConfirmationWaiter]. Cancelling `cancel` stops every armed check.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<Registry>,
        retry: RetryPolicy,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            registry,
            retry,
            poll_interval,
            armed: Arc::new(Mutex::new(HashSet::new())),
            on_finalized: None,
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Sets the hook run after a game has been finalized.
    pub fn with_finalized_hook(mut self, hook: FinalizedHook) -> Self {
        self.on_finalized = Some(hook);
        self
    }

    /// Schedules the finalization check of `game_id` at `trigger_block` without waiting for it.
    ///
    /// ### Returns
    /// - `true`: A new check was scheduled.
    /// - `false`: The pair was already armed, or the waiter is shut down.
    pub fn arm(&self, game_id: GameId, trigger_block: u64) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let fresh = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((game_id, trigger_block));
        if !fresh {
            return false;
        }

        let ledger = Arc::clone(&self.ledger);
        let registry = Arc::clone(&self.registry);
        let retry = self.retry.clone();
        let poll_interval = self.poll_interval;
        let armed = Arc::clone(&self.armed);
        let on_finalized = self.on_finalized.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(target: "confirmation-waiter", game_id = ?game_id, trigger_block, "Waiter cancelled.");
                }
                result = finalize_at(&*ledger, &registry, &retry, poll_interval, game_id, trigger_block) => match result {
                    Ok(true) => {
                        if let Some(hook) = on_finalized {
                            hook(game_id);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(target: "confirmation-waiter", game_id = ?game_id, class = e.class(), "Could not finalize game: {}", e);
                    }
                }
            }
            armed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&(game_id, trigger_block));
        });
        tracing::debug!(target: "confirmation-waiter", game_id = ?game_id, trigger_block, "Armed waiter.");
        true
    }

    /// Returns the number of checks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Returns the number of armed `(game, block)` pairs.
    pub fn armed(&self) -> usize {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancels every armed check and waits for them to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Waits for `trigger_block` and finalizes the game if the ledger allows it. Returns whether
/// `gameOver` was submitted.
async fn finalize_at(
    ledger: &dyn Ledger,
    registry: &Registry,
    retry: &RetryPolicy,
    poll_interval: Duration,
    game_id: GameId,
    trigger_block: u64,
) -> Result<bool, SolverError> {
    loop {
        let height = retry
            .read("eth_blockNumber", move || ledger.block_number())
            .await?;
        if height >= trigger_block {
            break;
        }
        sleep(poll_interval).await;
    }

    if let Some(game) = registry.game(game_id).await {
        if game.status().is_terminal() {
            tracing::debug!(target: "confirmation-waiter", game_id = ?game_id, status = ?game.status(), "Game already over.");
            return Ok(false);
        }
    }

    let ready = retry
        .read("gameOver", move || ledger.game_over_ready(game_id))
        .await?;
    if !ready {
        tracing::debug!(target: "confirmation-waiter", game_id = ?game_id, trigger_block, "Game cannot be finalized yet.");
        return Ok(false);
    }

    retry
        .submit(
            "gameOver",
            move || async move { Ok::<_, LedgerError>(!ledger.game_over_ready(game_id).await?) },
            move || ledger.game_over(game_id),
        )
        .await?;
    registry
        .update_game(game_id, |game| {
            if let Err(e) = game.timed_out() {
                tracing::debug!(target: "confirmation-waiter", game_id = ?game_id, "{}", e);
            }
        })
        .await;
    tracing::info!(target: "confirmation-waiter", game_id = ?game_id, "Finalized game.");
    Ok(true)
}
