//! The `drivers` module contains the [EventDispatcher], the [Driver] that routes ledger events
//! to the controllers.

use crate::{
    error::SolverError,
    types::{EventKind, GameId, LedgerEvent},
    CommitRevealController, ConfirmationWaiter, DisputeGameController, Driver, EventSource,
    SolverContext, TaskSelector,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

type GameQueues = Arc<Mutex<HashMap<GameId, mpsc::UnboundedSender<LedgerEvent>>>>;

/// The [EventDispatcher] runs one loop per [EventKind]. Task events are handled on their own
/// tasks; the events of each game are queued to a per-game worker so they are handled in
/// ledger order without blocking other games.
#[derive(Clone)]
pub struct EventDispatcher {
    ctx: Arc<SolverContext>,
    events: Arc<dyn EventSource>,
    commit_reveal: Arc<CommitRevealController>,
    disputes: Arc<DisputeGameController>,
    waiter: Arc<ConfirmationWaiter>,
    queues: GameQueues,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EventDispatcher {
    /// Creates a new [EventDispatcher].
    ///
    /// ### Takes
    /// - `ctx`: The collaborators and shared tables.
    /// - `events`: The source of ledger events.
    /// - `selector`: The policy deciding which tasks to register for.
    pub fn new(
        ctx: Arc<SolverContext>,
        events: Arc<dyn EventSource>,
        selector: Arc<dyn TaskSelector>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let queues: GameQueues = Arc::new(Mutex::new(HashMap::new()));
        let finalized = Arc::clone(&queues);
        let waiter = Arc::new(
            ConfirmationWaiter::new(
                Arc::clone(&ctx.ledger),
                Arc::clone(&ctx.registry),
                ctx.retry.clone(),
                ctx.config.poll_interval,
                cancel.child_token(),
            )
            // Dropping the sender lets the game's worker drain its queue and exit.
            .with_finalized_hook(Arc::new(move |game_id: GameId| {
                finalized
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&game_id);
            })),
        );
        Self {
            commit_reveal: Arc::new(CommitRevealController::new(Arc::clone(&ctx), selector)),
            disputes: Arc::new(DisputeGameController::new(
                Arc::clone(&ctx),
                Arc::clone(&waiter),
            )),
            ctx,
            events,
            waiter,
            queues,
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Returns the token that stops the dispatcher when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the [ConfirmationWaiter] armed by the dispute controller.
    pub fn waiter(&self) -> &Arc<ConfirmationWaiter> {
        &self.waiter
    }

    /// Routes a single event. Never blocks on a handler.
    pub fn dispatch(&self, event: LedgerEvent) {
        tracing::debug!(target: "event-dispatcher", ?event, "Event received.");
        match event {
            LedgerEvent::TaskCreated { .. }
            | LedgerEvent::SolverSelected { .. }
            | LedgerEvent::TaskStateChange { .. } => {
                let controller = Arc::clone(&self.commit_reveal);
                self.tracker.spawn(async move {
                    let kind = event.kind();
                    log_outcome(kind, handle_task_event(&controller, event).await);
                });
            }
            LedgerEvent::StartChallenge { game_id, solver } => {
                if solver != self.ctx.ledger.account() {
                    tracing::debug!(target: "event-dispatcher", game_id = ?game_id, "Challenge against another solver, ignoring.");
                    return;
                }
                self.open_game(game_id, event);
            }
            LedgerEvent::Queried { game_id, .. } | LedgerEvent::SelectedPhase { game_id, .. } => {
                let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
                match queues.get(&game_id) {
                    Some(queue) => {
                        if queue.send(event).is_err() {
                            queues.remove(&game_id);
                        }
                    }
                    None => {
                        tracing::debug!(target: "event-dispatcher", game_id = ?game_id, "Event for an unknown game, ignoring.");
                    }
                }
            }
        }
    }

    /// Creates the queue and worker of a new game and queues its `StartChallenge` event. A
    /// redelivered challenge of an open game joins its queue.
    fn open_game(&self, game_id: GameId, event: LedgerEvent) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let event = match queues.get(&game_id) {
            Some(queue) => match queue.send(event) {
                Ok(()) => return,
                // The worker is exiting; start a fresh one.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(event).is_err() {
            return;
        }
        queues.insert(game_id, tx);

        let disputes = Arc::clone(&self.disputes);
        let ctx = Arc::clone(&self.ctx);
        let queues = Arc::clone(&self.queues);
        self.tracker
            .spawn(game_worker(disputes, ctx, queues, game_id, rx));
    }

    /// Receives events of `kind` until cancelled.
    async fn event_loop(self, kind: EventKind, mut events: mpsc::Receiver<LedgerEvent>) -> Result<()> {
        tracing::info!(target: "event-dispatcher", "Subscribed to {:?} events, beginning event loop.", kind);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None if self.cancel.is_cancelled() => return Ok(()),
                    None => return Err(anyhow!("{kind:?} subscription closed")),
                },
            }
        }
    }

    /// Stops the event loops, cancels the armed waiters and waits for in-flight handlers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        // Dropping the senders lets every game worker drain its queue and exit.
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.tracker.close();
        self.tracker.wait().await;
        self.waiter.shutdown().await;
        tracing::info!(target: "event-dispatcher", "Dispatcher stopped.");
    }
}

#[async_trait]
impl Driver for EventDispatcher {
    async fn start_loop(self) -> Result<()> {
        tracing::info!(target: "event-dispatcher", "Subscribing to ledger events...");
        let mut loops = JoinSet::new();
        for kind in EventKind::ALL {
            let events = match self.events.subscribe(kind).await {
                Ok(events) => events,
                Err(e) => {
                    self.shutdown().await;
                    return Err(anyhow!("could not subscribe to {kind:?} events: {e}"));
                }
            };
            loops.spawn(self.clone().event_loop(kind, events));
        }

        let mut outcome = Ok(());
        while let Some(joined) = loops.join_next().await {
            let result = joined.map_err(|e| anyhow!(e)).and_then(|r| r);
            if let Err(e) = result {
                tracing::error!(target: "event-dispatcher", "Event loop stopped: {:#}", e);
                self.cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        self.shutdown().await;
        outcome
    }
}

/// Handles the events of one game in order. Stops when the game is over or can make no
/// further progress.
async fn game_worker(
    disputes: Arc<DisputeGameController>,
    ctx: Arc<SolverContext>,
    queues: GameQueues,
    game_id: GameId,
    mut events: mpsc::UnboundedReceiver<LedgerEvent>,
) {
    while let Some(event) = events.recv().await {
        let kind = event.kind();
        let result = match event {
            LedgerEvent::StartChallenge { game_id, solver } => {
                disputes.on_start_challenge(game_id, solver).await
            }
            LedgerEvent::Queried { game_id, low, high } => {
                disputes.on_queried(game_id, low, high).await
            }
            LedgerEvent::SelectedPhase {
                game_id,
                low,
                phase,
            } => disputes.on_selected_phase(game_id, low, phase).await,
            _ => Ok(()),
        };

        if let Err(e) = result {
            let ends_game = e.ends_game();
            log_failure(kind, &e);
            if ends_game {
                break;
            }
        }
        if let Some(game) = ctx.registry.game(game_id).await {
            if game.status().is_terminal() {
                tracing::info!(target: "event-dispatcher", game_id = ?game_id, status = ?game.status(), "Game over, closing its queue.");
                break;
            }
        }
    }

    queues
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&game_id);
}

/// Runs the commit-reveal handler of a task event.
async fn handle_task_event(
    controller: &CommitRevealController,
    event: LedgerEvent,
) -> Result<(), SolverError> {
    match event {
        LedgerEvent::TaskCreated { task_id, deposit } => {
            controller.on_task_created(task_id, deposit).await
        }
        LedgerEvent::SolverSelected { task_id, solver } => {
            controller.on_solver_selected(task_id, solver).await
        }
        LedgerEvent::TaskStateChange { task_id, state } => {
            controller.on_task_state_change(task_id, state).await
        }
        _ => Ok(()),
    }
}

fn log_outcome(kind: EventKind, result: Result<(), SolverError>) {
    if let Err(e) = result {
        log_failure(kind, &e);
    }
}

/// Logs a failed handler with its classification. Failures never leave the handler's task.
fn log_failure(kind: EventKind, err: &SolverError) {
    match err {
        SolverError::MissingState(_) | SolverError::Transient { .. } => {
            tracing::warn!(target: "event-dispatcher", event = ?kind, class = err.class(), "{}", err);
        }
        SolverError::ProtocolViolation { .. }
        | SolverError::Reverted { .. }
        | SolverError::Fatal(_) => {
            tracing::error!(target: "event-dispatcher", event = ?kind, class = err.class(), "{}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        engine::Solution,
        error::LedgerError,
        state::Task,
        test_utils::{
            context, eventually, Call, MockContent, MockEngine, MockLedger, MockVm, SOLVER,
        },
        types::{CodeType, StorageType, TaskInfo},
        AcceptAll,
    };
    use ethers::types::{Address, H256, U256};
    use wasm_solver_games::verification::{GameStatus, VmSnapshot};

    fn dispatcher(ledger: &Arc<MockLedger>, ctx: Arc<SolverContext>) -> EventDispatcher {
        EventDispatcher::new(
            ctx,
            Arc::clone(ledger) as Arc<dyn EventSource>,
            Arc::new(AcceptAll),
        )
    }

    fn has_call(ledger: &MockLedger, f: impl Fn(&Call) -> bool) -> bool {
        ledger.calls().iter().any(f)
    }

    /// A context in which task 1 was solved in 7 steps and is challenged in `game_id`.
    async fn challenged(ledger: &Arc<MockLedger>, game_id: GameId) -> Arc<SolverContext> {
        let engine = Arc::new(MockEngine::new(7));
        let ctx = context(
            Arc::clone(ledger),
            Arc::clone(&engine),
            MockContent::default(),
        );
        let mut task = Task::new(1u64.into(), H256::repeat_byte(0x11), U256::zero());
        task.vm = Some(engine.vm());
        task.solution = Some(Solution {
            hash: MockVm::solution_hash(),
            steps: 7,
            vm: VmSnapshot::zero(),
        });
        ctx.registry.register(task).await;
        ledger.set_game_task(game_id, 1u64.into());
        ctx
    }

    fn open_games(dispatcher: &EventDispatcher) -> usize {
        dispatcher.queues.lock().unwrap().len()
    }

    #[tokio::test]
    async fn failed_handlers_do_not_stop_the_dispatcher() {
        let ledger = Arc::new(MockLedger::default());
        ledger.add_task(
            1u64.into(),
            TaskInfo {
                giver: Address::repeat_byte(0x01),
                init_task_hash: H256::repeat_byte(0x02),
                code_type: CodeType::Wasm,
                code_storage: StorageType::Blockchain,
                storage_address: H256::repeat_byte(0x03),
            },
        );
        let ctx = context(
            Arc::clone(&ledger),
            Arc::new(MockEngine::new(3)),
            MockContent::default(),
        );
        let dispatcher = dispatcher(&ledger, ctx);

        // Selection for a task this process never registered for is reported as missing state.
        let err = handle_task_event(
            &dispatcher.commit_reveal,
            LedgerEvent::SolverSelected {
                task_id: 42u64.into(),
                solver: SOLVER,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.class(), "missing-state");

        let cancel = dispatcher.cancel_token();
        let running = tokio::spawn(dispatcher.start_loop());
        eventually(|| ledger.subscribers() == EventKind::ALL.len()).await;

        ledger
            .emit(LedgerEvent::SolverSelected {
                task_id: 42u64.into(),
                solver: SOLVER,
            })
            .await;
        ledger
            .emit(LedgerEvent::TaskCreated {
                task_id: 1u64.into(),
                deposit: U256::zero(),
            })
            .await;
        eventually(|| has_call(&ledger, |c| matches!(c, Call::RegisterForTask(..)))).await;

        ledger
            .emit(LedgerEvent::SolverSelected {
                task_id: 1u64.into(),
                solver: SOLVER,
            })
            .await;
        eventually(|| has_call(&ledger, |c| matches!(c, Call::CommitSolution(..)))).await;

        ledger
            .emit(LedgerEvent::TaskStateChange {
                task_id: 1u64.into(),
                state: 4u64.into(),
            })
            .await;
        eventually(|| has_call(&ledger, |c| matches!(c, Call::RevealSolution(..)))).await;

        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn game_events_are_handled_in_order() {
        let ledger = Arc::new(MockLedger::default());
        let game_id = H256::repeat_byte(0x99);
        let ctx = challenged(&ledger, game_id).await;

        let dispatcher = dispatcher(&ledger, Arc::clone(&ctx));
        let cancel = dispatcher.cancel_token();
        let running = tokio::spawn(dispatcher.start_loop());
        eventually(|| ledger.subscribers() == EventKind::ALL.len()).await;

        ledger
            .emit(LedgerEvent::StartChallenge {
                game_id,
                solver: SOLVER,
            })
            .await;
        eventually(|| has_call(&ledger, |c| matches!(c, Call::Report(_, 0, 8, _)))).await;

        for (low, high) in [(0u64, 4u64), (2, 4), (3, 4)] {
            ledger
                .emit(LedgerEvent::Queried {
                    game_id,
                    low: low.into(),
                    high: high.into(),
                })
                .await;
        }
        eventually(|| has_call(&ledger, |c| *c == Call::PostPhases(game_id, 3))).await;

        ledger
            .emit(LedgerEvent::SelectedPhase {
                game_id,
                low: 3u64.into(),
                phase: 0u64.into(),
            })
            .await;
        eventually(|| has_call(&ledger, |c| matches!(c, Call::CallJudge(..)))).await;

        let moves: Vec<_> = ledger
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Initialize(..)))
            .collect();
        assert_eq!(
            moves,
            vec![
                Call::Report(game_id, 0, 8, MockVm::state_hash(4)),
                Call::Report(game_id, 0, 4, MockVm::state_hash(2)),
                Call::Report(game_id, 2, 4, MockVm::state_hash(3)),
                Call::PostPhases(game_id, 3),
                Call::CallJudge(game_id, 3, wasm_solver_games::verification::Phase::Fetch),
            ]
        );
        assert_eq!(
            ctx.registry.game(game_id).await.unwrap().status(),
            GameStatus::JudgeResolved
        );

        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn redelivered_challenges_reach_the_open_game() {
        let ledger = Arc::new(MockLedger::default());
        let game_id = H256::repeat_byte(0x98);
        let ctx = challenged(&ledger, game_id).await;
        for _ in 0..3 {
            ledger.fail_next("report", LedgerError::Transient("dropped".into()));
        }
        let dispatcher = dispatcher(&ledger, ctx);

        let challenge = LedgerEvent::StartChallenge {
            game_id,
            solver: SOLVER,
        };
        dispatcher.dispatch(challenge.clone());
        dispatcher.dispatch(challenge);
        eventually(|| has_call(&ledger, |c| matches!(c, Call::Report(_, 0, 8, _)))).await;
        assert_eq!(open_games(&dispatcher), 1);

        dispatcher.shutdown().await;
        assert_eq!(
            ledger
                .calls()
                .iter()
                .filter(|c| matches!(c, Call::Report(..)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn finalized_games_close_their_queue() {
        let ledger = Arc::new(MockLedger::default());
        let game_id = H256::repeat_byte(0x97);
        let ctx = challenged(&ledger, game_id).await;
        let dispatcher = dispatcher(&ledger, Arc::clone(&ctx));

        dispatcher.dispatch(LedgerEvent::StartChallenge {
            game_id,
            solver: SOLVER,
        });
        eventually(|| dispatcher.waiter().pending() == 1).await;
        assert_eq!(open_games(&dispatcher), 1);

        ledger.set_game_over_ready(game_id, true);
        ledger.set_block(1_000);
        eventually(|| open_games(&dispatcher) == 0).await;
        assert!(has_call(&ledger, |c| *c == Call::GameOver(game_id)));
        assert_eq!(
            ctx.registry.game(game_id).await.unwrap().status(),
            GameStatus::TimedOut
        );
        eventually(|| dispatcher.waiter().armed() == 0).await;

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn events_outside_our_games_are_dropped() {
        let ledger = Arc::new(MockLedger::default());
        let ctx = context(
            Arc::clone(&ledger),
            Arc::new(MockEngine::new(3)),
            MockContent::default(),
        );
        let dispatcher = dispatcher(&ledger, Arc::clone(&ctx));
        let game_id = H256::repeat_byte(0x77);

        dispatcher.dispatch(LedgerEvent::StartChallenge {
            game_id,
            solver: Address::repeat_byte(0xbb),
        });
        dispatcher.dispatch(LedgerEvent::Queried {
            game_id,
            low: 0u64.into(),
            high: 4u64.into(),
        });
        assert!(dispatcher.queues.lock().unwrap().is_empty());

        dispatcher.shutdown().await;
        assert!(ledger.calls().is_empty());
        assert!(ctx.registry.game(game_id).await.is_none());
    }

    #[tokio::test]
    async fn closed_subscriptions_stop_the_loop() {
        let ledger = Arc::new(MockLedger::default());
        let ctx = context(
            Arc::clone(&ledger),
            Arc::new(MockEngine::new(3)),
            MockContent::default(),
        );
        let running = tokio::spawn(dispatcher(&ledger, ctx).start_loop());
        eventually(|| ledger.subscribers() == EventKind::ALL.len()).await;

        ledger.close(EventKind::Queried);
        assert!(running.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn failed_subscriptions_stop_the_loop() {
        let ledger = Arc::new(MockLedger::default());
        ledger.fail_next("subscribe", LedgerError::Transient("refused".into()));
        let ctx = context(
            Arc::clone(&ledger),
            Arc::new(MockEngine::new(3)),
            MockContent::default(),
        );
        assert!(dispatcher(&ledger, ctx).start_loop().await.is_err());
    }
}
