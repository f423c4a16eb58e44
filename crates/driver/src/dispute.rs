//! The `dispute` module contains the [DisputeGameController], which plays the solver's side of
//! a verification game.

use crate::{
    engine::TaskVm,
    error::{LedgerError, MissingState, SolverError},
    types::{GameId, TaskId},
    ConfirmationWaiter, SolverContext,
};
use ethers::types::{Address, U256};
use std::sync::Arc;
use wasm_solver_games::verification::{
    build_proof, BisectionGame, GameError, GameStatus, Phase, Proof, Response, VerificationGame,
    VmSnapshot,
};

/// The [DisputeGameController] drives every game in which this account's solution is
/// challenged. Calls for one game must be made in ledger order.
pub struct DisputeGameController {
    ctx: Arc<SolverContext>,
    waiter: Arc<ConfirmationWaiter>,
}

impl DisputeGameController {
    pub fn new(ctx: Arc<SolverContext>, waiter: Arc<ConfirmationWaiter>) -> Self {
        Self { ctx, waiter }
    }

    fn violation(game_id: GameId, reason: impl ToString) -> SolverError {
        SolverError::ProtocolViolation {
            game_id,
            reason: reason.to_string(),
        }
    }

    /// Feeds an event into the local game. A rejected event abandons the game.
    ///
    /// ### Returns
    /// - `Ok(Some(Response))`: The move to make.
    /// - `Ok(None)`: The game is over; the event is ignored.
    /// - `Err(SolverError)`: The game is unknown, or the event violated the protocol.
    async fn advance(
        &self,
        game_id: GameId,
        f: impl FnOnce(&mut BisectionGame) -> Result<Response, GameError>,
    ) -> Result<Option<Response>, SolverError> {
        let outcome = self
            .ctx
            .registry
            .update_game(game_id, |game| {
                if game.status().is_terminal() {
                    return Ok(None);
                }
                f(game).map(Some).map_err(|e| {
                    game.abandon();
                    e
                })
            })
            .await
            .ok_or(SolverError::MissingState(MissingState::Game(game_id)))?;
        outcome.map_err(|e| Self::violation(game_id, e))
    }

    /// Converts a ledger step index, abandoning the game if it cannot be a step.
    async fn step_index(&self, game_id: GameId, raw: U256) -> Result<u64, SolverError> {
        if raw > U256::from(u64::MAX) {
            self.ctx
                .registry
                .update_game(game_id, |game| game.abandon())
                .await;
            return Err(Self::violation(game_id, format!("step index {raw} out of range")));
        }
        Ok(raw.as_u64())
    }

    /// Returns the prepared virtual machine of a task.
    async fn task_vm(&self, task_id: TaskId) -> Result<Arc<dyn TaskVm>, SolverError> {
        let task = self
            .ctx
            .registry
            .task(task_id)
            .await
            .ok_or(SolverError::MissingState(MissingState::Task(task_id)))?;
        task.vm
            .ok_or(SolverError::MissingState(MissingState::Solution(task_id)))
    }

    /// Handles `StartChallenge`: initializes the game and answers the implied first query. A
    /// redelivered challenge of a known game repeats a move that did not land.
    pub async fn on_start_challenge(
        &self,
        game_id: GameId,
        solver: Address,
    ) -> Result<(), SolverError> {
        let ledger = &*self.ctx.ledger;
        let retry = &self.ctx.retry;
        if solver != ledger.account() {
            return Ok(());
        }
        if let Some(game) = self.ctx.registry.game(game_id).await {
            return self.on_redelivered_challenge(game).await;
        }

        let task_id = retry
            .read("getTask", move || ledger.game_task(game_id))
            .await?;
        tracing::info!(target: "dispute-game", game_id = ?game_id, %task_id, "Solution has been challenged.");

        let task = self
            .ctx
            .registry
            .task(task_id)
            .await
            .ok_or(SolverError::MissingState(MissingState::Task(task_id)))?;
        let (Some(vm), Some(solution)) = (task.vm, task.solution) else {
            return Err(SolverError::MissingState(MissingState::Solution(task_id)));
        };

        let total_steps = solution.steps + 1;
        let game = BisectionGame::new(game_id, task_id, total_steps)
            .map_err(|e| Self::violation(game_id, e))?;
        if !self.ctx.registry.insert_game(game).await {
            return Ok(());
        }

        let task_vm = &*vm;
        if let Err(e) = self
            .initialize_game(game_id, task_vm, &solution.vm, total_steps)
            .await
        {
            if !matches!(e, SolverError::ProtocolViolation { .. }) {
                // Forget the game so a redelivered challenge starts over.
                self.ctx.registry.remove_game(game_id).await;
            }
            return Err(e);
        }

        match self.advance(game_id, |game| game.initialize()).await? {
            Some(response) => self.respond(game_id, task_vm, response).await,
            None => Ok(()),
        }
    }

    /// Sends `initialize` and checks the bracket it opened.
    async fn initialize_game(
        &self,
        game_id: GameId,
        vm: &dyn TaskVm,
        end: &VmSnapshot,
        total_steps: u64,
    ) -> Result<(), SolverError> {
        let ledger = &*self.ctx.ledger;
        let retry = &self.ctx.retry;

        let initial = retry
            .read("initializeWasmTask", move || vm.initial_state())
            .await?;
        let start = &initial.vm;
        retry
            .submit(
                "initialize",
                move || async move {
                    let (_, high) = ledger.indices(game_id).await?;
                    Ok::<_, LedgerError>(high == U256::from(total_steps))
                },
                move || ledger.initialize(game_id, start, total_steps, end),
            )
            .await?;
        tracing::info!(target: "dispute-game", game_id = ?game_id, total_steps, "Game has been initialized.");

        let (low, high) = retry
            .read("getIndices", move || ledger.indices(game_id))
            .await?;
        if low != U256::zero() || high != U256::from(total_steps) {
            self.ctx
                .registry
                .update_game(game_id, |game| game.abandon())
                .await;
            return Err(Self::violation(
                game_id,
                format!("initialized with bracket [{low}, {high}], expected [0, {total_steps}]"),
            ));
        }
        Ok(())
    }

    /// Answers the current bracket of a known game again if its last move did not land.
    async fn on_redelivered_challenge(&self, game: BisectionGame) -> Result<(), SolverError> {
        let game_id = game.game_id;
        if game.status() == GameStatus::Uninitialized {
            tracing::debug!(target: "dispute-game", game_id = ?game_id, "Game is being initialized, ignoring duplicate event.");
            return Ok(());
        }
        let bracket = game.bracket();
        let Some(response) = self
            .advance(game_id, |g| g.on_query(bracket.low, bracket.high))
            .await?
        else {
            return Ok(());
        };
        let vm = self.task_vm(game.task_id).await?;
        self.respond(game_id, &*vm, response).await
    }

    /// Handles `Queried`: reports the midpoint state, or posts the phases once the bracket
    /// is a single step.
    pub async fn on_queried(&self, game_id: GameId, low: U256, high: U256) -> Result<(), SolverError> {
        let Some(game) = self.ctx.registry.game(game_id).await else {
            return Ok(());
        };
        let low = self.step_index(game_id, low).await?;
        let high = self.step_index(game_id, high).await?;
        tracing::info!(target: "dispute-game", game_id = ?game_id, task_id = %game.task_id, low, high, "Received query.");

        let Some(response) = self.advance(game_id, |g| g.on_query(low, high)).await? else {
            return Ok(());
        };
        let vm = self.task_vm(game.task_id).await?;
        self.respond(game_id, &*vm, response).await
    }

    /// Handles `SelectedPhase`: submits the judge proof for the selected phase.
    pub async fn on_selected_phase(
        &self,
        game_id: GameId,
        low: U256,
        phase: U256,
    ) -> Result<(), SolverError> {
        let Some(game) = self.ctx.registry.game(game_id).await else {
            return Ok(());
        };
        let low = self.step_index(game_id, low).await?;
        tracing::info!(target: "dispute-game", game_id = ?game_id, low, %phase, "Phase selected.");

        let Some(response) = self
            .advance(game_id, |g| {
                let phase = Phase::try_from(phase)?;
                g.on_phase_selected(low, phase)
            })
            .await?
        else {
            return Ok(());
        };
        let vm = self.task_vm(game.task_id).await?;
        self.respond(game_id, &*vm, response).await
    }

    /// Makes the move decided by the game, then arms the confirmation waiter.
    async fn respond(
        &self,
        game_id: GameId,
        vm: &dyn TaskVm,
        response: Response,
    ) -> Result<(), SolverError> {
        let ledger = &*self.ctx.ledger;
        let retry = &self.ctx.retry;

        match response {
            Response::DoNothing => {
                tracing::debug!(target: "dispute-game", game_id = ?game_id, "Query already answered onchain.");
                return Ok(());
            }
            Response::Report { low, high, step } => {
                let state = retry
                    .read("getLocation", move || vm.location(step))
                    .await?;
                retry
                    .submit(
                        "report",
                        move || async move {
                            Ok::<_, LedgerError>(ledger.state_at(game_id, step).await? == state)
                        },
                        move || ledger.report(game_id, low, high, state),
                    )
                    .await?;
                self.ctx
                    .registry
                    .update_game(game_id, BisectionGame::report_landed)
                    .await;
                tracing::info!(target: "dispute-game", game_id = ?game_id, low, high, step, "Reported state hash.");
            }
            Response::PostPhases { low } => {
                let low_state = retry
                    .read("getStateAt", move || ledger.state_at(game_id, low))
                    .await?;
                let trace = retry.read("getStep", move || vm.step(low)).await?;
                let states = trace
                    .phase_states()
                    .map_err(|e| SolverError::Fatal(format!("step {low}: {e}")))?;
                if states[0] != low_state {
                    tracing::warn!(target: "dispute-game", game_id = ?game_id, low, "First phase state differs from the agreed state.");
                }
                retry
                    .submit_once("postPhases", move || ledger.post_phases(game_id, low, states))
                    .await?;
                self.mark(game_id, BisectionGame::phases_posted).await;
                tracing::info!(target: "dispute-game", game_id = ?game_id, low, "Phases have been posted.");
            }
            Response::Judge { low, phase } => {
                let trace = retry.read("getStep", move || vm.step(low)).await?;
                let proof = build_proof(&trace, phase)
                    .map_err(|e| SolverError::Fatal(format!("step {low}: {e}")))?;
                match &proof {
                    Proof::Generic(p) => {
                        retry
                            .submit_once("callJudge", move || ledger.call_judge(game_id, low, p))
                            .await?
                    }
                    Proof::Custom(p) => {
                        retry
                            .submit_once("callCustomJudge", move || {
                                ledger.call_custom_judge(game_id, low, p)
                            })
                            .await?
                    }
                }
                self.mark(game_id, BisectionGame::judged).await;
                tracing::info!(target: "dispute-game", game_id = ?game_id, low, phase = phase.key(), custom = proof.is_custom(), "Judge called.");
            }
        }

        self.arm_waiter(game_id).await
    }

    /// Applies a lifecycle transition after a move landed.
    async fn mark(&self, game_id: GameId, f: fn(&mut BisectionGame) -> Result<(), GameError>) {
        let outcome = self.ctx.registry.update_game(game_id, f).await;
        if let Some(Err(e)) = outcome {
            tracing::warn!(target: "dispute-game", game_id = ?game_id, "{}", e);
        }
    }

    async fn arm_waiter(&self, game_id: GameId) -> Result<(), SolverError> {
        let ledger = &*self.ctx.ledger;
        let height = self
            .ctx
            .retry
            .read("eth_blockNumber", move || ledger.block_number())
            .await?;
        self.waiter
            .arm(game_id, height + self.ctx.config.confirmation_blocks);
        Ok(())
    }
}
