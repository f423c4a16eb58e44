//! The `ledger` module contains the [Ledger] and [EventSource] seams and [EthersLedger], their
//! implementation over the `IncentiveLayer`, `FileSystem` and `Interactive` contracts.

use crate::{
    bindings::{
        FileSystem, IncentiveLayer, Interactive, QueriedFilter, SelectedPhaseFilter,
        SolverSelectedFilter, StartChallengeFilter, TaskCreatedFilter, TaskStateChangeFilter,
    },
    error::LedgerError,
    types::{CodeType, EventKind, GameId, LedgerEvent, SolutionInfo, StorageType, TaskId, TaskInfo},
    SignerMiddlewareWS,
};
use async_trait::async_trait;
use ethers::{
    abi::Detokenize,
    contract::{parse_log, ContractCall, ContractError},
    providers::{Middleware, StreamExt},
    types::{Address, Log, H256, U256, U64},
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use wasm_solver_games::verification::{
    Commitment, CustomJudgeProof, JudgeProof, VmSnapshot, PHASE_STATE_COUNT,
};

/// Gas budgets of the state-changing calls.
mod gas {
    pub const DEPOSIT: u64 = 100_000;
    pub const REGISTER: u64 = 200_000;
    pub const COMMIT: u64 = 200_000;
    pub const REVEAL: u64 = 300_000;
    pub const INITIALIZE: u64 = 1_000_000;
    pub const REPORT: u64 = 200_000;
    pub const POST_PHASES: u64 = 400_000;
    pub const JUDGE: u64 = 500_000;
    pub const GAME_OVER: u64 = 200_000;
}

/// Capacity of the channel behind each event subscription.
const EVENT_BUFFER: usize = 256;

/// The [Ledger] trait is the solver's view of the incentive layer, the file system and the
/// dispute resolution layer. Every state-changing method returns once the transaction has
/// been included.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// The account the solver signs with.
    fn account(&self) -> Address;

    async fn block_number(&self) -> Result<u64, LedgerError>;

    async fn task_info(&self, task_id: TaskId) -> Result<TaskInfo, LedgerError>;

    async fn solution_info(&self, task_id: TaskId) -> Result<SolutionInfo, LedgerError>;

    async fn deposit_of(&self, account: Address) -> Result<U256, LedgerError>;

    async fn make_deposit(&self, amount: U256) -> Result<(), LedgerError>;

    async fn register_for_task(&self, task_id: TaskId, secret_hash: H256)
        -> Result<(), LedgerError>;

    async fn commit_solution(
        &self,
        task_id: TaskId,
        commitment: &Commitment,
    ) -> Result<(), LedgerError>;

    async fn reveal_solution(
        &self,
        task_id: TaskId,
        first_is_real: bool,
        secret: H256,
    ) -> Result<(), LedgerError>;

    /// Code bytes stored onchain at `storage`.
    async fn code(&self, storage: H256) -> Result<Vec<u8>, LedgerError>;

    /// Content hash of the code stored offchain at `storage`.
    async fn ipfs_code(&self, storage: H256) -> Result<String, LedgerError>;

    /// Identifiers of the auxiliary files bundled with the code at `storage`.
    async fn files(&self, storage: H256) -> Result<Vec<H256>, LedgerError>;

    async fn file_name(&self, file: H256) -> Result<String, LedgerError>;

    async fn file_hash(&self, file: H256) -> Result<String, LedgerError>;

    /// The task a verification game disputes.
    async fn game_task(&self, game_id: GameId) -> Result<TaskId, LedgerError>;

    /// The bracket currently recorded for the game.
    async fn indices(&self, game_id: GameId) -> Result<(U256, U256), LedgerError>;

    /// The state hash reported for `step`.
    async fn state_at(&self, game_id: GameId, step: u64) -> Result<H256, LedgerError>;

    async fn initialize(
        &self,
        game_id: GameId,
        start: &VmSnapshot,
        total_steps: u64,
        end: &VmSnapshot,
    ) -> Result<(), LedgerError>;

    async fn report(
        &self,
        game_id: GameId,
        low: u64,
        high: u64,
        state: H256,
    ) -> Result<(), LedgerError>;

    async fn post_phases(
        &self,
        game_id: GameId,
        low: u64,
        states: [H256; PHASE_STATE_COUNT],
    ) -> Result<(), LedgerError>;

    async fn call_judge(
        &self,
        game_id: GameId,
        low: u64,
        proof: &JudgeProof,
    ) -> Result<(), LedgerError>;

    async fn call_custom_judge(
        &self,
        game_id: GameId,
        low: u64,
        proof: &CustomJudgeProof,
    ) -> Result<(), LedgerError>;

    /// Returns true if `gameOver` would succeed now. Does not send a transaction.
    async fn game_over_ready(&self, game_id: GameId) -> Result<bool, LedgerError>;

    async fn game_over(&self, game_id: GameId) -> Result<(), LedgerError>;
}

/// The [EventSource] trait delivers typed ledger events, one channel per [EventKind].
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Subscribes to events of `kind`. The subscription ends when the receiver is dropped.
    async fn subscribe(&self, kind: EventKind)
        -> Result<mpsc::Receiver<LedgerEvent>, LedgerError>;
}

/// Converts a contract error into a [LedgerError].
fn classify<M: Middleware>(op: &str, err: ContractError<M>) -> LedgerError {
    if err.is_revert() {
        return LedgerError::Reverted(format!("{op}: {err}"));
    }
    match err {
        ContractError::DecodingError(_)
        | ContractError::DetokenizationError(_)
        | ContractError::AbiError(_) => LedgerError::Decode(format!("{op}: {err}")),
        _ => LedgerError::Transient(format!("{op}: {err}")),
    }
}

fn words(list: &[H256]) -> Vec<[u8; 32]> {
    list.iter().map(|h| h.0).collect()
}

/// Decodes a raw log of the given kind into a [LedgerEvent].
fn decode_event(kind: EventKind, log: Log) -> Result<LedgerEvent, LedgerError> {
    let decode_err = |e: ethers::abi::Error| LedgerError::Decode(format!("{kind:?} log: {e}"));
    let event = match kind {
        EventKind::TaskCreated => {
            let e: TaskCreatedFilter = parse_log(log).map_err(decode_err)?;
            LedgerEvent::TaskCreated {
                task_id: e.id,
                deposit: e.deposit,
            }
        }
        EventKind::SolverSelected => {
            let e: SolverSelectedFilter = parse_log(log).map_err(decode_err)?;
            LedgerEvent::SolverSelected {
                task_id: e.task,
                solver: e.solver,
            }
        }
        EventKind::TaskStateChange => {
            let e: TaskStateChangeFilter = parse_log(log).map_err(decode_err)?;
            LedgerEvent::TaskStateChange {
                task_id: e.task,
                state: e.state,
            }
        }
        EventKind::StartChallenge => {
            let e: StartChallengeFilter = parse_log(log).map_err(decode_err)?;
            LedgerEvent::StartChallenge {
                game_id: H256::from(e.uniq),
                solver: e.p,
            }
        }
        EventKind::Queried => {
            let e: QueriedFilter = parse_log(log).map_err(decode_err)?;
            LedgerEvent::Queried {
                game_id: H256::from(e.id),
                low: e.low,
                high: e.high,
            }
        }
        EventKind::SelectedPhase => {
            let e: SelectedPhaseFilter = parse_log(log).map_err(decode_err)?;
            LedgerEvent::SelectedPhase {
                game_id: H256::from(e.id),
                low: e.low,
                phase: e.phase,
            }
        }
    };
    Ok(event)
}

/// The [EthersLedger] talks to the three protocol contracts through a websocket signer.
#[derive(Debug, Clone)]
pub struct EthersLedger {
    client: Arc<SignerMiddlewareWS>,
    incentive: IncentiveLayer<SignerMiddlewareWS>,
    file_system: FileSystem<SignerMiddlewareWS>,
    interactive: Interactive<SignerMiddlewareWS>,
}

impl EthersLedger {
    /// Creates a new [EthersLedger].
    ///
    /// ### Takes
    /// - `client`: The signing websocket client.
    /// - `incentive_layer`: The address of the `IncentiveLayer` contract.
    /// - `file_system`: The address of the `FileSystem` contract.
    /// - `interactive`: The address of the `Interactive` dispute resolution contract.
    pub fn new(
        client: Arc<SignerMiddlewareWS>,
        incentive_layer: Address,
        file_system: Address,
        interactive: Address,
    ) -> Self {
        Self {
            incentive: IncentiveLayer::new(incentive_layer, Arc::clone(&client)),
            file_system: FileSystem::new(file_system, Arc::clone(&client)),
            interactive: Interactive::new(interactive, Arc::clone(&client)),
            client,
        }
    }

    async fn read<D: Detokenize>(
        op: &str,
        call: ContractCall<SignerMiddlewareWS, D>,
    ) -> Result<D, LedgerError> {
        call.call().await.map_err(|e| classify(op, e))
    }

    /// Sends `call` with a fixed gas budget and waits for its receipt.
    async fn send<D: Detokenize>(
        op: &str,
        call: ContractCall<SignerMiddlewareWS, D>,
        gas: u64,
    ) -> Result<(), LedgerError> {
        let call = call.gas(gas);
        let pending = call.send().await.map_err(|e| classify(op, e))?;
        let tx_hash = pending.tx_hash();
        tracing::debug!(target: "ledger", "Sent `{}` in transaction {:?}", op, tx_hash);

        let receipt = pending
            .await
            .map_err(|e| LedgerError::Transient(format!("{op}: {e}")))?
            .ok_or_else(|| {
                LedgerError::Transient(format!("{op}: transaction {tx_hash:?} was dropped"))
            })?;
        if receipt.status == Some(U64::from(1)) {
            Ok(())
        } else {
            Err(LedgerError::Reverted(format!(
                "{op}: transaction {tx_hash:?} failed"
            )))
        }
    }
}

#[async_trait]
impl Ledger for EthersLedger {
    fn account(&self) -> Address {
        self.client.address()
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.client
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| LedgerError::Transient(format!("eth_blockNumber: {e}")))
    }

    async fn task_info(&self, task_id: TaskId) -> Result<TaskInfo, LedgerError> {
        let (giver, init_task_hash, code_type, code_storage, storage_address) =
            Self::read("getTaskInfo", self.incentive.get_task_info(task_id)).await?;
        Ok(TaskInfo {
            giver,
            init_task_hash: H256::from(init_task_hash),
            code_type: CodeType::try_from(code_type)?,
            code_storage: StorageType::try_from(code_storage)?,
            storage_address: H256::from(storage_address),
        })
    }

    async fn solution_info(&self, task_id: TaskId) -> Result<SolutionInfo, LedgerError> {
        let (_, solution_hash0, solution_hash1, _, _, _, _, solver) =
            Self::read("solutionInfo", self.incentive.solution_info(task_id)).await?;
        Ok(SolutionInfo {
            solver,
            solution_hash0: H256::from(solution_hash0),
            solution_hash1: H256::from(solution_hash1),
        })
    }

    async fn deposit_of(&self, account: Address) -> Result<U256, LedgerError> {
        Self::read("getDeposit", self.incentive.get_deposit(account)).await
    }

    async fn make_deposit(&self, amount: U256) -> Result<(), LedgerError> {
        Self::send(
            "makeDeposit",
            self.incentive.make_deposit().value(amount),
            gas::DEPOSIT,
        )
        .await
    }

    async fn register_for_task(
        &self,
        task_id: TaskId,
        secret_hash: H256,
    ) -> Result<(), LedgerError> {
        Self::send(
            "registerForTask",
            self.incentive.register_for_task(task_id, secret_hash.0),
            gas::REGISTER,
        )
        .await
    }

    async fn commit_solution(
        &self,
        task_id: TaskId,
        commitment: &Commitment,
    ) -> Result<(), LedgerError> {
        Self::send(
            "commitSolution",
            self.incentive
                .commit_solution(task_id, commitment.first.0, commitment.second.0),
            gas::COMMIT,
        )
        .await
    }

    async fn reveal_solution(
        &self,
        task_id: TaskId,
        first_is_real: bool,
        secret: H256,
    ) -> Result<(), LedgerError> {
        Self::send(
            "revealSolution",
            self.incentive.reveal_solution(
                task_id,
                first_is_real,
                U256::from_big_endian(secret.as_bytes()),
            ),
            gas::REVEAL,
        )
        .await
    }

    async fn code(&self, storage: H256) -> Result<Vec<u8>, LedgerError> {
        Self::read("getCode", self.file_system.get_code(storage.0))
            .await
            .map(|b| b.to_vec())
    }

    async fn ipfs_code(&self, storage: H256) -> Result<String, LedgerError> {
        Self::read("getIPFSCode", self.file_system.get_ipfs_code(storage.0)).await
    }

    async fn files(&self, storage: H256) -> Result<Vec<H256>, LedgerError> {
        Self::read("getFiles", self.file_system.get_files(storage.0))
            .await
            .map(|ids| ids.into_iter().map(H256::from).collect())
    }

    async fn file_name(&self, file: H256) -> Result<String, LedgerError> {
        Self::read("getName", self.file_system.get_name(file.0)).await
    }

    async fn file_hash(&self, file: H256) -> Result<String, LedgerError> {
        Self::read("getHash", self.file_system.get_hash(file.0)).await
    }

    async fn game_task(&self, game_id: GameId) -> Result<TaskId, LedgerError> {
        Self::read("getTask", self.interactive.get_task(game_id.0)).await
    }

    async fn indices(&self, game_id: GameId) -> Result<(U256, U256), LedgerError> {
        Self::read("getIndices", self.interactive.get_indices(game_id.0)).await
    }

    async fn state_at(&self, game_id: GameId, step: u64) -> Result<H256, LedgerError> {
        Self::read(
            "getStateAt",
            self.interactive.get_state_at(game_id.0, U256::from(step)),
        )
        .await
        .map(H256::from)
    }

    async fn initialize(
        &self,
        game_id: GameId,
        start: &VmSnapshot,
        total_steps: u64,
        end: &VmSnapshot,
    ) -> Result<(), LedgerError> {
        Self::send(
            "initialize",
            self.interactive.initialize(
                game_id.0,
                start.roots().map(|h| h.0),
                start.pointers(),
                U256::from(total_steps),
                end.roots().map(|h| h.0),
                end.pointers(),
            ),
            gas::INITIALIZE,
        )
        .await
    }

    async fn report(
        &self,
        game_id: GameId,
        low: u64,
        high: u64,
        state: H256,
    ) -> Result<(), LedgerError> {
        Self::send(
            "report",
            self.interactive.report(
                game_id.0,
                U256::from(low),
                U256::from(high),
                vec![state.0],
            ),
            gas::REPORT,
        )
        .await
    }

    async fn post_phases(
        &self,
        game_id: GameId,
        low: u64,
        states: [H256; PHASE_STATE_COUNT],
    ) -> Result<(), LedgerError> {
        Self::send(
            "postPhases",
            self.interactive
                .post_phases(game_id.0, U256::from(low), states.map(|h| h.0)),
            gas::POST_PHASES,
        )
        .await
    }

    async fn call_judge(
        &self,
        game_id: GameId,
        low: u64,
        proof: &JudgeProof,
    ) -> Result<(), LedgerError> {
        Self::send(
            "callJudge",
            self.interactive.call_judge(
                game_id.0,
                U256::from(low),
                U256::from(proof.phase as u8),
                words(&proof.merkle),
                words(&proof.merkle2),
                proof.vm_hash.0,
                proof.op.0,
                proof.registers,
                proof.roots.map(|h| h.0),
                proof.pointers,
            ),
            gas::JUDGE,
        )
        .await
    }

    async fn call_custom_judge(
        &self,
        game_id: GameId,
        low: u64,
        proof: &CustomJudgeProof,
    ) -> Result<(), LedgerError> {
        Self::send(
            "callCustomJudge",
            self.interactive.call_custom_judge(
                game_id.0,
                U256::from(low),
                proof.op.0,
                proof.registers,
                proof.result_state.0,
                proof.result_size,
                words(&proof.merkle),
                proof.roots.map(|h| h.0),
                proof.pointers,
            ),
            gas::JUDGE,
        )
        .await
    }

    async fn game_over_ready(&self, game_id: GameId) -> Result<bool, LedgerError> {
        match Self::read("gameOver", self.interactive.game_over(game_id.0)).await {
            Ok(ready) => Ok(ready),
            // The static call reverts while the game is still running.
            Err(LedgerError::Reverted(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn game_over(&self, game_id: GameId) -> Result<(), LedgerError> {
        Self::send(
            "gameOver",
            self.interactive.game_over(game_id.0),
            gas::GAME_OVER,
        )
        .await
    }
}

#[async_trait]
impl EventSource for EthersLedger {
    async fn subscribe(
        &self,
        kind: EventKind,
    ) -> Result<mpsc::Receiver<LedgerEvent>, LedgerError> {
        let filter = match kind {
            EventKind::TaskCreated => self.incentive.task_created_filter().filter,
            EventKind::SolverSelected => self.incentive.solver_selected_filter().filter,
            EventKind::TaskStateChange => self.incentive.task_state_change_filter().filter,
            EventKind::StartChallenge => self.interactive.start_challenge_filter().filter,
            EventKind::Queried => self.interactive.queried_filter().filter,
            EventKind::SelectedPhase => self.interactive.selected_phase_filter().filter,
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let client = Arc::clone(&self.client);

        tokio::spawn(async move {
            let mut stream = match client.subscribe_logs(&filter).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(LedgerError::Transient(format!(
                        "eth_subscribe {kind:?}: {e}"
                    ))));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    log = stream.next() => {
                        let Some(log) = log else {
                            tracing::warn!(target: "ledger", "{:?} subscription closed by the node", kind);
                            break;
                        };
                        match decode_event(kind, log) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(target: "ledger", "Skipping undecodable log: {}", e),
                        }
                    }
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| LedgerError::Transient(format!("{kind:?} subscription task exited")))??;
        Ok(rx)
    }
}
