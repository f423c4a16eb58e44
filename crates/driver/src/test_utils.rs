//! Mock collaborators for the controller tests.

use crate::{
    engine::{CodeBundle, ContentStore, ExecutionEngine, InitialState, Solution, TaskVm},
    error::{EngineError, LedgerError},
    types::{EventKind, GameId, LedgerEvent, SolutionInfo, TaskId, TaskInfo},
    DriverConfig, EventSource, Ledger, MemoryStore, RetryConfig, RetryPolicy, SolverContext,
    TaskStore,
};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use wasm_solver_games::verification::{
    midpoint, Commitment, CustomJudgeProof, JudgeProof, MachineSnapshot, MerkleProof, Phase,
    PhaseProof, StepTrace, VmRef, VmSnapshot, CUSTOM_JUDGE_OPCODE, CUSTOM_JUDGE_OPCODE_OFFSET,
    PHASE_STATE_COUNT,
};

/// The account of the solver under test.
pub const SOLVER: Address = Address::repeat_byte(0xaa);

/// A state-changing call observed by the [MockLedger].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    MakeDeposit(U256),
    RegisterForTask(TaskId, H256),
    CommitSolution(TaskId, H256, H256),
    RevealSolution(TaskId, bool, H256),
    Initialize(GameId, u64),
    Report(GameId, u64, u64, H256),
    PostPhases(GameId, u64),
    CallJudge(GameId, u64, Phase),
    CallCustomJudge(GameId, u64),
    GameOver(GameId),
}

#[derive(Default)]
struct LedgerState {
    calls: Vec<Call>,
    block: u64,
    deposit: U256,
    task_info: HashMap<TaskId, TaskInfo>,
    solutions: HashMap<TaskId, SolutionInfo>,
    code: HashMap<H256, Vec<u8>>,
    ipfs_code: HashMap<H256, String>,
    files: HashMap<H256, Vec<H256>>,
    file_names: HashMap<H256, String>,
    file_hashes: HashMap<H256, String>,
    game_tasks: HashMap<GameId, TaskId>,
    indices: HashMap<GameId, (U256, U256)>,
    states: HashMap<(GameId, u64), H256>,
    game_over_ready: HashSet<GameId>,
    failures: HashMap<&'static str, VecDeque<LedgerError>>,
    senders: HashMap<EventKind, mpsc::Sender<LedgerEvent>>,
}

/// An in-memory ledger that records every state-changing call.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    fn with<T>(&self, f: impl FnOnce(&mut LedgerState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Pops the next scripted failure of `op`.
    fn check(&self, op: &'static str) -> Result<(), LedgerError> {
        self.with(|s| match s.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        })
    }

    fn record(&self, op: &'static str, call: Call) -> Result<(), LedgerError> {
        self.check(op)?;
        self.with(|s| s.calls.push(call));
        Ok(())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: LedgerError) {
        self.with(|s| s.failures.entry(op).or_default().push_back(err));
    }

    pub fn set_block(&self, block: u64) {
        self.with(|s| s.block = block);
    }

    pub fn set_deposit(&self, deposit: U256) {
        self.with(|s| s.deposit = deposit);
    }

    pub fn set_game_over_ready(&self, game_id: GameId, ready: bool) {
        self.with(|s| {
            if ready {
                s.game_over_ready.insert(game_id);
            } else {
                s.game_over_ready.remove(&game_id);
            }
        });
    }

    pub fn add_task(&self, task_id: TaskId, info: TaskInfo) {
        self.with(|s| s.task_info.insert(task_id, info));
    }

    pub fn set_solution_info(&self, task_id: TaskId, info: SolutionInfo) {
        self.with(|s| s.solutions.insert(task_id, info));
    }

    pub fn solution_info_of(&self, task_id: TaskId) -> SolutionInfo {
        self.with(|s| s.solutions.get(&task_id).cloned().unwrap_or_default())
    }

    pub fn set_code(&self, storage: H256, code: &[u8]) {
        self.with(|s| s.code.insert(storage, code.to_vec()));
    }

    pub fn set_ipfs_code(&self, storage: H256, hash: &str, files: &[(H256, &str, &str)]) {
        self.with(|s| {
            s.ipfs_code.insert(storage, hash.to_string());
            s.files
                .insert(storage, files.iter().map(|(id, _, _)| *id).collect());
            for (id, name, hash) in files {
                s.file_names.insert(*id, name.to_string());
                s.file_hashes.insert(*id, hash.to_string());
            }
        });
    }

    pub fn set_game_task(&self, game_id: GameId, task_id: TaskId) {
        self.with(|s| s.game_tasks.insert(game_id, task_id));
    }

    /// Marks the state at `step` of `game_id` as reported.
    pub fn set_state(&self, game_id: GameId, step: u64, state: H256) {
        self.with(|s| s.states.insert((game_id, step), state));
    }

    pub fn set_indices(&self, game_id: GameId, low: u64, high: u64) {
        self.with(|s| s.indices.insert(game_id, (low.into(), high.into())));
    }

    /// Delivers `event` to the subscriber of its kind.
    pub async fn emit(&self, event: LedgerEvent) {
        let sender = self.with(|s| s.senders.get(&event.kind()).cloned());
        if let Some(sender) = sender {
            sender.send(event).await.unwrap();
        }
    }

    /// Returns the number of open subscriptions.
    pub fn subscribers(&self) -> usize {
        self.with(|s| s.senders.len())
    }

    /// Ends the subscription of `kind`.
    pub fn close(&self, kind: EventKind) {
        self.with(|s| s.senders.remove(&kind));
    }
}

#[async_trait]
impl Ledger for MockLedger {
    fn account(&self) -> Address {
        SOLVER
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.check("eth_blockNumber")?;
        Ok(self.with(|s| s.block))
    }

    async fn task_info(&self, task_id: TaskId) -> Result<TaskInfo, LedgerError> {
        self.check("getTaskInfo")?;
        self.with(|s| s.task_info.get(&task_id).cloned())
            .ok_or_else(|| LedgerError::Reverted(format!("no task {task_id}")))
    }

    async fn solution_info(&self, task_id: TaskId) -> Result<SolutionInfo, LedgerError> {
        self.check("solutionInfo")?;
        Ok(self.solution_info_of(task_id))
    }

    async fn deposit_of(&self, _: Address) -> Result<U256, LedgerError> {
        self.check("getDeposit")?;
        Ok(self.with(|s| s.deposit))
    }

    async fn make_deposit(&self, amount: U256) -> Result<(), LedgerError> {
        self.record("makeDeposit", Call::MakeDeposit(amount))?;
        self.with(|s| s.deposit += amount);
        Ok(())
    }

    async fn register_for_task(
        &self,
        task_id: TaskId,
        secret_hash: H256,
    ) -> Result<(), LedgerError> {
        if self.solution_info_of(task_id).is_claimed() {
            return Err(LedgerError::Reverted("task already claimed".into()));
        }
        self.record("registerForTask", Call::RegisterForTask(task_id, secret_hash))?;
        self.with(|s| s.solutions.entry(task_id).or_default().solver = SOLVER);
        Ok(())
    }

    async fn commit_solution(
        &self,
        task_id: TaskId,
        commitment: &Commitment,
    ) -> Result<(), LedgerError> {
        self.record(
            "commitSolution",
            Call::CommitSolution(task_id, commitment.first, commitment.second),
        )?;
        self.with(|s| {
            let info = s.solutions.entry(task_id).or_default();
            info.solution_hash0 = commitment.first;
            info.solution_hash1 = commitment.second;
        });
        Ok(())
    }

    async fn reveal_solution(
        &self,
        task_id: TaskId,
        first_is_real: bool,
        secret: H256,
    ) -> Result<(), LedgerError> {
        self.record(
            "revealSolution",
            Call::RevealSolution(task_id, first_is_real, secret),
        )
    }

    async fn code(&self, storage: H256) -> Result<Vec<u8>, LedgerError> {
        self.check("getCode")?;
        Ok(self.with(|s| s.code.get(&storage).cloned().unwrap_or_default()))
    }

    async fn ipfs_code(&self, storage: H256) -> Result<String, LedgerError> {
        self.check("getIPFSCode")?;
        Ok(self.with(|s| s.ipfs_code.get(&storage).cloned().unwrap_or_default()))
    }

    async fn files(&self, storage: H256) -> Result<Vec<H256>, LedgerError> {
        self.check("getFiles")?;
        Ok(self.with(|s| s.files.get(&storage).cloned().unwrap_or_default()))
    }

    async fn file_name(&self, file: H256) -> Result<String, LedgerError> {
        self.check("getName")?;
        Ok(self.with(|s| s.file_names.get(&file).cloned().unwrap_or_default()))
    }

    async fn file_hash(&self, file: H256) -> Result<String, LedgerError> {
        self.check("getHash")?;
        Ok(self.with(|s| s.file_hashes.get(&file).cloned().unwrap_or_default()))
    }

    async fn game_task(&self, game_id: GameId) -> Result<TaskId, LedgerError> {
        self.check("getTask")?;
        self.with(|s| s.game_tasks.get(&game_id).copied())
            .ok_or_else(|| LedgerError::Reverted(format!("no game {game_id:?}")))
    }

    async fn indices(&self, game_id: GameId) -> Result<(U256, U256), LedgerError> {
        self.check("getIndices")?;
        Ok(self.with(|s| s.indices.get(&game_id).copied().unwrap_or_default()))
    }

    async fn state_at(&self, game_id: GameId, step: u64) -> Result<H256, LedgerError> {
        self.check("getStateAt")?;
        Ok(self.with(|s| s.states.get(&(game_id, step)).copied().unwrap_or_default()))
    }

    async fn initialize(
        &self,
        game_id: GameId,
        _: &VmSnapshot,
        total_steps: u64,
        _: &VmSnapshot,
    ) -> Result<(), LedgerError> {
        self.record("initialize", Call::Initialize(game_id, total_steps))?;
        self.set_indices(game_id, 0, total_steps);
        self.with(|s| s.states.insert((game_id, 0), MockVm::state_hash(0)));
        Ok(())
    }

    async fn report(
        &self,
        game_id: GameId,
        low: u64,
        high: u64,
        state: H256,
    ) -> Result<(), LedgerError> {
        self.record("report", Call::Report(game_id, low, high, state))?;
        self.with(|s| s.states.insert((game_id, midpoint(low, high)), state));
        Ok(())
    }

    async fn post_phases(
        &self,
        game_id: GameId,
        low: u64,
        _: [H256; PHASE_STATE_COUNT],
    ) -> Result<(), LedgerError> {
        self.record("postPhases", Call::PostPhases(game_id, low))
    }

    async fn call_judge(
        &self,
        game_id: GameId,
        low: u64,
        proof: &JudgeProof,
    ) -> Result<(), LedgerError> {
        self.record("callJudge", Call::CallJudge(game_id, low, proof.phase))
    }

    async fn call_custom_judge(
        &self,
        game_id: GameId,
        low: u64,
        _: &CustomJudgeProof,
    ) -> Result<(), LedgerError> {
        self.record("callCustomJudge", Call::CallCustomJudge(game_id, low))
    }

    async fn game_over_ready(&self, game_id: GameId) -> Result<bool, LedgerError> {
        self.check("gameOverReady")?;
        Ok(self.with(|s| s.game_over_ready.contains(&game_id)))
    }

    async fn game_over(&self, game_id: GameId) -> Result<(), LedgerError> {
        self.record("gameOver", Call::GameOver(game_id))?;
        self.set_game_over_ready(game_id, false);
        Ok(())
    }
}

#[async_trait]
impl EventSource for MockLedger {
    async fn subscribe(
        &self,
        kind: EventKind,
    ) -> Result<mpsc::Receiver<LedgerEvent>, LedgerError> {
        self.check("subscribe")?;
        let (tx, rx) = mpsc::channel(64);
        self.with(|s| s.senders.insert(kind, tx));
        Ok(rx)
    }
}

/// A deterministic virtual machine. The state after `n` steps hashes to `n + 1`.
#[derive(Debug)]
pub struct MockVm {
    pub steps: u64,
    /// Routes the write phase of every step to the custom judge.
    pub custom_op: bool,
    pub fail_execute: bool,
}

impl MockVm {
    pub fn state_hash(step: u64) -> H256 {
        H256::from_low_u64_be(step + 1)
    }

    pub fn solution_hash() -> H256 {
        H256::repeat_byte(0x5a)
    }

    fn trace(&self, step: u64) -> StepTrace {
        let mut states = vec![Self::state_hash(step)];
        states.extend((1..PHASE_STATE_COUNT - 1).map(|i| H256::repeat_byte(i as u8)));
        states.push(Self::state_hash(step + 1));

        let mut op = H256::repeat_byte(0x01);
        if self.custom_op {
            op.0[CUSTOM_JUDGE_OPCODE_OFFSET] = CUSTOM_JUDGE_OPCODE;
        }
        let proof = PhaseProof {
            location: Some(vec![H256::repeat_byte(0x0c)]),
            merkle: Some(MerkleProof {
                list: Some(vec![H256::repeat_byte(0x0d)]),
                result_state: Some(H256::repeat_byte(0x0e)),
                result_size: Some(U256::from(64)),
                ..Default::default()
            }),
            machine: Some(MachineSnapshot {
                op,
                ..MachineSnapshot::zero()
            }),
            vm: Some(VmRef::Full(VmSnapshot::zero())),
        };
        StepTrace {
            states,
            fetch: Some(proof.clone()),
            init: Some(proof.clone()),
            reg1: Some(proof.clone()),
            reg2: Some(proof.clone()),
            reg3: Some(proof.clone()),
            alu: Some(proof.clone()),
            write1: Some(proof.clone()),
            write2: Some(proof.clone()),
            pc: Some(proof.clone()),
            stack_ptr: Some(proof.clone()),
            call_ptr: Some(proof.clone()),
            memsize: Some(proof),
        }
    }
}

#[async_trait]
impl TaskVm for MockVm {
    async fn execute(&self) -> Result<Solution, EngineError> {
        if self.fail_execute {
            return Err(EngineError::NoResult);
        }
        Ok(Solution {
            hash: Self::solution_hash(),
            steps: self.steps,
            vm: VmSnapshot::zero(),
        })
    }

    async fn initial_state(&self) -> Result<InitialState, EngineError> {
        Ok(InitialState {
            hash: Self::state_hash(0),
            vm: VmSnapshot::zero(),
        })
    }

    async fn location(&self, step: u64) -> Result<H256, EngineError> {
        Ok(Self::state_hash(step))
    }

    async fn step(&self, step: u64) -> Result<StepTrace, EngineError> {
        Ok(self.trace(step))
    }
}

/// An engine handing out [MockVm]s and recording the prepared bundles.
#[derive(Default)]
pub struct MockEngine {
    pub steps: u64,
    pub custom_op: bool,
    pub fail_execute: bool,
    pub bundles: Mutex<Vec<CodeBundle>>,
}

impl MockEngine {
    pub fn new(steps: u64) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn vm(&self) -> Arc<dyn TaskVm> {
        Arc::new(MockVm {
            steps: self.steps,
            custom_op: self.custom_op,
            fail_execute: self.fail_execute,
        })
    }
}

#[async_trait]
impl ExecutionEngine for MockEngine {
    async fn prepare(
        &self,
        _: TaskId,
        bundle: CodeBundle,
    ) -> Result<Arc<dyn TaskVm>, EngineError> {
        self.bundles.lock().unwrap().push(bundle);
        Ok(self.vm())
    }
}

/// A content store serving fixed files.
#[derive(Default)]
pub struct MockContent {
    pub files: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl ContentStore for MockContent {
    async fn download(&self, hash: &str, _: &str) -> Result<Vec<u8>, EngineError> {
        self.files.get(hash).cloned().ok_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                hash.to_string(),
            ))
        })
    }
}

/// A [RetryPolicy] with millisecond backoff.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(fast_retry_config())
}

fn fast_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        call_timeout: Duration::from_secs(1),
        execution_timeout: Duration::from_secs(1),
    }
}

/// Builds a [SolverContext] over the mocks with a fixed random seed.
pub fn context(
    ledger: Arc<MockLedger>,
    engine: Arc<MockEngine>,
    content: MockContent,
) -> Arc<SolverContext> {
    context_with_store(ledger, engine, content, Arc::new(MemoryStore::default()))
}

/// Builds a [SolverContext] over the mocks that persists tasks to `store`.
pub fn context_with_store(
    ledger: Arc<MockLedger>,
    engine: Arc<MockEngine>,
    content: MockContent,
    store: Arc<dyn TaskStore>,
) -> Arc<SolverContext> {
    Arc::new(SolverContext::new(
        ledger,
        engine,
        Arc::new(content),
        store,
        DriverConfig {
            confirmation_blocks: 105,
            poll_interval: Duration::from_millis(1),
            retry: fast_retry_config(),
        },
        StdRng::seed_from_u64(7),
    ))
}

/// Polls `condition` until it holds. Panics after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in time");
}
