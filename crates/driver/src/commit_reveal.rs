//! The `commit_reveal` module contains the [CommitRevealController], which takes tasks, solves
//! them, commits a disguised solution and reveals it when asked.

use crate::{
    engine::{BundleFile, CodeBundle, CODE_FILE_NAME},
    error::{LedgerError, MissingState, SolverError},
    state::Task,
    store::TaskRecord,
    types::{StorageType, TaskId, TaskInfo, TASK_STATE_REVEAL},
    SolverContext,
};
use ethers::types::{Address, U256};
use std::sync::Arc;
use wasm_solver_games::verification::{generate_secret, secret_commitment, Commitment};

/// The [TaskSelector] trait decides which unclaimed tasks the solver registers for.
pub trait TaskSelector: Send + Sync {
    fn accept(&self, task_id: TaskId, info: &TaskInfo, deposit: U256) -> bool;
}

/// A [TaskSelector] that accepts every task.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TaskSelector for AcceptAll {
    fn accept(&self, _: TaskId, _: &TaskInfo, _: U256) -> bool {
        true
    }
}

/// The [CommitRevealController] drives a task from registration to reveal.
pub struct CommitRevealController {
    ctx: Arc<SolverContext>,
    selector: Arc<dyn TaskSelector>,
}

impl CommitRevealController {
    pub fn new(ctx: Arc<SolverContext>, selector: Arc<dyn TaskSelector>) -> Self {
        Self { ctx, selector }
    }

    /// Writes the durable part of the task to the store. A failed write is logged; the task
    /// can still complete in this process.
    async fn persist(&self, task_id: TaskId) {
        let Some(record) = self
            .ctx
            .registry
            .update(task_id, |task| TaskRecord::from(&*task))
            .await
        else {
            return;
        };
        if let Err(e) = self.ctx.store.save(&record).await {
            tracing::warn!(target: "commit-reveal", %task_id, "Could not persist task: {:#}", e);
        }
    }

    /// Returns the task from the registry, restoring it from the store if this process has
    /// not seen it.
    async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>, SolverError> {
        if let Some(task) = self.ctx.registry.task(task_id).await {
            return Ok(Some(task));
        }
        let record = self.ctx.store.load(task_id).await.map_err(|e| {
            SolverError::Fatal(format!("could not read task {task_id} from the store: {e:#}"))
        })?;
        let Some(record) = record else {
            return Ok(None);
        };
        tracing::info!(target: "commit-reveal", %task_id, "Restored task from the store.");
        self.ctx.registry.register(Task::from(record)).await;
        Ok(self.ctx.registry.task(task_id).await)
    }

    /// Handles `TaskCreated`: registers for the task if it is unclaimed and selected.
    pub async fn on_task_created(&self, task_id: TaskId, deposit: U256) -> Result<(), SolverError> {
        let ledger = &*self.ctx.ledger;
        let retry = &self.ctx.retry;

        let info = retry
            .read("getTaskInfo", move || ledger.task_info(task_id))
            .await?;
        let solution = retry
            .read("solutionInfo", move || ledger.solution_info(task_id))
            .await?;
        if solution.is_claimed() {
            tracing::debug!(target: "commit-reveal", %task_id, "Task already claimed by {:?}.", solution.solver);
            return Ok(());
        }
        if !self.selector.accept(task_id, &info, deposit) {
            tracing::debug!(target: "commit-reveal", %task_id, "Task not selected.");
            return Ok(());
        }

        let secret = self.ctx.with_rng(|rng| generate_secret(rng));
        let mut task = Task::new(task_id, secret, deposit);
        task.info = Some(info);
        let secret_hash = task.secret_commitment;
        if !self.ctx.registry.register(task).await {
            tracing::debug!(target: "commit-reveal", %task_id, "Already registered, ignoring duplicate event.");
            return Ok(());
        }
        // The secret must be durable before the registration can land.
        self.persist(task_id).await;

        let account = ledger.account();
        let registered = retry
            .submit(
                "registerForTask",
                move || async move {
                    Ok::<_, LedgerError>(ledger.solution_info(task_id).await?.solver == account)
                },
                move || ledger.register_for_task(task_id, secret_hash),
            )
            .await;
        if let Err(e) = registered {
            self.ctx.registry.remove(task_id).await;
            return Err(e);
        }

        tracing::info!(target: "commit-reveal", %task_id, "Registered for task.");
        Ok(())
    }

    /// Handles `SolverSelected`: when this account was selected, solves the task and commits
    /// the solution next to a decoy.
    pub async fn on_solver_selected(
        &self,
        task_id: TaskId,
        solver: Address,
    ) -> Result<(), SolverError> {
        if solver != self.ctx.ledger.account() {
            return Ok(());
        }

        if self.find_task(task_id).await?.is_none() {
            return Err(SolverError::MissingState(MissingState::Task(task_id)));
        }
        let claimed = self
            .ctx
            .registry
            .update(task_id, |task| {
                if task.solving || task.real_slot.is_some() {
                    false
                } else {
                    task.solving = true;
                    true
                }
            })
            .await
            .unwrap_or(false);
        if !claimed {
            tracing::debug!(target: "commit-reveal", %task_id, "Solution already committed or in progress.");
            return Ok(());
        }

        let result = self.solve_and_commit(task_id).await;
        if result.is_err() {
            self.ctx
                .registry
                .update(task_id, |task| task.solving = false)
                .await;
        }
        result
    }

    async fn solve_and_commit(&self, task_id: TaskId) -> Result<(), SolverError> {
        let ledger = &*self.ctx.ledger;
        let retry = &self.ctx.retry;
        let task = self
            .ctx
            .registry
            .task(task_id)
            .await
            .ok_or(SolverError::MissingState(MissingState::Task(task_id)))?;

        let info = match task.info {
            Some(info) => info,
            None => {
                retry
                    .read("getTaskInfo", move || ledger.task_info(task_id))
                    .await?
            }
        };

        self.ensure_deposit(task.min_deposit).await?;
        tracing::info!(target: "commit-reveal", %task_id, "Solving task.");

        let bundle = self.resolve_bundle(&info).await?;
        let engine = &*self.ctx.engine;
        let vm = retry
            .read("setupVM", move || engine.prepare(task_id, bundle.clone()))
            .await?;
        let task_vm = &*vm;
        let solution = retry
            .read_within(
                "executeWasmTask",
                self.ctx.config.retry.execution_timeout,
                move || task_vm.execute(),
            )
            .await?;
        tracing::info!(target: "commit-reveal", %task_id, steps = solution.steps, "Executed task.");

        let commitment = self.ctx.with_rng(|rng| Commitment::new(solution.hash, rng));
        self.ctx
            .registry
            .update(task_id, |task| {
                task.info = Some(info);
                task.solution = Some(solution);
                task.vm = Some(vm);
            })
            .await;

        let committed = &commitment;
        retry
            .submit(
                "commitSolution",
                move || async move {
                    let onchain = ledger.solution_info(task_id).await?;
                    Ok::<_, LedgerError>(
                        onchain.solution_hash0 == commitment.first
                            && onchain.solution_hash1 == commitment.second,
                    )
                },
                move || ledger.commit_solution(task_id, committed),
            )
            .await?;

        // The real slot is only known to be committed once the commitment landed.
        self.ctx
            .registry
            .update(task_id, |task| {
                task.solving = false;
                task.real_slot = Some(commitment.real);
            })
            .await;
        self.persist(task_id).await;

        tracing::info!(target: "commit-reveal", %task_id, "Submitted solution.");
        Ok(())
    }

    /// Tops the account's deposit up to `min_deposit`.
    async fn ensure_deposit(&self, min_deposit: U256) -> Result<(), SolverError> {
        let ledger = &*self.ctx.ledger;
        let account = ledger.account();
        let current = self
            .ctx
            .retry
            .read("getDeposit", move || ledger.deposit_of(account))
            .await?;
        if current >= min_deposit {
            return Ok(());
        }

        let top_up = min_deposit - current;
        tracing::info!(target: "commit-reveal", "Depositing {} to cover the task's minimum deposit.", top_up);
        self.ctx
            .retry
            .submit(
                "makeDeposit",
                move || async move {
                    Ok::<_, LedgerError>(ledger.deposit_of(account).await? >= min_deposit)
                },
                move || ledger.make_deposit(top_up),
            )
            .await
    }

    /// Fetches the code and auxiliary files of a task.
    async fn resolve_bundle(&self, info: &TaskInfo) -> Result<CodeBundle, SolverError> {
        let ledger = &*self.ctx.ledger;
        let content = &*self.ctx.content;
        let retry = &self.ctx.retry;
        let storage = info.storage_address;

        let (code, files) = match info.code_storage {
            StorageType::Blockchain => {
                let code = retry.read("getCode", move || ledger.code(storage)).await?;
                (code, Vec::new())
            }
            StorageType::Ipfs => {
                let hash = retry
                    .read("getIPFSCode", move || ledger.ipfs_code(storage))
                    .await?;
                let hash = hash.as_str();
                let code = retry
                    .read("download", move || content.download(hash, CODE_FILE_NAME))
                    .await?;

                let ids = retry.read("getFiles", move || ledger.files(storage)).await?;
                let mut files = Vec::with_capacity(ids.len());
                for id in ids {
                    let name = retry.read("getName", move || ledger.file_name(id)).await?;
                    let file_hash = retry.read("getHash", move || ledger.file_hash(id)).await?;
                    let (file_hash, file_name) = (file_hash.as_str(), name.as_str());
                    let data = retry
                        .read("download", move || content.download(file_hash, file_name))
                        .await?;
                    files.push(BundleFile { name, data });
                }
                (code, files)
            }
        };

        Ok(CodeBundle {
            code,
            code_type: info.code_type,
            files,
        })
    }

    /// Handles `TaskStateChange`: once the task reaches the reveal state, reveals the secret
    /// and the real commitment slot.
    pub async fn on_task_state_change(
        &self,
        task_id: TaskId,
        state: U256,
    ) -> Result<(), SolverError> {
        if state != U256::from(TASK_STATE_REVEAL) {
            return Ok(());
        }
        let Some(task) = self.find_task(task_id).await? else {
            // Every task changes state; most are not ours.
            tracing::debug!(target: "commit-reveal", %task_id, "Ignoring reveal request for unknown task.");
            return Ok(());
        };
        let Some(slot) = task.real_slot else {
            tracing::warn!(target: "commit-reveal", %task_id, "Reveal requested before a solution was committed.");
            return Ok(());
        };
        if secret_commitment(&task.secret) != task.secret_commitment {
            return Err(SolverError::Fatal(format!(
                "secret of task {task_id} does not match its registered commitment"
            )));
        }

        let claimed = self
            .ctx
            .registry
            .update(task_id, |task| !std::mem::replace(&mut task.revealed, true))
            .await
            .unwrap_or(false);
        if !claimed {
            tracing::debug!(target: "commit-reveal", %task_id, "Solution already revealed.");
            return Ok(());
        }

        let ledger = &*self.ctx.ledger;
        let revealed = self
            .ctx
            .retry
            .submit_once("revealSolution", move || {
                ledger.reveal_solution(task_id, slot.first_is_real(), task.secret)
            })
            .await;
        if let Err(e) = revealed {
            self.ctx
                .registry
                .update(task_id, |task| task.revealed = false)
                .await;
            return Err(e);
        }
        self.persist(task_id).await;

        tracing::info!(target: "commit-reveal", %task_id, first_is_real = slot.first_is_real(), "Revealed solution.");
        Ok(())
    }
}
