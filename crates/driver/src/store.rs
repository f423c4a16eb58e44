//! The `store` module contains the [TaskStore] persistence boundary, which keeps the secrets of
//! registered tasks across restarts.

use crate::{
    state::Task,
    types::{TaskId, TaskInfo},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{H256, U256};
use postgres::{Client, NoTls};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use wasm_solver_games::verification::SolutionSlot;

/// The durable part of a [Task].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub secret: H256,
    pub secret_commitment: H256,
    pub min_deposit: U256,
    pub info: Option<TaskInfo>,
    pub real_slot: Option<SolutionSlot>,
    pub revealed: bool,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            secret: task.secret,
            secret_commitment: task.secret_commitment,
            min_deposit: task.min_deposit,
            info: task.info.clone(),
            real_slot: task.real_slot,
            revealed: task.revealed,
        }
    }
}

impl From<TaskRecord> for Task {
    fn from(record: TaskRecord) -> Self {
        Self {
            id: record.task_id,
            secret: record.secret,
            secret_commitment: record.secret_commitment,
            min_deposit: record.min_deposit,
            info: record.info,
            solution: None,
            real_slot: record.real_slot,
            solving: false,
            revealed: record.revealed,
            vm: None,
        }
    }
}

/// The [TaskStore] trait persists [TaskRecord]s keyed by task id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts or replaces the record of `record.task_id`.
    async fn save(&self, record: &TaskRecord) -> Result<()>;

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskRecord>>;
}

/// A [TaskStore] that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: tokio::sync::Mutex<HashMap<TaskId, TaskRecord>>,
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.task_id, record.clone());
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.records.lock().await.get(&task_id).cloned())
    }
}

/// A [TaskStore] backed by a postgres table of JSON records.
pub struct PostgresStore {
    client: Arc<Mutex<Client>>,
}

impl PostgresStore {
    /// Connects to `url` and creates the `solver_tasks` table if needed.
    pub async fn connect(url: String) -> Result<Self> {
        let client = tokio::task::spawn_blocking(move || -> Result<Client> {
            let mut client = Client::connect(&url, NoTls)?;
            client.batch_execute(
                "CREATE TABLE IF NOT EXISTS solver_tasks (
                    task_id TEXT PRIMARY KEY,
                    record  TEXT NOT NULL
                )",
            )?;
            Ok(client)
        })
        .await??;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Runs `f` against the client on the blocking pool.
    async fn with_client<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Client) -> Result<T> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut client = client.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut client)
        })
        .await
        .map_err(|e| anyhow!("store task panicked: {e}"))?
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        let key = record.task_id.to_string();
        let json = serde_json::to_string(record)?;
        self.with_client(move |client| {
            client.execute(
                "INSERT INTO solver_tasks (task_id, record) VALUES ($1, $2)
                 ON CONFLICT (task_id) DO UPDATE SET record = EXCLUDED.record",
                &[&key, &json],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let key = task_id.to_string();
        let json: Option<String> = self
            .with_client(move |client| {
                Ok(client
                    .query_opt("SELECT record FROM solver_tasks WHERE task_id = $1", &[&key])?
                    .map(|row| row.get(0)))
            })
            .await?;
        json.map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }
}
