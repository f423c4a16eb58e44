//! The `engine` module contains the [ExecutionEngine] and [ContentStore] seams and their
//! production implementations: [OffchainInterpreter], which drives the wasm interpreter as a
//! child process, and [MountedContentStore].

use crate::{error::EngineError, types::CodeType, TaskId};
use async_trait::async_trait;
use ethers::types::H256;
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};
use tokio::process::Command;
use wasm_solver_games::verification::{serde_hex, StepTrace, VmSnapshot};

/// The name the code of a task is stored under in the work directory.
pub const CODE_FILE_NAME: &str = "task.wast";

/// The result of executing a task to completion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Solution {
    /// The hash committed to the incentive layer.
    #[serde(deserialize_with = "serde_hex::h256")]
    pub hash: H256,
    /// The number of execution steps.
    pub steps: u64,
    /// The machine state after the last step.
    pub vm: VmSnapshot,
}

/// The machine state before the first step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitialState {
    #[serde(deserialize_with = "serde_hex::h256")]
    pub hash: H256,
    pub vm: VmSnapshot,
}

/// An auxiliary input file of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Everything the engine needs to run a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBundle {
    pub code: Vec<u8>,
    pub code_type: CodeType,
    pub files: Vec<BundleFile>,
}

/// The [ExecutionEngine] trait prepares a task for execution.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Sets up the virtual machine for a task.
    async fn prepare(
        &self,
        task_id: TaskId,
        bundle: CodeBundle,
    ) -> Result<Arc<dyn TaskVm>, EngineError>;
}

/// The [TaskVm] trait queries a prepared task. Every call is deterministic.
#[async_trait]
pub trait TaskVm: Debug + Send + Sync {
    /// Runs the task to completion.
    async fn execute(&self) -> Result<Solution, EngineError>;

    /// Returns the state before the first step.
    async fn initial_state(&self) -> Result<InitialState, EngineError>;

    /// Returns the state hash after `step` steps.
    async fn location(&self, step: u64) -> Result<H256, EngineError>;

    /// Returns the phase breakdown of step `step`.
    async fn step(&self, step: u64) -> Result<StepTrace, EngineError>;
}

/// The [ContentStore] trait fetches content-addressed files.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn download(&self, hash: &str, name: &str) -> Result<Vec<u8>, EngineError>;
}

/// The [OffchainInterpreter] runs the wasm interpreter binary once per query, each task in its
/// own directory under `work_dir`.
#[derive(Debug, Clone)]
pub struct OffchainInterpreter {
    binary: PathBuf,
    work_dir: PathBuf,
}

impl OffchainInterpreter {
    pub fn new(binary: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl ExecutionEngine for OffchainInterpreter {
    async fn prepare(
        &self,
        task_id: TaskId,
        bundle: CodeBundle,
    ) -> Result<Arc<dyn TaskVm>, EngineError> {
        let dir = self.work_dir.join(format!("task-{task_id}"));
        tokio::fs::create_dir_all(&dir).await?;

        let code_file = match bundle.code_type {
            CodeType::Wast => CODE_FILE_NAME.to_string(),
            CodeType::Wasm => "task.wasm".to_string(),
        };
        tokio::fs::write(dir.join(&code_file), &bundle.code).await?;

        let mut files = Vec::with_capacity(bundle.files.len());
        for file in &bundle.files {
            // Names come from the ledger; keep them inside the task directory.
            let name = Path::new(&file.name)
                .file_name()
                .ok_or_else(|| EngineError::Output(format!("invalid file name `{}`", file.name)))?
                .to_string_lossy()
                .into_owned();
            tokio::fs::write(dir.join(&name), &file.data).await?;
            files.push(name);
        }

        tracing::debug!(target: "engine", "Prepared task {} in {}", task_id, dir.display());
        Ok(Arc::new(InterpreterVm {
            binary: self.binary.clone(),
            dir,
            code_file,
            files,
        }))
    }
}

/// A task prepared for the [OffchainInterpreter].
#[derive(Debug)]
struct InterpreterVm {
    binary: PathBuf,
    dir: PathBuf,
    code_file: String,
    files: Vec<String>,
}

impl InterpreterVm {
    /// Runs the interpreter with `mode` and parses its JSON output.
    async fn run<T: DeserializeOwned>(&self, mode: &[String]) -> Result<T, EngineError> {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&self.dir)
            .args(mode)
            .arg("-m")
            .arg("-file")
            .arg(&self.code_file);
        for file in &self.files {
            cmd.arg("-file").arg(file);
        }
        let output = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(EngineError::Process {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(EngineError::NoResult);
        }
        serde_json::from_str(stdout.trim()).map_err(|e| EngineError::Output(e.to_string()))
    }
}

#[async_trait]
impl TaskVm for InterpreterVm {
    async fn execute(&self) -> Result<Solution, EngineError> {
        self.run(&["-result".to_string()]).await
    }

    async fn initial_state(&self) -> Result<InitialState, EngineError> {
        self.run(&["-init".to_string()]).await
    }

    async fn location(&self, step: u64) -> Result<H256, EngineError> {
        let raw: String = self
            .run(&["-location".to_string(), step.to_string()])
            .await?;
        serde_hex::parse_h256(&raw).map_err(EngineError::Output)
    }

    async fn step(&self, step: u64) -> Result<StepTrace, EngineError> {
        self.run(&["-step".to_string(), step.to_string()]).await
    }
}

/// The [MountedContentStore] reads content-addressed files from a mounted store, where the
/// content of `hash` lives at `<root>/<hash>`.
#[derive(Debug, Clone)]
pub struct MountedContentStore {
    root: PathBuf,
}

impl MountedContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentStore for MountedContentStore {
    async fn download(&self, hash: &str, name: &str) -> Result<Vec<u8>, EngineError> {
        if hash.is_empty() || hash.contains(['/', '\\']) || hash.starts_with('.') {
            return Err(EngineError::Output(format!("invalid content hash `{hash}`")));
        }
        tracing::debug!(target: "engine", "Reading {} ({})", hash, name);
        Ok(tokio::fs::read(self.root.join(hash)).await?)
    }
}
