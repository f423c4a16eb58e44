//! The state module holds the [Registry], the task and game tables shared between all
//! handlers.

use crate::{
    engine::{Solution, TaskVm},
    types::{GameId, TaskId, TaskInfo},
};
use ethers::types::{H256, U256};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use wasm_solver_games::verification::{secret_commitment, BisectionGame, SolutionSlot};

/// A task this solver has registered for.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Revealed together with the solution. Losing it forfeits the task.
    pub secret: H256,
    /// The hash of `secret` submitted with `registerForTask`.
    pub secret_commitment: H256,
    /// The minimum deposit announced with the task.
    pub min_deposit: U256,
    pub info: Option<TaskInfo>,
    pub solution: Option<Solution>,
    /// The commitment slot holding the real solution hash.
    pub real_slot: Option<SolutionSlot>,
    /// Set while the task is being solved.
    pub solving: bool,
    pub revealed: bool,
    /// The prepared virtual machine. Not restored after a restart.
    pub vm: Option<Arc<dyn TaskVm>>,
}

impl Task {
    /// Creates a new [Task] backed by `secret`.
    pub fn new(id: TaskId, secret: H256, min_deposit: U256) -> Self {
        Self {
            id,
            secret,
            secret_commitment: secret_commitment(&secret),
            min_deposit,
            info: None,
            solution: None,
            real_slot: None,
            solving: false,
            revealed: false,
            vm: None,
        }
    }
}

/// The [Registry] owns the task and game tables. Lock sections never span an await on a
/// collaborator.
#[derive(Debug, Default)]
pub struct Registry {
    tasks: Mutex<HashMap<TaskId, Task>>,
    games: Mutex<HashMap<GameId, BisectionGame>>,
}

impl Registry {
    /// Inserts `task` unless an entry for its id exists.
    ///
    /// ### Returns
    /// - `true`: The task was inserted.
    /// - `false`: The task was already registered; the registry is unchanged.
    pub async fn register(&self, task: Task) -> bool {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return false;
        }
        tasks.insert(task.id, task);
        true
    }

    /// Returns a snapshot of the task.
    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().await.get(&id).cloned()
    }

    /// Applies `f` to the task under the table lock.
    pub async fn update<T>(&self, id: TaskId, f: impl FnOnce(&mut Task) -> T) -> Option<T> {
        self.tasks.lock().await.get_mut(&id).map(f)
    }

    /// Removes the task. Used to release a registration that never landed.
    pub async fn remove(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().await.remove(&id)
    }

    /// Inserts `game` unless an entry for its id exists.
    pub async fn insert_game(&self, game: BisectionGame) -> bool {
        let mut games = self.games.lock().await;
        if games.contains_key(&game.game_id) {
            return false;
        }
        games.insert(game.game_id, game);
        true
    }

    /// Removes the game. Used to forget a game whose initialization never landed.
    pub async fn remove_game(&self, id: GameId) -> Option<BisectionGame> {
        self.games.lock().await.remove(&id)
    }

    /// Returns a snapshot of the game.
    pub async fn game(&self, id: GameId) -> Option<BisectionGame> {
        self.games.lock().await.get(&id).cloned()
    }

    /// Applies `f` to the game under the table lock.
    pub async fn update_game<T>(
        &self,
        id: GameId,
        f: impl FnOnce(&mut BisectionGame) -> T,
    ) -> Option<T> {
        self.games.lock().await.get_mut(&id).map(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn register_is_insert_if_absent() {
        let registry = Arc::new(Registry::default());
        let id = TaskId::from(3u64);

        let handles = (0..8u64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .register(Task::new(id, H256::from_low_u64_be(i), U256::zero()))
                        .await
                })
            })
            .collect::<Vec<_>>();
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);

        let task = registry.task(id).await.unwrap();
        assert_eq!(task.secret_commitment, secret_commitment(&task.secret));
    }

    #[tokio::test]
    async fn updates_apply_in_place() {
        let registry = Registry::default();
        let id = TaskId::from(5u64);
        assert!(registry.update(id, |t| t.revealed = true).await.is_none());

        registry
            .register(Task::new(id, H256::repeat_byte(9), U256::from(10)))
            .await;
        registry
            .update(id, |t| t.real_slot = Some(SolutionSlot::Second))
            .await
            .unwrap();
        assert_eq!(
            registry.task(id).await.unwrap().real_slot,
            Some(SolutionSlot::Second)
        );
    }

    #[tokio::test]
    async fn games_are_keyed_by_id() {
        let registry = Registry::default();
        let game_id = H256::repeat_byte(0xab);
        let game = BisectionGame::new(game_id, TaskId::from(1u64), 8).unwrap();
        assert!(registry.insert_game(game.clone()).await);
        assert!(!registry.insert_game(game).await);
        assert!(registry.game(H256::zero()).await.is_none());
        assert_eq!(registry.game(game_id).await.unwrap().total_steps, 8);

        assert!(registry.remove_game(game_id).await.is_some());
        assert!(registry.game(game_id).await.is_none());
        let game = BisectionGame::new(game_id, TaskId::from(1u64), 4).unwrap();
        assert!(registry.insert_game(game).await);
    }
}
