//! The game module holds the [VerificationGame] trait and the [BisectionGame], the solver's
//! local copy of an onchain verification game.

use super::{Bracket, GameError, GameId, Phase, Response, TaskId};
use serde::{Deserialize, Serialize};

/// The [VerificationGame] trait defines the interface for a local copy of an onchain
/// verification game in which the solver defends its solution.
pub trait VerificationGame {
    /// Mark the game as initialized onchain and answer the implied first query over the full
    /// bracket.
    ///
    /// ### Returns
    /// - `Ok(Response)`: The response to the implied first query.
    /// - `Err(GameError)`: The game was already initialized.
    fn initialize(&mut self) -> Result<Response, GameError>;

    /// Respond to a `Queried` event carrying the bracket `[low, high]` chosen by the challenger.
    ///
    /// ### Takes
    /// - `low`: The lower bound of the queried bracket.
    /// - `high`: The upper bound of the queried bracket.
    ///
    /// ### Returns
    /// - `Ok(Response)`: A report, the phase posting, or nothing for a redelivered query whose
    ///   answer already landed.
    /// - `Err(GameError)`: The query does not follow from the previous bracket.
    fn on_query(&mut self, low: u64, high: u64) -> Result<Response, GameError>;

    /// Respond to a `SelectedPhase` event naming the phase the challenger wants judged.
    ///
    /// ### Takes
    /// - `low`: The step the phase belongs to.
    /// - `phase`: The selected phase.
    ///
    /// ### Returns
    /// - `Ok(Response)`: The judge call to make.
    /// - `Err(GameError)`: Phases were not posted, or were posted for a different step.
    fn on_phase_selected(&mut self, low: u64, phase: Phase) -> Result<Response, GameError>;
}

/// The lifecycle of a [BisectionGame].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameStatus {
    Uninitialized,
    Initialized,
    Narrowing,
    FinalReached,
    PhasesPosted,
    JudgeResolved,
    TimedOut,
    /// A protocol violation was observed; no further moves are made.
    Abandoned,
}

impl GameStatus {
    /// Returns true if no further moves will be made in the game.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GameStatus::JudgeResolved | GameStatus::TimedOut | GameStatus::Abandoned
        )
    }
}

/// A struct containing the solver's view of a verification game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectionGame {
    /// The identifier of the game on the dispute resolution layer.
    pub game_id: GameId,
    /// The task whose solution is disputed.
    pub task_id: TaskId,
    /// The upper bound of the initial bracket: the solution's step count plus one.
    pub total_steps: u64,
    /// The bracket still in dispute.
    bracket: Bracket,
    /// The current lifecycle state.
    status: GameStatus,
    /// Whether the report for `bracket` was accepted by the dispute resolution layer.
    answered: bool,
}

impl BisectionGame {
    /// Creates a new [BisectionGame] over the bracket `[0, total_steps]`.
    pub fn new(game_id: GameId, task_id: TaskId, total_steps: u64) -> Result<Self, GameError> {
        if total_steps == 0 {
            return Err(GameError::EmptyGame);
        }
        Ok(Self {
            game_id,
            task_id,
            total_steps,
            bracket: Bracket::new(0, total_steps, total_steps)?,
            status: GameStatus::Uninitialized,
            answered: false,
        })
    }

    /// Returns the bracket still in dispute.
    pub fn bracket(&self) -> Bracket {
        self.bracket
    }

    /// Returns the current lifecycle state.
    pub fn status(&self) -> GameStatus {
        self.status
    }

    /// Records that the report for the current bracket was accepted. A redelivered query for the
    /// same bracket is ignored from then on, and answered again until then.
    pub fn report_landed(&mut self) {
        if self.status == GameStatus::Narrowing {
            self.answered = true;
        }
    }

    /// Records that the phase states were accepted by the dispute resolution layer.
    pub fn phases_posted(&mut self) -> Result<(), GameError> {
        self.transition("phases_posted", &[GameStatus::FinalReached], GameStatus::PhasesPosted)
    }

    /// Records that the judge call was accepted, which resolves the game.
    pub fn judged(&mut self) -> Result<(), GameError> {
        self.transition("judged", &[GameStatus::PhasesPosted], GameStatus::JudgeResolved)
    }

    /// Records that the game was finalized after its confirmation window expired.
    pub fn timed_out(&mut self) -> Result<(), GameError> {
        if self.status.is_terminal() || self.status == GameStatus::Uninitialized {
            return Err(GameError::IllegalTransition {
                event: "timed_out",
                status: self.status,
            });
        }
        self.status = GameStatus::TimedOut;
        Ok(())
    }

    /// Stops all further moves in the game.
    pub fn abandon(&mut self) {
        self.status = GameStatus::Abandoned;
    }

    fn transition(
        &mut self,
        event: &'static str,
        from: &[GameStatus],
        to: GameStatus,
    ) -> Result<(), GameError> {
        if !from.contains(&self.status) {
            return Err(GameError::IllegalTransition {
                event,
                status: self.status,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Moves the game onto `bracket` and decides the move for it.
    fn narrow_to(&mut self, bracket: Bracket) -> Response {
        self.bracket = bracket;
        self.answered = false;
        if bracket.is_final() {
            self.status = GameStatus::FinalReached;
            Response::PostPhases { low: bracket.low }
        } else {
            self.status = GameStatus::Narrowing;
            Response::Report {
                low: bracket.low,
                high: bracket.high,
                step: bracket.midpoint(),
            }
        }
    }
}

impl VerificationGame for BisectionGame {
    fn initialize(&mut self) -> Result<Response, GameError> {
        self.transition("initialize", &[GameStatus::Uninitialized], GameStatus::Initialized)?;
        Ok(self.narrow_to(self.bracket))
    }

    fn on_query(&mut self, low: u64, high: u64) -> Result<Response, GameError> {
        let same_bracket = low == self.bracket.low && high == self.bracket.high;
        match self.status {
            GameStatus::Initialized | GameStatus::Narrowing => {}
            // The phase states did not land yet.
            GameStatus::FinalReached if same_bracket => {
                return Ok(Response::PostPhases { low });
            }
            GameStatus::PhasesPosted if same_bracket => return Ok(Response::DoNothing),
            status => {
                return Err(GameError::IllegalTransition {
                    event: "queried",
                    status,
                })
            }
        }

        let query = Bracket::new(low, high, self.total_steps)?;
        let previous = self.bracket;

        if query == previous {
            if self.answered {
                return Ok(Response::DoNothing);
            }
            return Ok(self.narrow_to(query));
        }
        // The challenger can only query a half once our report landed, seen or not.
        if !previous.is_half(&query) {
            return Err(GameError::OutOfOrderQuery {
                low,
                high,
                prev_low: previous.low,
                prev_high: previous.high,
            });
        }

        Ok(self.narrow_to(query))
    }

    fn on_phase_selected(&mut self, low: u64, phase: Phase) -> Result<Response, GameError> {
        if self.status != GameStatus::PhasesPosted {
            return Err(GameError::IllegalTransition {
                event: "selected_phase",
                status: self.status,
            });
        }
        if low != self.bracket.low {
            return Err(GameError::PhaseStepMismatch {
                expected: self.bracket.low,
                got: low,
            });
        }
        Ok(Response::Judge { low, phase })
    }
}
