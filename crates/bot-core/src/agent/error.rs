use thiserror::Error;

/// Failures surfaced by the planning and execution state machine.
///
/// Oracle and world failures carry the collaborator's `anyhow::Error` as-is so the full
/// context chain survives up to the runner.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agenda is empty; nothing to plan")]
    EmptyAgenda,
    #[error("goal scoring exhausted after {attempts} attempts; missing scores for: {}", missing.join(", "))]
    ScoringExhausted { attempts: u32, missing: Vec<String> },
    #[error("action list unparseable after {attempts} attempts")]
    PlanUnparseable { attempts: u32 },
    #[error("refinement of step {step:?} failed after {attempts} attempts")]
    RefinementFailed { step: String, attempts: u32 },
    #[error("feasibility verdict unparseable after {attempts} attempts")]
    VerdictUnparseable { attempts: u32 },
    #[error("refinement budget of {budget} exceeded for goal {goal:?}")]
    RefinementBudgetExceeded { goal: String, budget: u32 },
    #[error("interrupted")]
    Interrupted,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("oracle request failed: {0:#}")]
    Oracle(anyhow::Error),
    #[error("world call failed: {0:#}")]
    World(anyhow::Error),
}

impl AgentError {
    /// Fatal errors end the planning loop; everything else abandons the current cycle only.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::EmptyAgenda | AgentError::ScoringExhausted { .. } | AgentError::Config(_)
        )
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_planner_and_config_errors_are_fatal() {
        assert!(AgentError::EmptyAgenda.is_fatal());
        assert!(
            AgentError::ScoringExhausted {
                attempts: 3,
                missing: vec!["chop wood".to_string()],
            }
            .is_fatal()
        );
        assert!(AgentError::Config("name".to_string()).is_fatal());
        assert!(!AgentError::PlanUnparseable { attempts: 2 }.is_fatal());
        assert!(!AgentError::Interrupted.is_fatal());
        assert!(!AgentError::World(anyhow::anyhow!("disconnected")).is_fatal());
    }

    #[test]
    fn scoring_exhausted_lists_missing_goals() {
        let err = AgentError::ScoringExhausted {
            attempts: 5,
            missing: vec!["chop wood".to_string(), "find shelter".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("5 attempts"));
        assert!(msg.contains("chop wood, find shelter"));
    }
}
