use super::decompose::Decomposer;
use super::error::{AgentError, AgentResult};
use super::oracle::Oracle;
use super::parser::{Verdict, normalize_verdict};
use super::plan::{ActionLogEntry, Step};
use super::prompt;
use super::state::AgentServices;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feasibility {
    Feasible,
    /// Replacement steps for the checked step, in execution order.
    Refined(Vec<Step>),
}

/// Sends a yes/no prompt, appending a correction after every unparseable answer.
pub async fn ask_verdict(oracle: &dyn Oracle, prompt: &str, attempts: u32) -> AgentResult<Verdict> {
    let mut prompt = prompt.to_string();
    for attempt in 1..=attempts {
        let res = oracle
            .send_request(&[], &prompt)
            .await
            .map_err(AgentError::Oracle)?;
        if let Some(verdict) = normalize_verdict(&res) {
            return Ok(verdict);
        }
        tracing::debug!(attempt, response = %res, "agent.verdict.unparseable");
        prompt.push_str(prompt::verdict_correction());
    }
    Err(AgentError::VerdictUnparseable { attempts })
}

/// Decides whether a step maps onto one command, refining it when it does not.
pub struct FeasibilityGate {
    services: AgentServices,
    decomposer: Decomposer,
}

impl FeasibilityGate {
    pub fn new(services: AgentServices, decomposer: Decomposer) -> Self {
        Self {
            services,
            decomposer,
        }
    }

    pub async fn check(
        &self,
        step: &Step,
        action_context: &str,
        preceding: &[ActionLogEntry],
        following: &[Step],
    ) -> AgentResult<Feasibility> {
        // Logic checkpoints are not evaluated yet; they pass straight through.
        if step.is_logic() {
            return Ok(Feasibility::Feasible);
        }

        let prompt = prompt::feasibility(
            action_context,
            preceding,
            following,
            &self.services.registry.docs(),
        );
        let verdict = ask_verdict(
            self.services.oracle.as_ref(),
            &prompt,
            self.services.limits.verdict_attempts,
        )
        .await?;
        tracing::debug!(step = %step, verdict = ?verdict, "agent.gate.verdict");

        match verdict {
            Verdict::Yes => Ok(Feasibility::Feasible),
            Verdict::No => {
                let steps = self
                    .decomposer
                    .refine(step, action_context, preceding, following)
                    .await?;
                Ok(Feasibility::Refined(steps))
            }
        }
    }
}
