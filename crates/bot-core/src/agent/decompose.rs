use super::error::{AgentError, AgentResult};
use super::goal::Goal;
use super::memory::render_memories;
use super::parser::parse_action_list;
use super::plan::{ActionList, ActionLogEntry, Step};
use super::prompt;
use super::state::AgentServices;

/// A refinement must replace one step with at most this many.
pub const MAX_REFINEMENT_STEPS: usize = 10;

/// Turns goals into numbered step lists and splits infeasible steps into simpler ones.
#[derive(Clone)]
pub struct Decomposer {
    services: AgentServices,
}

impl Decomposer {
    pub fn new(services: AgentServices) -> Self {
        Self { services }
    }

    async fn similar_memories(&self, query: &str) -> String {
        match self.services.memory.query(query).await {
            Ok(hits) => render_memories(&hits),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "agent.memory.query_failed");
                String::new()
            }
        }
    }

    /// Asks for a numbered plan, re-sending the same prompt until one step parses.
    pub async fn decompose_goal(&self, goal: &Goal, context: &str) -> AgentResult<ActionList> {
        let mut goal_context = format!("GOAL: {}{context}", goal.description);
        let memories = self.similar_memories(&goal_context).await;
        goal_context.push_str(&format!("\n\nSIMILAR MEMORIES: \n{memories}"));

        let prompt = prompt::action_list(&goal_context, &self.services.registry.docs());
        let attempts = self.services.limits.plan_attempts;
        for attempt in 1..=attempts {
            let res = self
                .services
                .oracle
                .send_request(&[], &prompt)
                .await
                .map_err(AgentError::Oracle)?;
            let steps = parse_action_list(&res);
            if !steps.is_empty() {
                tracing::info!(goal = %goal.description, steps = steps.len(), attempt, "agent.plan.built");
                return Ok(ActionList::new(steps));
            }
            tracing::debug!(attempt, "agent.plan.unparseable");
        }
        Err(AgentError::PlanUnparseable { attempts })
    }

    /// Breaks `step` into 1 to [`MAX_REFINEMENT_STEPS`] simpler steps.
    ///
    /// Every malformed answer appends a correction to the same prompt before re-sending.
    pub async fn refine(
        &self,
        step: &Step,
        action_context: &str,
        preceding: &[ActionLogEntry],
        following: &[Step],
    ) -> AgentResult<Vec<Step>> {
        let mut prompt = prompt::refinement(
            action_context,
            preceding,
            following,
            &self.services.registry.docs(),
        );
        let attempts = self.services.limits.refine_attempts;
        for attempt in 1..=attempts {
            let res = self
                .services
                .oracle
                .send_request(&[], &prompt)
                .await
                .map_err(AgentError::Oracle)?;
            let steps = parse_action_list(&res);
            if (1..=MAX_REFINEMENT_STEPS).contains(&steps.len()) {
                tracing::info!(step = %step, into = steps.len(), attempt, "agent.plan.refined");
                return Ok(steps);
            }
            tracing::debug!(attempt, parsed = steps.len(), "agent.plan.refinement_rejected");
            prompt.push_str(&prompt::refinement_correction(steps.len()));
        }
        Err(AgentError::RefinementFailed {
            step: step.text.clone(),
            attempts,
        })
    }
}
