use std::collections::HashSet;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use super::error::{AgentError, AgentResult};
use super::memory::render_memories;
use super::parser::{normalize_goal, parse_goal_scores};
use super::prompt;
use super::state::AgentServices;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    /// 0 (irrelevant or impossible) to 100 (urgent).
    #[serde(default)]
    pub score: u8,
}

impl Goal {
    pub fn new(description: impl Into<String>, score: u8) -> Self {
        Self {
            description: description.into(),
            score: score.min(100),
        }
    }
}

/// Candidate goals, highest score first. Ties keep their previous relative order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Agenda {
    goals: Vec<Goal>,
}

impl Agenda {
    /// Builds an agenda, dropping later duplicates (compared case-insensitively).
    pub fn new(goals: impl IntoIterator<Item = Goal>) -> Self {
        let mut seen = HashSet::new();
        let mut goals: Vec<Goal> = goals
            .into_iter()
            .filter(|g| seen.insert(normalize_goal(&g.description)))
            .collect();
        goals.sort_by(|a, b| b.score.cmp(&a.score));
        Self { goals }
    }

    pub fn from_descriptions<I, S>(descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(descriptions.into_iter().map(|d| Goal::new(d, 0)))
    }

    pub fn top(&self) -> Option<&Goal> {
        self.goals.first()
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Goal> {
        self.goals.iter()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.goals.iter().map(|g| g.description.clone()).collect()
    }

    /// Same goals, new scores (aligned with the current order), re-sorted.
    fn rescored(&self, scores: &[u8]) -> Self {
        Self::new(
            self.goals
                .iter()
                .zip(scores)
                .map(|(g, &s)| Goal::new(g.description.clone(), s)),
        )
    }
}

/// Result of a finished (or abandoned) goal cycle, fed back into the next scoring prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalOutcome {
    pub goal: String,
    pub achieved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalSelection {
    pub goal: Goal,
    pub agenda: Agenda,
}

/// Re-scores the whole agenda against the current context and picks the top goal.
pub struct GoalPlanner {
    services: AgentServices,
}

impl GoalPlanner {
    pub fn new(services: AgentServices) -> Self {
        Self { services }
    }

    async fn goal_memories(&self, query: &str) -> String {
        match self.services.memory.query(query).await {
            Ok(hits) => render_memories(&hits),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "agent.memory.query_failed");
                String::new()
            }
        }
    }

    pub async fn select_goal(
        &self,
        last_goals: &[GoalOutcome],
        agenda: &Agenda,
        context: &str,
    ) -> AgentResult<GoalSelection> {
        if agenda.is_empty() {
            return Err(AgentError::EmptyAgenda);
        }

        let prompt_context = format!(
            "__GOALS OF LAST CYCLES__\n{}{context}",
            prompt::render_last_goals(last_goals)
        );
        let mut goal_prompt = String::from("__AGENDA__\n\n");
        for goal in agenda.iter() {
            let memories = self
                .goal_memories(&format!("{}{prompt_context}", goal.description))
                .await;
            let _ = writeln!(goal_prompt, "GOAL:{}: {}", goal.description, goal.score);
            let _ = writeln!(goal_prompt, "GOAL SIMILAR MEMORIES: \n{memories}");
        }
        goal_prompt.push_str(&prompt_context);

        let descriptions = agenda.descriptions();
        let mut prompt = prompt::goal_scoring(&goal_prompt);
        let attempts = self.services.limits.scoring_attempts;
        let mut missing = descriptions.clone();

        for attempt in 1..=attempts {
            let res = self
                .services
                .oracle
                .send_request(&[], &prompt)
                .await
                .map_err(AgentError::Oracle)?;
            let scores = parse_goal_scores(&res, &descriptions);
            missing = descriptions
                .iter()
                .zip(&scores)
                .filter(|(_, s)| s.is_none())
                .map(|(d, _)| d.clone())
                .collect();

            if missing.is_empty() {
                let scores: Vec<u8> = scores.into_iter().flatten().collect();
                let agenda = agenda.rescored(&scores);
                let Some(goal) = agenda.top().cloned() else {
                    return Err(AgentError::EmptyAgenda);
                };
                tracing::info!(goal = %goal.description, score = goal.score, attempt, "agent.goal.selected");
                return Ok(GoalSelection { goal, agenda });
            }

            tracing::debug!(attempt, missing = ?missing, "agent.goal.missing_scores");
            prompt.push_str(&prompt::missing_scores_clause(&missing));
        }

        Err(AgentError::ScoringExhausted { attempts, missing })
    }
}
