//! Prompt templates and the placeholder renderer.
//!
//! Profile templates (conversing, memory saving) may reference a closed set of `$NAME` style
//! placeholders. [`render`] is pure: callers gather a [`PromptData`] first, then render.

use std::fmt::Write;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::goal::GoalOutcome;
use super::history::{Turn, stringify_turns};
use super::plan::{ActionLogEntry, Step, render_log, render_steps};
use super::state::AgentServices;
use super::wire::Invocation;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[A-Z_]+").expect("placeholder regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    Name,
    Stats,
    Inventory,
    CommandDocs,
    Memory,
    ToSummarize,
    Convo,
    LastGoals,
    Blueprints,
}

impl Placeholder {
    pub const ALL: [Placeholder; 9] = [
        Placeholder::Name,
        Placeholder::Stats,
        Placeholder::Inventory,
        Placeholder::CommandDocs,
        Placeholder::Memory,
        Placeholder::ToSummarize,
        Placeholder::Convo,
        Placeholder::LastGoals,
        Placeholder::Blueprints,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Placeholder::Name => "$NAME",
            Placeholder::Stats => "$STATS",
            Placeholder::Inventory => "$INVENTORY",
            Placeholder::CommandDocs => "$COMMAND_DOCS",
            Placeholder::Memory => "$MEMORY",
            Placeholder::ToSummarize => "$TO_SUMMARIZE",
            Placeholder::Convo => "$CONVO",
            Placeholder::LastGoals => "$LAST_GOALS",
            Placeholder::Blueprints => "$BLUEPRINTS",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.token() == token)
    }

    /// Placeholders referenced by `template`, in first-use order.
    pub fn used_in(template: &str) -> Vec<Placeholder> {
        let mut used = Vec::new();
        for m in PLACEHOLDER.find_iter(template) {
            if let Some(p) = Self::from_token(m.as_str())
                && !used.contains(&p)
            {
                used.push(p);
            }
        }
        used
    }
}

/// One value per placeholder. `None` leaves the token unresolved.
#[derive(Debug, Clone, Default)]
pub struct PromptData {
    pub name: Option<String>,
    pub stats: Option<String>,
    pub inventory: Option<String>,
    pub command_docs: Option<String>,
    pub memory: Option<String>,
    pub to_summarize: Option<Vec<Turn>>,
    pub convo: Option<Vec<Turn>>,
    pub last_goals: Option<Vec<GoalOutcome>>,
    pub blueprints: Option<Vec<String>>,
}

impl PromptData {
    pub fn value(&self, placeholder: Placeholder) -> Option<String> {
        match placeholder {
            Placeholder::Name => self.name.clone(),
            Placeholder::Stats => self.stats.clone(),
            Placeholder::Inventory => self.inventory.clone(),
            Placeholder::CommandDocs => self.command_docs.clone(),
            Placeholder::Memory => self.memory.clone(),
            Placeholder::ToSummarize => self.to_summarize.as_deref().map(stringify_turns),
            Placeholder::Convo => self
                .convo
                .as_deref()
                .map(|t| format!("Recent conversation:\n{}", stringify_turns(t))),
            Placeholder::LastGoals => self.last_goals.as_deref().map(render_last_goals),
            Placeholder::Blueprints => self.blueprints.as_ref().map(|b| b.join(", ")),
        }
    }

    /// Fills the placeholders `template` uses from the agent's providers.
    ///
    /// Stats and inventory come from the `!stats` and `!inventory` query commands when they are
    /// registered. Turn-based values (`$CONVO`, `$TO_SUMMARIZE`) are left to the caller.
    pub async fn gather(services: &AgentServices, template: &str) -> Self {
        let mut data = PromptData {
            name: Some(services.name.clone()),
            ..PromptData::default()
        };
        for p in Placeholder::used_in(template) {
            match p {
                Placeholder::Stats => data.stats = run_query(services, "!stats").await,
                Placeholder::Inventory => data.inventory = run_query(services, "!inventory").await,
                Placeholder::CommandDocs => data.command_docs = Some(services.registry.docs()),
                Placeholder::Memory => {
                    data.memory = Some(services.journal.lock().await.history().memory().to_string())
                }
                Placeholder::LastGoals => {
                    data.last_goals = Some(services.journal.lock().await.last_goals().to_vec())
                }
                Placeholder::Blueprints if !services.settings.blueprints.is_empty() => {
                    data.blueprints = Some(services.settings.blueprints.clone())
                }
                _ => {}
            }
        }
        data
    }
}

/// Runs a registered zero-argument query command, returning its text output.
pub async fn run_query(services: &AgentServices, name: &str) -> Option<String> {
    if !services.registry.exists(name) {
        return None;
    }
    let invocation = Invocation {
        name: name.to_string(),
        args: vec![],
    };
    match services
        .registry
        .perform(services.world.as_ref(), &invocation)
        .await
    {
        Ok(out) => out,
        Err(err) => {
            tracing::warn!(command = name, error = %format!("{err:#}"), "agent.query.failed");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// `$UPPER_CASE` tokens left in the text, in first-seen order.
    pub unknown: Vec<String>,
}

impl Rendered {
    /// Returns the text, warning about unresolved placeholders.
    pub fn into_text(self) -> String {
        if !self.unknown.is_empty() {
            tracing::warn!(placeholders = %self.unknown.join(", "), "agent.prompt.unknown_placeholders");
        }
        self.text
    }
}

/// Substitutes every resolvable placeholder in one pass. Substituted values are never rescanned.
pub fn render(template: &str, data: &PromptData) -> Rendered {
    let mut unknown: Vec<String> = Vec::new();
    let text = PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let token = &caps[0];
            if let Some(value) = Placeholder::from_token(token).and_then(|p| data.value(p)) {
                return value;
            }
            if !unknown.iter().any(|u| u == token) {
                unknown.push(token.to_string());
            }
            token.to_string()
        })
        .into_owned();
    Rendered { text, unknown }
}

pub fn render_last_goals(last_goals: &[GoalOutcome]) -> String {
    let lines: Vec<String> = last_goals
        .iter()
        .map(|o| {
            if o.achieved {
                format!("You recently successfully completed the goal {}.", o.goal)
            } else {
                format!("You recently failed to complete the goal {}.", o.goal)
            }
        })
        .collect();
    lines.join("\n")
}

pub fn goal_scoring(goal_prompt: &str) -> String {
    format!(
        "You are playing minecraft, score the importance and feasibility of each goal below by considering your current status and surroundings.

IMPORTANT: You must attribute a score to each goal with a number between 0 and 100, where:
- 0 means completely impossible or irrelevant
- 50 means moderately important and feasible
- 100 means urgent and extremely important

Rules for scoring:
1. Consider both importance AND feasibility
2. Higher scores for goals that match your current needs, are achievable with items in your inventory or blocks around you, are prerequisites for other goals, or have an approaching deadline
3. Lower scores for goals that need unavailable or distant resources, are too complex for the current situation, or are less urgent

FORMAT: For each goal STRICTLY respond with EXACTLY this format:

goal description: score

DO NOT prefix lines with symbols, numbers or bullet points such as:
- goal description: score
1. goal description: score

__CONTEXT AND GOALS__

{goal_prompt}"
    )
}

pub fn missing_scores_clause(missing: &[String]) -> String {
    format!(
        "\n\nPlease provide scores for ALL goals. Missing scores for:\n{}",
        missing.join("\n")
    )
}

const PLAN_EXAMPLE: &str = "EXAMPLE:
GOAL : Eat food to heal and fill hunger bar
- 10/20 Health, 13/20 Hunger
- No food in inventory, cows nearby, no nearby oven
- No oak logs in inventory but block available nearby

Expected answer:
1. Search for a cow
2. Move near cow
3. Kill cow
4. Pick up dropped items
5. Logic: Verify if enough raw beef has been collected to fill health and hunger bars, else repeat actions
6. Collect oak logs for crafting table and burning fuel
7. Craft crafting table
8. Place crafting table
9. Craft oven
10. Place oven
11. Place uncooked beef and planks in oven
12. Wait for beef to cook and collect cooked beef
13. Eat beef
14. Logic: Verify if bars are filled up, else repeat actions

Bad answer:
1. Search for a cow
2. Kill cow
3. Cook meat
4. If there are no cows nearby, search for a pig

The bad answer has steps that need to be broken down further and checks conditions after acting on them.";

pub fn action_list(goal_context: &str, command_docs: &str) -> String {
    format!(
        "You are playing minecraft and need to break down a given goal into simple steps to execute one after another in minecraft to achieve the goal.
Each step should be written in natural language but achievable using only one of the given commands. Do not combine them or create new ones.
If you require a step for analyzing your current situation, such as the progress of a certain part of the goal, start the line with \"Logic: \".

GOAL TO ACHIEVE:
{goal_context}

FORMAT YOUR RESPONSE AS:
1. Clear action in natural language
2. Next clear action in natural language
3. Following clear action in natural language

{PLAN_EXAMPLE}

WRITING RULES
- Write each step in natural language that maps to ONE available command
- Do NOT write the commands themselves
- Start each line with a number and period
- Be specific about blocks, items, and locations
- Keep steps in chronological order
- Use \"Logic:\" to verify whether earlier actions were enough instead of repeating them
- NO additional text or explanations

Available commands for reference:
{command_docs}

Now list ONLY the numbered steps needed to achieve the goal above. NO other text."
    )
}

const GATE_EXAMPLE: &str = "EXAMPLE:
GOAL : Eat food to heal and fill hunger bar

CURRENT ACTION AND CONTEXT:
craft oven and cook beef

PREVIOUS ACTIONS:
Search for a cow
Kill cow
Pick up dropped items
Craft crafting table
Place crafting table

FOLLOWING ACTIONS:
Eat beef
Logic: Verify if bars are filled up, else repeat actions

Expected answer:
no

Bad answer:
yes";

fn previous_actions(log: &[ActionLogEntry]) -> String {
    let steps: Vec<&Step> = log.iter().map(|e| &e.step).collect();
    render_steps(steps)
}

pub fn feasibility(
    action_context: &str,
    preceding: &[ActionLogEntry],
    following: &[Step],
    command_docs: &str,
) -> String {
    format!(
        "You are charged with evaluating if the current action can be executed using the available commands so that a minecraft bot can perform said action.
You are given the actions already performed under PREVIOUS ACTIONS and the actions still to be performed under FOLLOWING ACTIONS.

Say 'yes' if:
- The action could be executed using a single command from the list
- The intent is clear enough to map to a command

Say 'no' if:
- No available command seems able to execute it on its own

CURRENT ACTION AND CONTEXT:
{action_context}

PREVIOUS ACTIONS:
{}

FOLLOWING ACTIONS:
{}

{GATE_EXAMPLE}

AVAILABLE COMMANDS:
{command_docs}

Answer with ONLY 'yes' or 'no'.",
        previous_actions(preceding),
        render_steps(following),
    )
}

pub fn verdict_correction() -> &'static str {
    "\n\nYour last answer was invalid. You MUST respond with ONLY the single word 'yes' or 'no'.
Do not add any explanation, punctuation, or additional text."
}

pub fn refinement(
    action_context: &str,
    preceding: &[ActionLogEntry],
    following: &[Step],
    command_docs: &str,
) -> String {
    format!(
        "You are tasked with breaking down the following action into simpler actions so that it can be realised with the available commands.
Each step should be written in natural language but achievable using only the given commands. Do not create new ones.
Limit your response to 2-5 new steps, with a maximum of 10.

IMPORTANT: Respond ONLY with a numbered list. Each action should be achievable with a single command.

ACTION TO BREAK DOWN AND CONTEXT:
{action_context}

PREVIOUS ACTIONS:
{}

FOLLOWING ACTIONS:
{}

EXAMPLE:
CURRENT ACTION: craft oven and cook beef
Expected answer:
1. Craft oven
2. Place oven
3. Place uncooked beef and planks in oven
4. Wait for beef to cook and collect cooked beef

WRITING RULES:
- Write each step in natural language that maps to ONE available command
- Start each line with a number and period
- Keep steps in chronological order
- Quantify the number of items needed where it matters
- NO additional text or explanations

Available commands for reference:
{command_docs}",
        previous_actions(preceding),
        render_steps(following),
    )
}

pub fn refinement_correction(parsed: usize) -> String {
    format!(
        "\n\nYour last answer wasn't in the correct format ({parsed} steps parsed). Please provide between 1 and 10 simple steps as a numbered list."
    )
}

pub fn command_resolution(action_context: &str, command_docs: &str) -> String {
    format!(
        "You are playing minecraft through the use of commands and are tasked with returning the command that should be executed to perform the given action below.
Given the context of the action, determine which command should be executed and what parameters to pass to it.
This is the action you need to perform:
{action_context}

Available commands:
{command_docs}"
    )
}

pub fn resolution_warning(detail: &str) -> String {
    format!("\n\nWARNING\n{detail}")
}

pub fn goal_evaluation(goal: &str, final_context: &str, log: &[ActionLogEntry]) -> String {
    let mut prompt = format!(
        "You are playing minecraft and just finished working toward a goal. Decide whether the goal was achieved.

GOAL:
{goal}

ACTIONS TAKEN AND THEIR RESULTS:
"
    );
    if log.is_empty() {
        prompt.push_str("(none)\n");
    } else {
        let _ = writeln!(prompt, "{}", render_log(log));
    }
    let _ = write!(
        prompt,
        "{final_context}\n\nAnswer with ONLY 'yes' if the goal was achieved or 'no' if it was not."
    );
    prompt
}
