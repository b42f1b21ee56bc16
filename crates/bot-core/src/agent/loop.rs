use serde_json::json;

use super::conversation::Conversation;
use super::decompose::Decomposer;
use super::error::{AgentError, AgentResult};
use super::executor::{CommandResolver, Resolution, narrate};
use super::feasibility::{Feasibility, FeasibilityGate, ask_verdict};
use super::goal::{Agenda, Goal, GoalOutcome, GoalPlanner};
use super::history::Speaker;
use super::memory::{MemoryKind, render_memories};
use super::parser::Verdict;
use super::plan::{ActionLogEntry, Step, render_log};
use super::prompt::{self, run_query};
use super::state::{AgentServices, AgentState};

/// Query commands folded into every context snapshot, when registered.
pub const CONTEXT_QUERIES: &[&str] = &[
    "!stats",
    "!inventory",
    "!craftable",
    "!entities",
    "!nearbyBlocks",
    "!savedPlaces",
];

/// Logged result for logic checkpoints, which are not evaluated yet.
pub const CHECKPOINT_RESULT: &str = "checkpoint noted; not evaluated";

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub goal: Goal,
    pub outcome: GoalOutcome,
    pub action_log: Vec<ActionLogEntry>,
    pub refinements: u32,
}

/// Goal cycle orchestrator: select, decompose, gate, resolve, execute, evaluate.
pub struct PlanningLoop {
    services: AgentServices,
    planner: GoalPlanner,
    decomposer: Decomposer,
    gate: FeasibilityGate,
    resolver: CommandResolver,
    conversation: Conversation,
    state: AgentState,
}

impl PlanningLoop {
    pub fn new(services: AgentServices, conversation: Conversation, agenda: Agenda) -> Self {
        let decomposer = Decomposer::new(services.clone());
        Self {
            planner: GoalPlanner::new(services.clone()),
            gate: FeasibilityGate::new(services.clone(), decomposer.clone()),
            resolver: CommandResolver::new(services.clone()),
            decomposer,
            conversation,
            state: AgentState::new(agenda),
            services,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Runs every registered query command and formats the results as a `__CONTEXT__` block.
    pub async fn context_snapshot(&self) -> String {
        let mut status = String::new();
        for name in CONTEXT_QUERIES {
            if let Some(out) = run_query(&self.services, name).await {
                status.push_str(out.trim_end());
                status.push('\n');
            }
        }
        format!("\n\n__CONTEXT__\n\nSTATUS: \n{status}")
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

    async fn remember(&self, kind: MemoryKind, content: &str, goal: &str) {
        let metadata = json!({ "goal": goal, "at": chrono::Utc::now().to_rfc3339() });
        if let Err(err) = self.services.memory.store(kind, content, metadata).await {
            tracing::warn!(error = %format!("{err:#}"), "agent.memory.store_failed");
        }
    }

    async fn action_context(&self, step: &Step) -> String {
        let mut ctx = format!("ACTION: {step}");
        ctx.push_str(&self.context_snapshot().await);
        let memories = self.similar_memories(&ctx).await;
        ctx.push_str(&format!(
            "\n\nSIMILAR MEMORIES: \n{memories}\nMEMORY STREAM: \n{}",
            render_log(&self.state.action_log)
        ));
        ctx
    }

    fn check_interrupt(&self) -> AgentResult<()> {
        let flags = &self.services.flags;
        if flags.take_interrupt() || flags.is_shutdown() {
            return Err(AgentError::Interrupted);
        }
        Ok(())
    }

    /// Resolves and executes one feasible action step, returning its log entry.
    async fn execute(&self, step: Step, action_context: &str) -> AgentResult<(ActionLogEntry, bool)> {
        let world = self.services.world.as_ref();
        match self.resolver.resolve(action_context).await? {
            Resolution::Resolved {
                command,
                invocation,
                cleaned_message,
            } => {
                if let Err(err) = narrate(
                    world,
                    &cleaned_message,
                    &command,
                    self.services.settings.verbose_commands,
                )
                .await
                {
                    tracing::warn!(error = %format!("{err:#}"), "agent.world.chat_failed");
                }
                let (result, ok) = match self.services.executor.dispatch(&invocation, world).await {
                    Ok(Some(out)) => (out, true),
                    Ok(None) => ("done".to_string(), true),
                    Err(err) => (format!("failed: {err:#}"), false),
                };
                Ok((
                    ActionLogEntry {
                        step,
                        command_invocation: Some(invocation),
                        result,
                    },
                    ok,
                ))
            }
            Resolution::Escalated { prompt, attempts } => {
                tracing::warn!(step = %step, attempts, "agent.resolve.escalated");
                let used = self
                    .conversation
                    .handle_message("system", &prompt, Some(5))
                    .await?;
                let result = if used {
                    "escalated to conversation; a command was executed"
                } else {
                    "escalated to conversation; no command was executed"
                };
                Ok((
                    ActionLogEntry {
                        step,
                        command_invocation: None,
                        result: result.to_string(),
                    },
                    used,
                ))
            }
        }
    }

    async fn record(&mut self, entry: ActionLogEntry, succeeded: bool, goal: &str) {
        self.services
            .journal
            .lock()
            .await
            .append(Speaker::System, format!("Action: {entry}"), self.conversation.summarizer())
            .await;
        self.remember(MemoryKind::for_action(succeeded), &entry.to_string(), goal)
            .await;
        self.state.action_log.push(entry);
    }

    async fn evaluate(&self, goal: &Goal) -> AgentResult<GoalOutcome> {
        let final_context = self.context_snapshot().await;
        let prompt = prompt::goal_evaluation(&goal.description, &final_context, &self.state.action_log);
        let verdict = ask_verdict(
            self.services.oracle.as_ref(),
            &prompt,
            self.services.limits.verdict_attempts,
        )
        .await?;
        Ok(GoalOutcome {
            goal: goal.description.clone(),
            achieved: verdict == Verdict::Yes,
        })
    }

    async fn close_goal(&mut self, outcome: GoalOutcome) {
        let summary = format!(
            "Goal {} was {}.",
            outcome.goal,
            if outcome.achieved { "achieved" } else { "not achieved" }
        );
        self.remember(MemoryKind::for_goal(outcome.achieved), &summary, &outcome.goal)
            .await;
        let mut journal = self.services.journal.lock().await;
        journal.record_outcome(outcome);
        journal.save_logged();
    }

    /// One full goal cycle.
    pub async fn run_cycle(&mut self) -> AgentResult<CycleReport> {
        let context = self.context_snapshot().await;
        let last_goals = self.services.journal.lock().await.last_goals().to_vec();

        let selection = self
            .planner
            .select_goal(&last_goals, &self.state.agenda, &context)
            .await?;
        self.state.agenda = selection.agenda;
        let goal = selection.goal;
        self.state.begin_goal(goal.clone());

        let mut list = self.decomposer.decompose_goal(&goal, &context).await?;

        while let Some(step) = list.front().cloned() {
            self.check_interrupt()?;
            tracing::info!(step = %step, remaining = list.len(), "agent.step.current");

            let action_context = self.action_context(&step).await;
            let following: Vec<Step> = list.following().cloned().collect();
            let verdict = self
                .gate
                .check(&step, &action_context, &self.state.action_log, &following)
                .await?;

            if let Feasibility::Refined(steps) = verdict {
                self.state.refinements += 1;
                let budget = self.services.limits.max_refinements;
                if self.state.refinements > budget {
                    return Err(AgentError::RefinementBudgetExceeded {
                        goal: goal.description.clone(),
                        budget,
                    });
                }
                list.splice_front(steps);
                continue;
            }

            list.pop_front();
            if step.is_logic() {
                let entry = ActionLogEntry {
                    step,
                    command_invocation: None,
                    result: CHECKPOINT_RESULT.to_string(),
                };
                self.record(entry, true, &goal.description).await;
                continue;
            }

            let (entry, ok) = self.execute(step, &action_context).await?;
            self.record(entry, ok, &goal.description).await;
        }

        let outcome = self.evaluate(&goal).await?;
        tracing::info!(goal = %goal.description, achieved = outcome.achieved, "agent.goal.evaluated");
        self.close_goal(outcome.clone()).await;
        self.state.end_goal();

        Ok(CycleReport {
            goal,
            outcome,
            action_log: self.state.action_log.clone(),
            refinements: self.state.refinements,
        })
    }

    /// Runs goal cycles until shutdown. Only fatal errors are returned.
    pub async fn run(&mut self) -> AgentResult<()> {
        loop {
            if self.services.flags.is_shutdown() {
                tracing::info!("agent.loop.shutdown");
                return Ok(());
            }
            match self.run_cycle().await {
                Ok(report) => tracing::info!(
                    goal = %report.goal.description,
                    achieved = report.outcome.achieved,
                    steps = report.action_log.len(),
                    "agent.cycle.done"
                ),
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "agent.cycle.fatal");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "agent.cycle.abandoned");
                    if let Some(goal) = self.state.end_goal() {
                        self.close_goal(GoalOutcome {
                            goal: goal.description,
                            achieved: false,
                        })
                        .await;
                    }
                    if !self.services.flags.is_shutdown() {
                        tokio::time::sleep(self.services.settings.error_backoff).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::agent::commands::{CommandRegistry, CommandSpec, ParamKind};
    use crate::agent::conversation::ConversationConfig;
    use crate::agent::testing::{
        FakeWorld, FixedHandler, ScriptedHandler, ScriptedOracle, SlowHandler, services_with,
    };
    use crate::agent::wire::ArgValue;

    struct Fixture {
        oracle: Arc<ScriptedOracle>,
        world: Arc<FakeWorld>,
        collect: Arc<ScriptedHandler>,
        services: AgentServices,
    }

    fn fixture() -> Fixture {
        let oracle = Arc::new(ScriptedOracle::default());
        let world = Arc::new(FakeWorld::default());
        let collect = Arc::new(ScriptedHandler::with_outputs(vec![
            Some("Collected 4 oak_log."),
            Some("Collected 3 cobblestone."),
        ]));
        let mut reg = CommandRegistry::new();
        reg.register(
            CommandSpec::new("!collectBlocks", "Collect the nearest blocks of a given type.")
                .param("type", ParamKind::String, "block type")
                .param("num", ParamKind::Int, "count"),
            collect.clone(),
        )
        .unwrap();
        reg.register(CommandSpec::new("!stats", "Get your stats."), Arc::new(FixedHandler::text("- Health: 20 / 20")))
            .unwrap();
        reg.register(CommandSpec::new("!inventory", "Get your inventory."), Arc::new(FixedHandler::text("INVENTORY: Nothing")))
            .unwrap();
        reg.register(
            CommandSpec::new("!wait", "Wait for the furnace."),
            Arc::new(SlowHandler::new(std::time::Duration::from_secs(2), "Waited.")),
        )
        .unwrap();
        reg.register(CommandSpec::new("!stop", "Force stop all actions."), Arc::new(FixedHandler::text("Agent stopped.")))
            .unwrap();
        let services = services_with(oracle.clone(), reg, world.clone());
        Fixture {
            oracle,
            world,
            collect,
            services,
        }
    }

    fn planning_loop(f: &Fixture, agenda: Agenda) -> PlanningLoop {
        let convo = Conversation::new(f.services.clone(), ConversationConfig::default());
        PlanningLoop::new(f.services.clone(), convo, agenda)
    }

    #[tokio::test]
    async fn context_snapshot_runs_registered_queries_only() {
        let f = fixture();
        let ctx = planning_loop(&f, Agenda::default()).context_snapshot().await;
        assert_eq!(ctx, "\n\n__CONTEXT__\n\nSTATUS: \n- Health: 20 / 20\nINVENTORY: Nothing\n");
    }

    #[tokio::test]
    async fn full_cycle_with_refinement_checkpoint_and_evaluation() -> anyhow::Result<()> {
        let f = fixture();
        for r in [
            // goal scoring
            "chop wood: 80\nfind shelter: 40",
            // action list
            "1. Gather wood and stone\n2. Logic: check if enough wood",
            // gate: step 1 infeasible, refinement into two steps
            "no",
            "1. Collect 4 oak logs\n2. Collect 3 cobblestone",
            // gate + resolve for each refined step
            "yes",
            "!collectBlocks(\"oak_log\", 4)",
            "yes",
            "Mining! !collectBlocks(\"cobblestone\", 3)",
            // goal evaluation
            "yes",
        ] {
            f.oracle.push_response(r);
        }
        let mut lp = planning_loop(&f, Agenda::from_descriptions(["find shelter", "chop wood"]));
        let report = lp.run_cycle().await?;

        assert_eq!(report.goal, Goal::new("chop wood", 80));
        assert!(report.outcome.achieved);
        assert_eq!(report.refinements, 1);
        let steps: Vec<String> = report.action_log.iter().map(|e| e.step.to_string()).collect();
        assert_eq!(
            steps,
            vec!["Collect 4 oak logs", "Collect 3 cobblestone", "Logic: check if enough wood"]
        );
        assert_eq!(report.action_log[0].result, "Collected 4 oak_log.");
        assert_eq!(report.action_log[2].command_invocation, None);
        assert_eq!(
            f.collect.calls(),
            vec![
                vec![ArgValue::Str("oak_log".to_string()), ArgValue::Int(4)],
                vec![ArgValue::Str("cobblestone".to_string()), ArgValue::Int(3)],
            ]
        );
        assert_eq!(f.world.chats(), vec!["*used collectBlocks*", "Mining! *used collectBlocks*"]);
        assert_eq!(f.oracle.remaining(), 0);

        let journal = f.services.journal.lock().await;
        assert_eq!(journal.last_goals(), &[GoalOutcome { goal: "chop wood".to_string(), achieved: true }]);
        assert_eq!(journal.history().len(), 3);
        assert_eq!(lp.state().agenda.top(), Some(&Goal::new("chop wood", 80)));
        Ok(())
    }

    #[tokio::test]
    async fn refinement_budget_abandons_the_cycle() {
        let f = fixture();
        f.oracle.push_response("chop wood: 80");
        f.oracle.push_response("1. Do something vague");
        // Every gate answer is "no" and every refinement yields another vague step.
        for _ in 0..64 {
            f.oracle.push_response("no");
            f.oracle.push_response("1. Do something vague");
        }
        let mut lp = planning_loop(&f, Agenda::from_descriptions(["chop wood"]));
        let err = lp.run_cycle().await.unwrap_err();
        let budget = f.services.limits.max_refinements;
        assert!(matches!(err, AgentError::RefinementBudgetExceeded { budget: b, .. } if b == budget));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn interrupt_abandons_cycle_between_steps() {
        let f = fixture();
        f.oracle.push_response("chop wood: 80");
        f.oracle.push_response("1. Collect 4 oak logs");
        f.services.flags.request_interrupt();
        let mut lp = planning_loop(&f, Agenda::from_descriptions(["chop wood"]));
        let err = lp.run_cycle().await.unwrap_err();
        assert!(matches!(err, AgentError::Interrupted));
        assert!(f.collect.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn user_command_during_an_action_abandons_the_cycle() {
        let f = fixture();
        for r in [
            "chop wood: 80",
            "1. Wait for the furnace\n2. Collect 4 oak logs",
            "yes",
            "!wait",
            // answered by the conversation while !wait is still running
            "!stop",
        ] {
            f.oracle.push_response(r);
        }
        let mut lp = planning_loop(&f, Agenda::from_descriptions(["chop wood"]));
        let convo = Conversation::new(f.services.clone(), ConversationConfig::default());

        let (cycle, used) = tokio::join!(lp.run_cycle(), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            convo.handle_message("steve", "stop what you are doing", Some(1)).await
        });
        assert!(matches!(cycle, Err(AgentError::Interrupted)));
        assert!(matches!(used, Ok(true)));
        assert_eq!(f.world.interrupt_count(), 1);
        assert!(f.collect.calls().is_empty());
        assert_eq!(f.oracle.remaining(), 0);
    }

    #[tokio::test]
    async fn long_plans_keep_the_history_bounded() -> anyhow::Result<()> {
        let f = fixture();
        let plan: Vec<String> = (1..=20).map(|i| format!("{i}. Logic: check pile {i}")).collect();
        f.oracle.push_response("chop wood: 80");
        f.oracle.push_response(plan.join("\n"));
        // The 16th checkpoint turn folds the oldest five into memory.
        f.oracle.push_response("summary of early checkpoints");
        f.oracle.push_response("yes");

        let mut lp = planning_loop(&f, Agenda::from_descriptions(["chop wood"]));
        let report = lp.run_cycle().await?;
        assert_eq!(report.action_log.len(), 20);
        assert_eq!(f.oracle.remaining(), 0);

        let journal = f.services.journal.lock().await;
        let max = crate::agent::history::HistoryConfig::default().max_messages;
        assert!(journal.history().len() <= max);
        assert_eq!(journal.history().len(), 15);
        assert_eq!(journal.history().memory(), "summary of early checkpoints");
        assert!(journal.history().turns()[0].text.contains("check pile 6"));
        Ok(())
    }

    #[tokio::test]
    async fn run_propagates_fatal_planner_errors() {
        let f = fixture();
        f.oracle.always("nothing useful");
        let mut lp = planning_loop(&f, Agenda::from_descriptions(["chop wood"]));
        let err = lp.run().await.unwrap_err();
        assert!(matches!(err, AgentError::ScoringExhausted { .. }));
    }

    #[tokio::test]
    async fn run_records_abandoned_cycles_and_moves_on() {
        let f = fixture();
        f.oracle.push_response("chop wood: 80");
        // Plan never parses: the cycle is abandoned and recorded as a failure.
        for _ in 0..f.services.limits.plan_attempts {
            f.oracle.push_response("I refuse to make a list.");
        }
        // Then the oracle stops answering in a usable way, which is fatal at goal selection.
        f.oracle.always("???");
        let mut lp = planning_loop(&f, Agenda::from_descriptions(["chop wood"]));
        let err = lp.run().await.unwrap_err();
        assert!(err.is_fatal());

        let journal = f.services.journal.lock().await;
        assert_eq!(
            journal.last_goals(),
            &[GoalOutcome { goal: "chop wood".to_string(), achieved: false }]
        );
        let retry = f.oracle.last_prompt().unwrap_or_default();
        assert!(retry.contains("You recently failed to complete the goal chop wood."));
    }

    #[tokio::test]
    async fn run_returns_ok_on_shutdown() -> anyhow::Result<()> {
        let f = fixture();
        f.services.flags.request_shutdown();
        let mut lp = planning_loop(&f, Agenda::from_descriptions(["chop wood"]));
        lp.run().await?;
        assert_eq!(f.oracle.prompt_count(), 0);
        Ok(())
    }
}
