//! Runs a roster of agents over one prompt, sequentially or by dependency level.
//!
//! Each agent's turn runs on its own task so a panic inside one turn becomes
//! that agent's error outcome. The outcome map is owned by the driving loop and
//! written once per agent after the turn's task joins.

use std::collections::HashMap;
use std::sync::Arc;

use chorus_context::{ContextAssembler, TokenBudgetCalculator, WordCountTokenizer};
use chorus_core::{
    AgentOutcome, AgentSpec, ChorusConfig, Error, ExchangeRecord, ExecutionMode, KnowledgeSource,
    Ledger, Observer, OutcomeMap, PipelineRun, Result, Tokenizer, ToolGateway,
};
use chorus_providers::ProviderRegistry;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::cancel::CancellationFlag;
use crate::graph::DependencyGraph;
use crate::ledger::InMemoryLedger;

mod turn;

/// Result of a finished (or cancelled) run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Text of the highest-numbered agent with a recorded outcome
    pub final_text: String,
    /// Every recorded outcome
    pub outcomes: OutcomeMap,
    /// Whether the run stopped early because of cancellation
    pub cancelled: bool,
}

impl PipelineReport {
    fn from_outcomes(outcomes: OutcomeMap, cancelled: bool) -> Self {
        let final_text = outcomes
            .iter()
            .last()
            .map_or_else(String::new, |(_, outcome)| outcome.text.clone());
        Self {
            final_text,
            outcomes,
            cancelled,
        }
    }

    /// Outcome for one agent.
    #[must_use]
    pub fn outcome(&self, agent_number: u32) -> Option<&AgentOutcome> {
        self.outcomes.get(agent_number)
    }
}

/// Multi-agent pipeline over a provider registry.
///
/// Clones share the registry, observer, ledger, collaborators, and
/// cancellation flag.
#[derive(Clone)]
pub struct AgentPipeline {
    config: Arc<ChorusConfig>,
    registry: Arc<ProviderRegistry>,
    observer: Arc<dyn Observer>,
    ledger: Arc<dyn Ledger>,
    calculator: Arc<TokenBudgetCalculator>,
    assembler: Arc<ContextAssembler>,
    tools: Option<Arc<dyn ToolGateway>>,
    knowledge: Option<Arc<dyn KnowledgeSource>>,
    cancel: CancellationFlag,
}

impl AgentPipeline {
    /// Creates a pipeline with the word-count tokenizer and an in-memory ledger.
    #[must_use]
    pub fn new(
        config: ChorusConfig,
        registry: ProviderRegistry,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WordCountTokenizer);
        let calculator =
            TokenBudgetCalculator::new(config.catalog(), config.budget.clone(), tokenizer);
        let assembler = ContextAssembler::new(&calculator, config.execution.history_turns);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            observer,
            ledger: Arc::new(InMemoryLedger::new()),
            calculator: Arc::new(calculator),
            assembler: Arc::new(assembler),
            tools: None,
            knowledge: None,
            cancel: CancellationFlag::new(),
        }
    }

    /// Records exchanges into `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Counts tokens with `tokenizer` for budgets and prompt assembly.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        let calculator = TokenBudgetCalculator::new(
            self.config.catalog(),
            self.config.budget.clone(),
            tokenizer,
        );
        self.assembler = Arc::new(ContextAssembler::new(
            &calculator,
            self.config.execution.history_turns,
        ));
        self.calculator = Arc::new(calculator);
        self
    }

    /// Resolves tool directives through `gateway`.
    #[must_use]
    pub fn with_tool_gateway(mut self, gateway: Arc<dyn ToolGateway>) -> Self {
        self.tools = Some(gateway);
        self
    }

    /// Fills web-search and retrieval sections from `source`.
    #[must_use]
    pub fn with_knowledge_source(mut self, source: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge = Some(source);
        self
    }

    /// Observes `cancel` instead of a private flag.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag that stops the run between agents.
    #[must_use]
    pub fn cancel_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ChorusConfig {
        &self.config
    }

    /// Runs every agent and returns the recorded outcomes.
    ///
    /// Agent failures become error outcomes and the run continues. A
    /// cancellation observed between agents or levels stops the run early and
    /// is reported in [`PipelineReport::cancelled`].
    ///
    /// # Errors
    /// Returns an error, after reporting it through
    /// [`Observer::on_fatal_error`], if the run itself cannot continue.
    pub async fn run(&self, mut run: PipelineRun) -> Result<PipelineReport> {
        let mode = self.config.execution.mode;
        info!(agents = run.specs.len(), ?mode, "Pipeline started");
        self.observer
            .on_log(&format!("Starting pipeline with {} agent(s)", run.specs.len()));

        let finished = match mode {
            ExecutionMode::Sequential => self.run_sequential(&mut run).await,
            ExecutionMode::DependencyLevels => self.run_levels(&mut run).await,
        };

        match finished {
            Ok(cancelled) => {
                if cancelled {
                    warn!(recorded = run.outcomes.len(), "Pipeline cancelled");
                    self.observer.on_log("Pipeline cancelled");
                } else {
                    info!(recorded = run.outcomes.len(), "Pipeline finished");
                    self.observer.on_log("Pipeline complete");
                }
                self.observer.on_complete();
                Ok(PipelineReport::from_outcomes(run.outcomes, cancelled))
            }
            Err(err) => {
                error!("Pipeline failed: {err}");
                self.observer.on_fatal_error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Runs the pipeline on its own task.
    #[must_use]
    pub fn spawn(self, run: PipelineRun) -> PipelineHandle {
        let cancel = self.cancel.clone();
        let observer = Arc::clone(&self.observer);
        let task = tokio::spawn(async move { self.run(run).await });
        PipelineHandle {
            cancel,
            observer,
            task,
        }
    }

    /// Returns `true` if cancelled before every agent ran.
    async fn run_sequential(&self, run: &mut PipelineRun) -> Result<bool> {
        for spec in run.specs.clone() {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            let snapshot = Arc::new(run.clone());
            let pipeline = self.clone();
            let task_spec = spec.clone();
            let joined = tokio::spawn(turn::run_turn(pipeline, task_spec, snapshot)).await;
            let outcome = joined.unwrap_or_else(|err| self.panicked(&spec, &err));
            run.outcomes.record(spec.agent_number, outcome)?;
        }
        Ok(false)
    }

    /// Returns `true` if cancelled before every level ran.
    async fn run_levels(&self, run: &mut PipelineRun) -> Result<bool> {
        let graph = DependencyGraph::from_specs(&run.specs);
        let levels = graph.levels()?;
        let semaphore = Arc::new(Semaphore::new(self.config.execution.max_workers.max(1)));

        for (index, level) in levels.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            info!(level = index, agents = ?level, "Starting dependency level");
            self.observer
                .on_log(&format!("Level {}: agents {level:?}", index + 1));

            let snapshot = Arc::new(run.clone());
            let mut join_set = JoinSet::new();
            let mut specs_by_task = HashMap::new();
            for agent_number in level {
                let Some(spec) = run.spec(agent_number).cloned() else {
                    continue;
                };
                let pipeline = self.clone();
                let snapshot = Arc::clone(&snapshot);
                let semaphore = Arc::clone(&semaphore);
                let task_spec = spec.clone();
                let handle = join_set.spawn(async move {
                    let permit = semaphore.acquire_owned().await;
                    let outcome = turn::run_turn(pipeline, task_spec, snapshot).await;
                    drop(permit);
                    outcome
                });
                specs_by_task.insert(handle.id(), spec);
            }

            while let Some(joined) = join_set.join_next_with_id().await {
                let (spec, outcome) = match joined {
                    Ok((id, outcome)) => (specs_by_task.get(&id), Ok(outcome)),
                    Err(err) => (specs_by_task.get(&err.id()), Err(err)),
                };
                let Some(spec) = spec else {
                    return Err(Error::Other("finished task has no agent".to_owned()));
                };
                let outcome = outcome.unwrap_or_else(|err| self.panicked(spec, &err));
                run.outcomes.record(spec.agent_number, outcome)?;
            }
        }
        Ok(false)
    }

    fn panicked(&self, spec: &AgentSpec, err: &JoinError) -> AgentOutcome {
        let message = format!("Error: agent {} aborted: {err}", spec.agent_number);
        error!(agent = spec.agent_number, "Agent task aborted: {err}");
        self.observer.on_agent_error(spec.agent_number, &message);
        AgentOutcome::failed(message, ExchangeRecord::not_dispatched(spec))
    }
}

/// Handle to a pipeline running on its own task.
pub struct PipelineHandle {
    cancel: CancellationFlag,
    observer: Arc<dyn Observer>,
    task: JoinHandle<Result<PipelineReport>>,
}

impl PipelineHandle {
    /// Requests cancellation; the run stops before the next agent or level.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the run to finish.
    ///
    /// # Errors
    /// Returns the run's error, or `Error::Other` if the pipeline task itself
    /// panicked; the latter is also reported through
    /// [`Observer::on_fatal_error`].
    pub async fn join(self) -> Result<PipelineReport> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                let message = format!("pipeline task failed: {err}");
                error!("{message}");
                self.observer.on_fatal_error(&message);
                Err(Error::Other(message))
            }
        }
    }
}
