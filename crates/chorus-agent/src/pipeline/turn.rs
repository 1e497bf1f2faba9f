//! One agent's turn: assemble, budget, call, expand tools, follow up.

use std::sync::Arc;

use chorus_context::{AssembledPrompt, Supplements, TokenBudget};
use chorus_core::{
    AgentOutcome, AgentSpec, CompletionRequest, ExchangeRecord, LlmProvider, PipelineRun, Result,
    TokenMode,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::AgentPipeline;
use crate::relay::StreamingRelay;
use crate::tools::{Expansion, ToolInvocationExpander, follow_up_prompt};
use crate::watchdog::{CallOutcome, CallStatus, RetryWatchdog, WatchdogSettings};

/// Text recorded for an agent cancelled while in flight with no partial output.
const CANCELLED_PLACEHOLDER: &str = "[cancelled]";

/// Runs one agent against a snapshot of the run and returns its outcome.
///
/// Every failure inside the turn becomes an error outcome.
pub(super) async fn run_turn(
    pipeline: AgentPipeline,
    spec: AgentSpec,
    run: Arc<PipelineRun>,
) -> AgentOutcome {
    let turn = Turn {
        pipeline,
        spec,
        run,
    };
    match turn.execute().await {
        Ok(outcome) => outcome,
        Err(err) => {
            let spec = &turn.spec;
            let message = format!("Error: {err}");
            warn!(agent = spec.agent_number, "Agent turn failed: {err}");
            turn.pipeline.observer.on_agent_error(spec.agent_number, &message);
            AgentOutcome::failed(message, ExchangeRecord::not_dispatched(spec))
        }
    }
}

struct Turn {
    pipeline: AgentPipeline,
    spec: AgentSpec,
    run: Arc<PipelineRun>,
}

impl Turn {
    async fn execute(&self) -> Result<AgentOutcome> {
        let spec = &self.spec;
        let provider = self.pipeline.registry.get(spec.provider)?;

        let supplements = self.supplements().await;
        let prompt = self.pipeline.assembler.assemble(spec, &self.run, &supplements);
        let budget = self.budget(&prompt);

        info!(
            agent = spec.agent_number,
            provider = %spec.provider,
            model = %spec.model,
            input_tokens = budget.estimated_input_tokens,
            max_tokens = budget.effective_output_tokens,
            "Dispatching agent"
        );
        self.pipeline.observer.on_log(&format!(
            "Agent {} ({}): ~{} input tokens, {} output tokens allowed",
            spec.agent_number,
            spec.model,
            budget.estimated_input_tokens,
            budget.effective_output_tokens
        ));

        let (call, exchange) = self.call(&provider, prompt.text.clone(), &budget).await;
        let outcome = self.outcome(call, exchange);

        if outcome.is_error {
            return Ok(outcome);
        }
        let Some(expander) = self.expander() else {
            return Ok(outcome);
        };

        let expansion = expander.expand(&outcome.text).await;
        if expansion.results.is_empty() {
            return Ok(outcome);
        }
        debug!(
            agent = spec.agent_number,
            resolved = expansion.resolved,
            failed = expansion.failed,
            "Expanded tool directives"
        );

        let is_last = spec.agent_number == self.run.last_agent_number();
        if expansion.has_resolved() && !is_last && self.pipeline.config.execution.tool_follow_up {
            return Ok(self
                .follow_up(&provider, &prompt, &expansion, outcome)
                .await);
        }
        Ok(AgentOutcome {
            text: expansion.text,
            ..outcome
        })
    }

    /// Optional prompt sections; collaborator failures become inline notes.
    async fn supplements(&self) -> Supplements {
        let spec = &self.spec;
        let mut supplements = Supplements::default();
        if let Some(knowledge) = &self.pipeline.knowledge {
            if spec.internet_enabled {
                supplements.web_search = Some(
                    knowledge
                        .web_search(&self.run.prompt)
                        .await
                        .unwrap_or_else(|err| {
                            warn!(agent = spec.agent_number, "Web search failed: {err}");
                            format!("[Web search unavailable: {err}]")
                        }),
                );
            }
            if spec.rag_enabled {
                supplements.retrieved = Some(
                    knowledge
                        .retrieve(&self.run.prompt)
                        .await
                        .unwrap_or_else(|err| {
                            warn!(agent = spec.agent_number, "Retrieval failed: {err}");
                            format!("[Retrieval unavailable: {err}]")
                        }),
                );
            }
        }
        if spec.tool_enabled
            && let Some(tools) = &self.pipeline.tools
        {
            supplements.tools = tools.list_enabled_tools().await;
        }
        supplements
    }

    fn user_cap(&self) -> usize {
        match self.spec.token_mode {
            TokenMode::Dynamic => self.pipeline.config.budget.dynamic_output_cap,
            TokenMode::Manual => self.spec.manual_cap,
        }
    }

    fn budget(&self, prompt: &AssembledPrompt) -> TokenBudget {
        let mut budget = self.pipeline.calculator.budget_for(
            prompt.estimated_tokens,
            prompt.context_window,
            self.spec.provider,
            &self.spec.model,
            self.user_cap(),
        );
        budget.is_precise = prompt.is_precise;
        budget
    }

    fn expander(&self) -> Option<ToolInvocationExpander> {
        if !self.spec.tool_enabled {
            return None;
        }
        self.pipeline
            .tools
            .as_ref()
            .map(|gateway| ToolInvocationExpander::new(Arc::clone(gateway)))
    }

    /// One supervised provider call, relayed to the observer and recorded in
    /// the ledger. Each call gets its own relay, so its first flush is marked
    /// first.
    async fn call(
        &self,
        provider: &Arc<dyn LlmProvider>,
        prompt: String,
        budget: &TokenBudget,
    ) -> (CallOutcome, ExchangeRecord) {
        let config = &self.pipeline.config;
        let request = CompletionRequest {
            model: self.spec.model.clone(),
            prompt,
            max_tokens: budget.effective_output_tokens,
            temperature: config.watchdog.temperature,
            top_p: config.watchdog.top_p,
            stop: Vec::new(),
            stream: true,
        };
        let watchdog = RetryWatchdog::new(
            WatchdogSettings::from_config(config),
            self.pipeline.cancel.clone(),
        );

        let mut relay = StreamingRelay::new(config.relay.clone());
        let observer = &self.pipeline.observer;
        let agent_number = self.spec.agent_number;
        let model = self.spec.model.as_str();
        let call = watchdog
            .call(provider, &request, |chunk| {
                if let Some(flush) = relay.push(chunk) {
                    observer.on_stream_chunk(agent_number, model, &flush.text, flush.is_first);
                }
            })
            .await;
        if let Some(flush) = relay.finish() {
            observer.on_stream_chunk(agent_number, model, &flush.text, flush.is_first);
        }

        let exchange = self.exchange(budget, &call);
        self.pipeline.ledger.record(exchange.clone());
        (call, exchange)
    }

    fn exchange(&self, budget: &TokenBudget, call: &CallOutcome) -> ExchangeRecord {
        let calculator = &self.pipeline.calculator;
        let output = calculator
            .tokenizer()
            .count_tokens(&call.text, &self.spec.model);
        let input_tokens = budget.estimated_input_tokens;
        let cost = calculator
            .catalog()
            .lookup(self.spec.provider, &self.spec.model)
            .cost(input_tokens, output.count);
        ExchangeRecord {
            agent_number: self.spec.agent_number,
            provider: self.spec.provider,
            model: self.spec.model.clone(),
            input_tokens,
            output_tokens: output.count,
            cost,
            duration: call.elapsed,
            is_precise: budget.is_precise && output.is_precise,
            finished_at: Utc::now(),
        }
    }

    fn outcome(&self, call: CallOutcome, exchange: ExchangeRecord) -> AgentOutcome {
        let agent_number = self.spec.agent_number;
        let observer = &self.pipeline.observer;
        match &call.status {
            CallStatus::Completed => {
                info!(
                    agent = agent_number,
                    chunks = call.chunks,
                    elapsed_ms = call.elapsed.as_millis(),
                    "Agent finished"
                );
                observer.on_log(&format!(
                    "Agent {agent_number} finished in {:.1}s",
                    call.elapsed.as_secs_f64()
                ));
                AgentOutcome::completed(call.text, exchange)
            }
            CallStatus::Failed(err) => {
                let message = format!("Error: {err}");
                observer.on_agent_error(agent_number, &message);
                AgentOutcome::failed(message, exchange)
            }
            CallStatus::TimedOut(kind) => {
                let message = format!("Agent {agent_number} hit the {kind}");
                observer.on_agent_error(agent_number, &message);
                AgentOutcome::timed_out(call.timed_out_text(), exchange)
            }
            CallStatus::Cancelled => {
                observer.on_agent_error(agent_number, "Cancelled while in flight");
                let partial = call.text.trim_end();
                let text = if partial.is_empty() {
                    CANCELLED_PLACEHOLDER.to_owned()
                } else {
                    format!("{partial}\n{CANCELLED_PLACEHOLDER}")
                };
                AgentOutcome::cancelled(text, exchange)
            }
        }
    }

    /// Re-asks the agent with its tool results. The follow-up output replaces
    /// the expanded text when it completes; otherwise the expanded text stands.
    async fn follow_up(
        &self,
        provider: &Arc<dyn LlmProvider>,
        prompt: &AssembledPrompt,
        expansion: &Expansion,
        original: AgentOutcome,
    ) -> AgentOutcome {
        let agent_number = self.spec.agent_number;
        let follow_up = follow_up_prompt(&prompt.text, expansion);
        let budget = self.pipeline.calculator.budget(
            &follow_up,
            self.spec.provider,
            &self.spec.model,
            self.user_cap(),
        );
        self.pipeline.observer.on_log(&format!(
            "Agent {agent_number}: follow-up with {} tool result(s)",
            expansion.resolved
        ));

        let (call, exchange) = self.call(provider, follow_up, &budget).await;
        match call.status {
            CallStatus::Completed => AgentOutcome::completed(call.text, exchange),
            status => {
                warn!(agent = agent_number, ?status, "Tool follow-up did not complete");
                AgentOutcome {
                    text: expansion.text.clone(),
                    ..original
                }
            }
        }
    }
}
