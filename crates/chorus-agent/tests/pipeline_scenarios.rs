//! Integration tests for `AgentPipeline`.
//!
//! Covers tool expansion between agents, timeouts and retries inside a run,
//! dependency-level concurrency, ordering, cancellation, and per-agent failure
//! handling.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::print_stdout,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use core::result::Result as CoreResult;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chorus_agent::{AgentPipeline, CancellationFlag, InMemoryLedger, TIMEOUT_PLACEHOLDER};
use chorus_context::{ContextAssembler, Supplements, TokenBudgetCalculator, WordCountTokenizer};
use chorus_core::{
    AgentSpec, ChannelObserver, ChorusConfig, Error, ExecutionMode, KnowledgeSource, Observer,
    OutcomeStatus, PipelineEvent, PipelineRun, ProviderError, ProviderKind, Result, ToolDescriptor,
    ToolError, ToolGateway,
};
use chorus_providers::{MockProvider, MockReply, ProviderRegistry};
use tokio::sync::mpsc::UnboundedReceiver;

/// Tool gateway answering from a fixed table.
struct TableGateway {
    answers: HashMap<String, String>,
}

impl TableGateway {
    fn with(name: &str, answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answers: HashMap::from([(name.to_owned(), answer.to_owned())]),
        })
    }
}

#[async_trait]
impl ToolGateway for TableGateway {
    async fn list_enabled_tools(&self) -> Vec<ToolDescriptor> {
        self.answers
            .keys()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                capabilities: vec!["web".to_owned()],
                description: format!("{name} tool"),
            })
            .collect()
    }

    async fn invoke(&self, name: &str, _request: &str) -> CoreResult<String, ToolError> {
        self.answers
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_owned()))
    }
}

/// Knowledge source whose search fails and whose retrieval succeeds.
struct HalfBrokenKnowledge;

#[async_trait]
impl KnowledgeSource for HalfBrokenKnowledge {
    async fn web_search(&self, _query: &str) -> Result<String> {
        Err(Error::Other("search backend offline".to_owned()))
    }

    async fn retrieve(&self, _query: &str) -> Result<String> {
        Ok("chunk: ownership rules".to_owned())
    }
}

/// Observer that requests cancellation on the first streamed chunk.
struct CancelOnFirstChunk {
    flag: CancellationFlag,
}

impl Observer for CancelOnFirstChunk {
    fn on_stream_chunk(&self, _agent_number: u32, _model: &str, _text: &str, _is_first: bool) {
        self.flag.cancel();
    }

    fn on_log(&self, _message: &str) {}

    fn on_agent_error(&self, _agent_number: u32, _message: &str) {}

    fn on_complete(&self) {}

    fn on_fatal_error(&self, _message: &str) {}
}

fn agent(number: u32) -> AgentSpec {
    AgentSpec::new(number, ProviderKind::Mock, format!("m{number}"))
}

fn config() -> ChorusConfig {
    let mut config = ChorusConfig::default();
    config.watchdog.inactivity_timeout_secs = 2;
    config.watchdog.overall_timeout_secs = 30;
    config.execution.max_workers = 4;
    config
}

fn build_pipeline(
    config: ChorusConfig,
    provider: &MockProvider,
) -> (AgentPipeline, UnboundedReceiver<PipelineEvent>) {
    let registry = ProviderRegistry::new().with_provider(Arc::new(provider.clone()));
    let (observer, events) = ChannelObserver::new();
    (AgentPipeline::new(config, registry, Arc::new(observer)), events)
}

fn drain(events: &mut UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn prompt_of(provider: &MockProvider, model: &str) -> String {
    provider.calls_for(model)[0].prompt.clone()
}

#[tokio::test]
async fn test_tool_result_reaches_later_agents() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::text("Agent one found the root cause."))
        .with_reply("m2", MockReply::text("Checking: [TOOL:Search:foo] done."))
        .with_reply("m3", MockReply::text("Final answer."));
    let mut config = config();
    config.execution.tool_follow_up = false;
    let (pipeline, _events) = build_pipeline(config, &provider);
    let pipeline = pipeline.with_tool_gateway(TableGateway::with("Search", "bar"));

    let specs = vec![agent(1), agent(2).with_tools(), agent(3)];
    let report = pipeline
        .run(PipelineRun::new(specs, "Investigate", Vec::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(report.outcome(2).unwrap().text, "Checking: bar done.");
    let third_input = prompt_of(&provider, "m3");
    assert!(third_input.contains("Agent one found the root cause."));
    assert!(third_input.contains("Checking: bar done."));
    assert!(!third_input.contains("[TOOL:Search:foo]"));
    assert_eq!(report.final_text, "Final answer.");
}

#[tokio::test]
async fn test_tool_follow_up_replaces_outcome() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::text("Let me check [SEARCH:weather]"))
        .with_reply("m1", MockReply::text("It is sunny."))
        .with_reply("m2", MockReply::text("Pack sunglasses."));
    let ledger = Arc::new(InMemoryLedger::new());
    let (pipeline, _events) = build_pipeline(config(), &provider);
    let pipeline = pipeline
        .with_tool_gateway(TableGateway::with("Search", "sunny, 25C"))
        .with_ledger(Arc::<InMemoryLedger>::clone(&ledger));

    let report = pipeline
        .run(PipelineRun::new(vec![agent(1).with_tools(), agent(2)], "Weather?", Vec::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(report.outcome(1).unwrap().text, "It is sunny.");
    let calls = provider.calls_for("m1");
    assert_eq!(calls.len(), 2);
    assert!(calls[1].prompt.contains("## Tool Results"));
    assert!(calls[1].prompt.contains("sunny, 25C"));
    assert!(prompt_of(&provider, "m2").contains("It is sunny."));
    assert_eq!(ledger.totals().calls, 3);
    assert_eq!(ledger.for_agent(1).len(), 2);
}

#[tokio::test]
async fn test_last_agent_gets_no_follow_up() {
    let provider = MockProvider::new().with_reply("m1", MockReply::text("See [SEARCH:x]"));
    let (pipeline, _events) = build_pipeline(config(), &provider);
    let pipeline = pipeline.with_tool_gateway(TableGateway::with("Search", "y"));

    let report = pipeline
        .run(PipelineRun::new(vec![agent(1).with_tools()], "Q", Vec::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(report.final_text, "See y");
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_agent_times_out_and_run_continues() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::stall_after("partial thought", Duration::ZERO))
        .with_reply("m2", MockReply::text("Second agent answers."));
    let (pipeline, mut events) = build_pipeline(config(), &provider);

    let report = pipeline
        .run(PipelineRun::new(vec![agent(1), agent(2)], "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    let first = report.outcome(1).unwrap();
    assert_eq!(first.status, OutcomeStatus::TimedOut);
    assert!(first.is_error);
    assert!(first.text.starts_with("partial thought"));
    assert!(first.text.ends_with(TIMEOUT_PLACEHOLDER));
    assert!(first.exchange.duration >= Duration::from_secs(2));
    assert!(first.exchange.duration < Duration::from_secs(4));

    assert_eq!(report.final_text, "Second agent answers.");
    let events = drain(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        PipelineEvent::AgentError { agent_number: 1, .. }
    )));
    assert_eq!(events.last(), Some(&PipelineEvent::Complete));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_agent_recovers() {
    let limited = || {
        MockReply::reject(ProviderError::RateLimited {
            message: "busy".to_owned(),
            retry_after: None,
        })
    };
    let provider = MockProvider::new()
        .with_reply("m1", limited())
        .with_reply("m1", limited())
        .with_reply("m1", MockReply::text("Recovered."));
    let (pipeline, _events) = build_pipeline(config(), &provider);

    let report = pipeline
        .run(PipelineRun::new(vec![agent(1)], "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    let outcome = report.outcome(1).unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(outcome.text, "Recovered.");
    assert!(outcome.exchange.duration >= Duration::from_secs(3));
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_dependency_level_runs_siblings_concurrently() {
    let slow = || MockReply::chunks(["one ", "two ", "three"], Duration::from_millis(500));
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::text("Shared groundwork."))
        .with_reply("m2", slow())
        .with_reply("m3", slow());
    let mut config = config();
    config.execution.mode = ExecutionMode::DependencyLevels;
    let (pipeline, _events) = build_pipeline(config, &provider);

    let specs = vec![
        agent(1),
        agent(2).with_dependencies(vec![1]),
        agent(3).with_dependencies(vec![1]),
    ];
    let report = pipeline
        .run(PipelineRun::new(specs, "Plan", Vec::new()).unwrap())
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 3);

    let first = &provider.calls_for("m1")[0];
    let second = &provider.calls_for("m2")[0];
    let third = &provider.calls_for("m3")[0];
    let first_end = first.finished_at.unwrap();
    let second_end = second.finished_at.unwrap();
    let third_end = third.finished_at.unwrap();

    assert!(second.started_at >= first_end);
    assert!(third.started_at >= first_end);
    assert!(second.started_at < third_end);
    assert!(third.started_at < second_end);

    // siblings only see their declared dependency
    let third_input = prompt_of(&provider, "m3");
    assert!(third_input.contains("Shared groundwork."));
    assert!(!third_input.contains("one two three"));
}

#[tokio::test]
async fn test_agents_only_see_earlier_outcomes() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::text("ALPHA"))
        .with_reply("m2", MockReply::text("BRAVO"))
        .with_reply("m3", MockReply::text("CHARLIE"));
    let (pipeline, _events) = build_pipeline(config(), &provider);

    pipeline
        .run(PipelineRun::new(vec![agent(1), agent(2), agent(3)], "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    let first = prompt_of(&provider, "m1");
    assert!(!first.contains("ALPHA") && !first.contains("BRAVO"));
    let second = prompt_of(&provider, "m2");
    assert!(second.contains("ALPHA") && !second.contains("BRAVO") && !second.contains("CHARLIE"));
    let third = prompt_of(&provider, "m3");
    assert!(third.contains("ALPHA") && third.contains("BRAVO") && !third.contains("CHARLIE"));
}

#[tokio::test]
async fn test_reassembly_is_byte_identical() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::text("First output."))
        .with_reply("m2", MockReply::text("Second output."));
    let (pipeline, _events) = build_pipeline(config(), &provider);
    let specs = vec![agent(1), agent(2), agent(3)];
    let report = pipeline
        .run(PipelineRun::new(specs.clone(), "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    let mut run = PipelineRun::new(specs, "Go", Vec::new()).unwrap();
    run.outcomes = report.outcomes;
    let calculator = TokenBudgetCalculator::new(
        ChorusConfig::default().catalog(),
        ChorusConfig::default().budget,
        Arc::new(WordCountTokenizer),
    );
    let assembler = ContextAssembler::new(&calculator, 10);
    let spec = run.spec(3).unwrap().clone();
    let once = assembler.assemble(&spec, &run, &Supplements::default());
    let twice = assembler.assemble(&spec, &run, &Supplements::default());
    assert_eq!(once.text, twice.text);
}

#[tokio::test]
async fn test_cancellation_stops_before_next_agent() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::chunks(["a", "b", "c"], Duration::from_millis(10)));
    let cancel = CancellationFlag::new();
    let registry = ProviderRegistry::new().with_provider(Arc::new(provider.clone()));
    let observer = Arc::new(CancelOnFirstChunk { flag: cancel.clone() });
    let pipeline = AgentPipeline::new(config(), registry, observer).with_cancellation(cancel);

    let report = pipeline
        .run(PipelineRun::new(vec![agent(1), agent(2), agent(3)], "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    assert!(report.cancelled);
    // the in-flight agent finishes normally
    assert_eq!(report.outcome(1).unwrap().text, "abc");
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_can_abort_in_flight_call() {
    let provider =
        MockProvider::new().with_reply("m1", MockReply::stall_after("half", Duration::ZERO));
    let cancel = CancellationFlag::new();
    let registry = ProviderRegistry::new().with_provider(Arc::new(provider.clone()));
    let observer = Arc::new(CancelOnFirstChunk { flag: cancel.clone() });
    let mut config = config();
    config.execution.abort_in_flight_on_cancel = true;
    config.watchdog.inactivity_timeout_secs = 60;
    config.watchdog.overall_timeout_secs = 120;
    let pipeline = AgentPipeline::new(config, registry, observer).with_cancellation(cancel);

    let report = pipeline
        .run(PipelineRun::new(vec![agent(1), agent(2)], "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    let first = report.outcome(1).unwrap();
    assert_eq!(first.status, OutcomeStatus::Cancelled);
    assert!(first.text.starts_with("half"));
    assert!(first.exchange.duration < Duration::from_secs(5));
    assert!(report.outcome(2).is_none());
}

#[tokio::test]
async fn test_spawned_pipeline_cancelled_before_start() {
    let provider = MockProvider::new();
    let (pipeline, mut events) = build_pipeline(config(), &provider);
    pipeline.cancel();
    let handle = pipeline.spawn(PipelineRun::new(vec![agent(1)], "Go", Vec::new()).unwrap());
    assert!(handle.is_cancelled());

    let report = handle.join().await.unwrap();
    assert!(report.cancelled);
    assert!(report.outcomes.is_empty());
    assert_eq!(report.final_text, "");
    assert_eq!(provider.call_count(), 0);
    assert_eq!(drain(&mut events).last(), Some(&PipelineEvent::Complete));
}

#[tokio::test]
async fn test_unregistered_provider_is_an_agent_error() {
    let provider = MockProvider::new().with_reply("m2", MockReply::text("Still here."));
    let (pipeline, mut events) = build_pipeline(config(), &provider);
    let specs = vec![AgentSpec::new(1, ProviderKind::Groq, "llama-3.3-70b-versatile"), agent(2)];

    let report = pipeline
        .run(PipelineRun::new(specs, "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    let first = report.outcome(1).unwrap();
    assert!(first.is_error);
    assert_eq!(first.status, OutcomeStatus::Failed);
    assert!(first.text.contains("no provider registered for 'groq'"));
    assert_eq!(first.exchange.input_tokens, 0);
    assert_eq!(report.final_text, "Still here.");
    // the failure is visible to the next agent as an error output
    assert!(prompt_of(&provider, "m2").contains("no provider registered"));
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        PipelineEvent::AgentError { agent_number: 1, .. }
    )));
}

#[tokio::test]
async fn test_permanent_error_is_recorded_without_retry() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::reject(ProviderError::BadRequest("bad model".to_owned())));
    let ledger = Arc::new(InMemoryLedger::new());
    let (pipeline, _events) = build_pipeline(config(), &provider);
    let pipeline = pipeline.with_ledger(Arc::<InMemoryLedger>::clone(&ledger));

    let report = pipeline
        .run(PipelineRun::new(vec![agent(1)], "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(report.final_text, "Error: bad request: bad model");
    assert_eq!(provider.call_count(), 1);
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn test_output_cap_follows_token_mode() {
    let provider = MockProvider::new();
    let (pipeline, _events) = build_pipeline(config(), &provider);
    let specs = vec![agent(1), agent(2).with_manual_cap(500)];

    pipeline
        .run(PipelineRun::new(specs, "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(provider.calls_for("m1")[0].max_tokens, 8_192);
    assert_eq!(provider.calls_for("m2")[0].max_tokens, 500);
}

#[tokio::test]
async fn test_knowledge_failures_are_inlined() {
    let provider = MockProvider::new();
    let (pipeline, _events) = build_pipeline(config(), &provider);
    let pipeline = pipeline.with_knowledge_source(Arc::new(HalfBrokenKnowledge));
    let mut spec = agent(1);
    spec.internet_enabled = true;
    spec.rag_enabled = true;

    let report = pipeline
        .run(PipelineRun::new(vec![spec], "Explain borrowing", Vec::new()).unwrap())
        .await
        .unwrap();

    assert!(!report.outcome(1).unwrap().is_error);
    let input = prompt_of(&provider, "m1");
    assert!(input.contains("[Web search unavailable: search backend offline]"));
    assert!(input.contains("## Retrieved Context\nchunk: ownership rules"));
}

#[tokio::test]
async fn test_stream_chunks_reach_observer_in_order() {
    let provider = MockProvider::new().with_reply(
        "m1",
        MockReply::words("The quick brown fox jumps over the lazy dog", Duration::ZERO),
    );
    let (pipeline, mut events) = build_pipeline(config(), &provider);

    pipeline
        .run(PipelineRun::new(vec![agent(1)], "Go", Vec::new()).unwrap())
        .await
        .unwrap();

    let chunks: Vec<(String, bool)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::StreamChunk { text, is_first, .. } => Some((text, is_first)),
            _ => None,
        })
        .collect();
    assert!(chunks[0].1);
    assert!(chunks.iter().skip(1).all(|(_, is_first)| !is_first));
    let joined: String = chunks.into_iter().map(|(text, _)| text).collect();
    assert_eq!(joined, "The quick brown fox jumps over the lazy dog");
}

#[tokio::test]
async fn test_follow_up_streams_as_a_new_message() {
    let provider = MockProvider::new()
        .with_reply("m1", MockReply::text("Let me check [SEARCH:weather]"))
        .with_reply("m1", MockReply::text("It is sunny."))
        .with_reply("m2", MockReply::text("Pack sunglasses."));
    let (pipeline, mut events) = build_pipeline(config(), &provider);
    let pipeline = pipeline.with_tool_gateway(TableGateway::with("Search", "sunny, 25C"));

    pipeline
        .run(PipelineRun::new(vec![agent(1).with_tools(), agent(2)], "Weather?", Vec::new()).unwrap())
        .await
        .unwrap();

    let first_agent: Vec<(String, bool)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::StreamChunk {
                agent_number: 1,
                text,
                is_first,
                ..
            } => Some((text, is_first)),
            PipelineEvent::Log { message } if message.contains("follow-up") => {
                Some((message, false))
            }
            _ => None,
        })
        .collect();

    let marker = first_agent
        .iter()
        .position(|(text, _)| text.contains("follow-up"))
        .unwrap();
    assert!(first_agent[0].1);
    assert!(first_agent[..marker].iter().all(|(text, _)| !text.contains("sunny")));
    let follow_up = &first_agent[marker + 1..];
    assert!(follow_up[0].1);
    let streamed: String = follow_up.iter().map(|(text, _)| text.as_str()).collect();
    assert_eq!(streamed, "It is sunny.");
}
