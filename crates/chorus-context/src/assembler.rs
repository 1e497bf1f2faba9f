//! Per-agent prompt assembly.
//!
//! The previous-outputs section is held to a share of the target model's
//! context window. When every eligible output fits it is included verbatim;
//! otherwise the most recent output gets half the share, the next 30%, and the
//! older ones split the rest, each truncated or summarized to its allotment.

use core::fmt::Write as _;
use std::sync::Arc;

use chorus_core::{
    AgentSpec, ConversationTurn, ModelCatalog, PipelineRun, ToolDescriptor, Tokenizer,
};
use tracing::debug;

use crate::budget::TokenBudgetCalculator;
use crate::condense::Condenser;

/// Heading of the previous-outputs section.
const PREVIOUS_OUTPUTS_HEADING: &str = "## Previous Agent Outputs";

/// Share of the previous-outputs budget given to the most recent output.
const MOST_RECENT_SHARE: f64 = 0.5;
/// Share given to the second most recent output.
const SECOND_SHARE: f64 = 0.3;
/// Share split among all older outputs.
const OLDER_SHARE: f64 = 0.2;

/// Older outputs whose allotment is smaller than this are omitted.
const MIN_OLDER_ALLOTMENT: usize = 50;

/// One eligible prior outcome as seen by the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorOutput {
    /// Agent that produced it
    pub agent_number: u32,
    /// Model that produced it
    pub model: String,
    /// Recorded text
    pub text: String,
    /// Whether the text is an error or placeholder
    pub is_error: bool,
}

/// Optional sections gathered before assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Supplements {
    /// Rendered web-search results
    pub web_search: Option<String>,
    /// Rendered retrieval chunks
    pub retrieved: Option<String>,
    /// Tools advertised to the agent
    pub tools: Vec<ToolDescriptor>,
}

/// How one prior output was rendered into the section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    /// Included unchanged
    Verbatim,
    /// Cut at a boundary
    Truncated,
    /// Replaced by an extractive summary
    Summarized,
    /// Left out entirely
    Omitted,
}

/// The rendered previous-outputs section and how each output fared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviousOutputs {
    /// Rendered section, empty when there are no eligible outputs
    pub text: String,
    /// Estimated size of `text`
    pub tokens: usize,
    /// Ceiling the section was held to
    pub budget: usize,
    /// `(agent_number, inclusion)` in ascending agent order
    pub inclusions: Vec<(u32, Inclusion)>,
}

impl PreviousOutputs {
    /// Number of outputs left out entirely.
    #[must_use]
    pub fn omitted(&self) -> usize {
        self.inclusions
            .iter()
            .filter(|(_, inclusion)| *inclusion == Inclusion::Omitted)
            .count()
    }

    /// How one agent's output was rendered.
    #[must_use]
    pub fn inclusion_of(&self, agent_number: u32) -> Option<Inclusion> {
        self.inclusions
            .iter()
            .find(|(number, _)| *number == agent_number)
            .map(|(_, inclusion)| *inclusion)
    }
}

/// Fully assembled input for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    /// Prompt text sent to the provider
    pub text: String,
    /// Estimated size of `text`
    pub estimated_tokens: usize,
    /// Whether the estimate came from a precise tokenizer
    pub is_precise: bool,
    /// Total context window of the target model
    pub context_window: usize,
    /// Previous-outputs section details
    pub previous_outputs: PreviousOutputs,
}

/// Builds per-agent prompts. Pure: identical run state yields identical text.
#[derive(Clone)]
pub struct ContextAssembler {
    /// Shared token counting primitive
    tokenizer: Arc<dyn Tokenizer>,
    /// Window lookup
    catalog: ModelCatalog,
    /// Share of the window the previous-outputs section may use
    previous_outputs_share: f64,
    /// Conversation turns kept in the history section
    history_turns: usize,
}

impl ContextAssembler {
    /// Creates an assembler sharing the calculator's tokenizer and catalog.
    #[must_use]
    pub fn new(calculator: &TokenBudgetCalculator, history_turns: usize) -> Self {
        Self {
            tokenizer: Arc::clone(calculator.tokenizer()),
            catalog: calculator.catalog().clone(),
            previous_outputs_share: calculator.config().previous_outputs_share,
            history_turns,
        }
    }

    /// Assembles the input for `spec` from the run's recorded outcomes.
    ///
    /// Only outcomes of agents `spec` depends on are visible, which is always a
    /// subset of lower-numbered agents.
    #[must_use]
    pub fn assemble(
        &self,
        spec: &AgentSpec,
        run: &PipelineRun,
        supplements: &Supplements,
    ) -> AssembledPrompt {
        let window = self.catalog.context_window(spec.provider, &spec.model);
        let prior: Vec<PriorOutput> = run
            .outcomes
            .visible_to(spec)
            .map(|(agent_number, outcome)| PriorOutput {
                agent_number,
                model: outcome.exchange.model.clone(),
                text: outcome.text.clone(),
                is_error: outcome.is_error,
            })
            .collect();

        let previous_outputs = self.previous_outputs(&prior, window, &spec.model);

        let mut sections: Vec<String> = Vec::new();
        if let Some(history) = self.render_history(&run.history) {
            sections.push(history);
        }
        if !previous_outputs.text.is_empty() {
            sections.push(previous_outputs.text.clone());
        }
        if let Some(results) = &supplements.web_search {
            sections.push(format!("## Web Search Results\n{}", results.trim_end()));
        }
        if let Some(chunks) = &supplements.retrieved {
            sections.push(format!("## Retrieved Context\n{}", chunks.trim_end()));
        }
        if !supplements.tools.is_empty() {
            sections.push(render_tools(&supplements.tools));
        }
        sections.push(format!("## Current Request\n{}", run.prompt.trim_end()));
        if !spec.instructions.trim().is_empty() {
            sections.push(format!("## Instructions\n{}", spec.instructions.trim_end()));
        }

        let text = sections.join("\n\n");
        let estimate = self.tokenizer.count_tokens(&text, &spec.model);
        debug!(
            agent = spec.agent_number,
            tokens = estimate.count,
            previous = previous_outputs.tokens,
            omitted = previous_outputs.omitted(),
            "Assembled agent input"
        );

        AssembledPrompt {
            text,
            estimated_tokens: estimate.count,
            is_precise: estimate.is_precise,
            context_window: window,
            previous_outputs,
        }
    }

    /// Token ceiling of the previous-outputs section for a window.
    #[must_use]
    pub fn previous_outputs_budget(&self, window: usize) -> usize {
        (window as f64 * self.previous_outputs_share).floor() as usize
    }

    /// Renders the previous-outputs section for `outputs` (ascending order).
    #[must_use]
    pub fn previous_outputs(
        &self,
        outputs: &[PriorOutput],
        window: usize,
        model: &str,
    ) -> PreviousOutputs {
        let budget = self.previous_outputs_budget(window);
        if outputs.is_empty() {
            return PreviousOutputs {
                budget,
                ..PreviousOutputs::default()
            };
        }

        let condenser = Condenser::new(self.tokenizer.as_ref(), model);
        let verbatim_blocks: Vec<String> = outputs
            .iter()
            .map(|output| render_block(output, &output.text))
            .collect();
        let verbatim = render_section(&verbatim_blocks, 0);
        if condenser.fits(&verbatim, budget) {
            return PreviousOutputs {
                tokens: condenser.count(&verbatim),
                text: verbatim,
                budget,
                inclusions: outputs
                    .iter()
                    .map(|output| (output.agent_number, Inclusion::Verbatim))
                    .collect(),
            };
        }

        self.tiered(outputs, budget, &condenser)
    }

    fn tiered(
        &self,
        outputs: &[PriorOutput],
        budget: usize,
        condenser: &Condenser<'_>,
    ) -> PreviousOutputs {
        let reserved = condenser.count(PREVIOUS_OUTPUTS_HEADING)
            + condenser.count(&omission_note(outputs.len()));
        let distributable = budget.saturating_sub(reserved);
        let allotments = allot(distributable, outputs.len());

        // most recent first
        let mut rendered: Vec<(u32, Inclusion, Option<String>)> = Vec::new();
        for (rank, (output, allotment)) in outputs.iter().rev().zip(allotments).enumerate() {
            let header_tokens = condenser.count(&block_header(output));
            let content_budget = allotment.saturating_sub(header_tokens);
            let is_recent = rank < 2;

            let (inclusion, content) = if !is_recent && allotment < MIN_OLDER_ALLOTMENT {
                (Inclusion::Omitted, None)
            } else if condenser.fits(&output.text, content_budget) {
                (Inclusion::Verbatim, Some(output.text.clone()))
            } else if is_recent {
                (Inclusion::Truncated, Some(condenser.truncate(&output.text, content_budget)))
            } else {
                (Inclusion::Summarized, Some(condenser.summarize(&output.text, content_budget)))
            };

            match content {
                Some(content) if !content.is_empty() => {
                    rendered.push((output.agent_number, inclusion, Some(render_block(output, &content))));
                }
                _ => rendered.push((output.agent_number, Inclusion::Omitted, None)),
            }
        }
        rendered.reverse();

        let omitted = rendered
            .iter()
            .filter(|(_, inclusion, _)| *inclusion == Inclusion::Omitted)
            .count();
        let blocks: Vec<String> = rendered
            .iter()
            .filter_map(|(_, _, block)| block.clone())
            .collect();
        let mut text = render_section(&blocks, omitted);

        if !condenser.fits(&text, budget) {
            debug!(budget, "Previous outputs section over budget after allocation; trimming");
            text = condenser.truncate(&text, budget);
        }

        PreviousOutputs {
            tokens: condenser.count(&text),
            text,
            budget,
            inclusions: rendered
                .into_iter()
                .map(|(number, inclusion, _)| (number, inclusion))
                .collect(),
        }
    }

    fn render_history(&self, history: &[ConversationTurn]) -> Option<String> {
        if history.is_empty() || self.history_turns == 0 {
            return None;
        }
        let start = history.len().saturating_sub(self.history_turns);
        let mut rendered = String::from("## Conversation History");
        for turn in &history[start..] {
            write!(rendered, "\n{}: {}", turn.role.label(), turn.content.trim_end()).unwrap_or(());
        }
        Some(rendered)
    }
}

/// Splits `distributable` tokens across `count` outputs, most recent first.
///
/// Shares not claimed by missing ranks go to the most recent output.
fn allot(distributable: usize, count: usize) -> Vec<usize> {
    let share = |fraction: f64| (distributable as f64 * fraction).floor() as usize;
    match count {
        0 => Vec::new(),
        1 => vec![distributable],
        2 => vec![share(MOST_RECENT_SHARE + OLDER_SHARE), share(SECOND_SHARE)],
        _ => {
            let older = count - 2;
            let each_older = share(OLDER_SHARE) / older;
            let mut allotments = vec![share(MOST_RECENT_SHARE), share(SECOND_SHARE)];
            allotments.extend(core::iter::repeat_n(each_older, older));
            allotments
        }
    }
}

fn block_header(output: &PriorOutput) -> String {
    if output.is_error {
        format!("--- Agent {} ({}) [error] ---", output.agent_number, output.model)
    } else {
        format!("--- Agent {} ({}) ---", output.agent_number, output.model)
    }
}

fn render_block(output: &PriorOutput, content: &str) -> String {
    format!("{}\n{}", block_header(output), content.trim_end())
}

fn omission_note(omitted: usize) -> String {
    format!("[{omitted} earlier agent output(s) omitted to fit the context window]")
}

fn render_section(blocks: &[String], omitted: usize) -> String {
    let mut section = String::from(PREVIOUS_OUTPUTS_HEADING);
    if omitted > 0 {
        section.push('\n');
        section.push_str(&omission_note(omitted));
    }
    for block in blocks {
        section.push('\n');
        section.push_str(block);
    }
    section
}

fn render_tools(tools: &[ToolDescriptor]) -> String {
    let mut rendered = String::from(
        "## Available Tools\nInvoke a tool by writing [TOOL:Name:request] in your answer, \
         or [TOOL:Auto:request] to let the best tool be chosen.",
    );
    for tool in tools {
        write!(rendered, "\n- {}", tool.name).unwrap_or(());
        if !tool.capabilities.is_empty() {
            write!(rendered, " ({})", tool.capabilities.join(", ")).unwrap_or(());
        }
        if !tool.description.is_empty() {
            write!(rendered, ": {}", tool.description).unwrap_or(());
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condense::{SUMMARY_PREFIX, TRUNCATION_MARKER};
    use crate::WordCountTokenizer;
    use chorus_core::{
        AgentOutcome, BudgetConfig, ExchangeRecord, ProviderKind, Role,
    };

    fn assembler() -> ContextAssembler {
        let calculator = TokenBudgetCalculator::new(
            ModelCatalog::default(),
            BudgetConfig::default(),
            Arc::new(WordCountTokenizer),
        );
        ContextAssembler::new(&calculator, 10)
    }

    fn prior(agent_number: u32, text: String) -> PriorOutput {
        PriorOutput {
            agent_number,
            model: "m".to_owned(),
            text,
            is_error: false,
        }
    }

    fn count(text: &str) -> usize {
        crate::estimate_tokens(text)
    }

    #[test]
    fn test_allot_shares() {
        assert_eq!(allot(1_000, 1), vec![1_000]);
        assert_eq!(allot(1_000, 2), vec![700, 300]);
        assert_eq!(allot(1_000, 4), vec![500, 300, 100, 100]);
    }

    #[test]
    fn test_verbatim_when_everything_fits() {
        let outputs = vec![prior(1, "first answer".to_owned()), prior(2, "second answer".to_owned())];
        let section = assembler().previous_outputs(&outputs, 20_000, "m");
        assert_eq!(section.budget, 12_000);
        assert_eq!(
            section.text,
            "## Previous Agent Outputs\n--- Agent 1 (m) ---\nfirst answer\n--- Agent 2 (m) ---\nsecond answer"
        );
        assert_eq!(section.omitted(), 0);
        assert_eq!(section.inclusion_of(1), Some(Inclusion::Verbatim));
    }

    #[test]
    fn test_tiered_truncates_recent_and_summarizes_older() {
        let long = |tag: &str| format!("{tag} padding sentence here. ").repeat(150);
        let outputs = vec![
            prior(1, format!("The key result is caching. {}", long("one"))),
            prior(2, long("two")),
            prior(3, long("three")),
        ];
        // window 1000 -> 600 token section
        let section = assembler().previous_outputs(&outputs, 1_000, "m");
        assert!(section.tokens <= 600);
        assert_eq!(section.inclusion_of(3), Some(Inclusion::Truncated));
        assert_eq!(section.inclusion_of(2), Some(Inclusion::Truncated));
        assert_eq!(section.inclusion_of(1), Some(Inclusion::Summarized));
        assert!(section.text.contains(TRUNCATION_MARKER));
        assert!(section.text.contains(SUMMARY_PREFIX));
        assert!(section.text.contains("The key result is caching."));
        // most recent last
        let first = section.text.find("--- Agent 1").unwrap();
        let third = section.text.find("--- Agent 3").unwrap();
        assert!(first < third);
    }

    #[test]
    fn test_small_older_shares_are_omitted_with_note() {
        let big = "filler words repeated again. ".repeat(200);
        let outputs: Vec<PriorOutput> = (1..=8).map(|number| prior(number, big.clone())).collect();
        // 600-token section, older pool ~120 tokens over 6 outputs
        let section = assembler().previous_outputs(&outputs, 1_000, "m");
        assert_eq!(section.omitted(), 6);
        assert!(section.text.contains("[6 earlier agent output(s) omitted"));
        assert!(section.tokens <= section.budget);
    }

    #[test]
    fn test_assemble_orders_sections_and_filters_future_outcomes() {
        let specs = vec![
            AgentSpec::new(1, ProviderKind::Mock, "m"),
            AgentSpec::new(2, ProviderKind::Mock, "m").with_instructions("Be brief."),
            AgentSpec::new(3, ProviderKind::Mock, "m"),
        ];
        let mut run = PipelineRun::new(
            specs,
            "What is best?",
            vec![ConversationTurn::new(Role::User, "hello")],
        )
        .unwrap();
        for number in [1, 3] {
            let spec = run.spec(number).unwrap().clone();
            run.outcomes
                .record(
                    number,
                    AgentOutcome::completed(
                        format!("answer from {number}"),
                        ExchangeRecord::not_dispatched(&spec),
                    ),
                )
                .unwrap();
        }

        let spec = run.spec(2).unwrap().clone();
        let prompt = assembler().assemble(&spec, &run, &Supplements::default());
        assert!(prompt.text.contains("answer from 1"));
        assert!(!prompt.text.contains("answer from 3"));

        let history = prompt.text.find("## Conversation History").unwrap();
        let previous = prompt.text.find("## Previous Agent Outputs").unwrap();
        let request = prompt.text.find("## Current Request").unwrap();
        let instructions = prompt.text.find("## Instructions").unwrap();
        assert!(history < previous && previous < request && request < instructions);
        assert_eq!(prompt.estimated_tokens, count(&prompt.text));
    }

    #[test]
    fn test_assemble_renders_supplements() {
        let run = PipelineRun::new(
            vec![AgentSpec::new(1, ProviderKind::Mock, "m").with_tools()],
            "find it",
            Vec::new(),
        )
        .unwrap();
        let supplements = Supplements {
            web_search: Some("result one".to_owned()),
            retrieved: Some("chunk one".to_owned()),
            tools: vec![ToolDescriptor {
                name: "Search".to_owned(),
                capabilities: vec!["search".to_owned(), "web".to_owned()],
                description: "Web search".to_owned(),
            }],
        };
        let prompt = assembler().assemble(&run.specs[0], &run, &supplements);
        assert!(prompt.text.contains("## Web Search Results\nresult one"));
        assert!(prompt.text.contains("## Retrieved Context\nchunk one"));
        assert!(prompt.text.contains("- Search (search, web): Web search"));
        assert!(!prompt.text.contains("## Previous Agent Outputs"));
    }

    #[test]
    fn test_history_keeps_last_turns() {
        let calculator = TokenBudgetCalculator::new(
            ModelCatalog::default(),
            BudgetConfig::default(),
            Arc::new(WordCountTokenizer),
        );
        let assembler = ContextAssembler::new(&calculator, 2);
        let history: Vec<ConversationTurn> = (0..5)
            .map(|index| ConversationTurn::new(Role::User, format!("turn {index}")))
            .collect();
        let rendered = assembler.render_history(&history).unwrap();
        assert!(!rendered.contains("turn 2"));
        assert!(rendered.contains("User: turn 3\nUser: turn 4"));
    }
}
