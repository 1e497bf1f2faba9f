//! Data model shared by every stage of a pipeline run.

use core::time::Duration;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;
use crate::{Error, Result};

/// Smallest output allowance a call may be given.
pub const OUTPUT_TOKEN_FLOOR: usize = 100;

/// Default manual output cap for agents that do not set one.
const DEFAULT_MANUAL_CAP: usize = 4_096;

/// How an agent's output allowance is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenMode {
    /// Sized from the remaining context window, capped by the configured dynamic cap
    #[default]
    Dynamic,
    /// Sized from the remaining context window, capped by the agent's `manual_cap`
    Manual,
}

/// One configured participant in a pipeline run. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Capability flags mirror the agent configuration surface"
)]
pub struct AgentSpec {
    /// Ordinal position; defines sequence and dependency eligibility
    pub agent_number: u32,
    /// Vendor serving this agent
    pub provider: ProviderKind,
    /// Model identifier passed to the provider
    pub model: String,
    /// Agent-specific instructions
    #[serde(default)]
    pub instructions: String,
    /// Whether a web-search section is added to this agent's input
    #[serde(default)]
    pub internet_enabled: bool,
    /// Whether a retrieval section is added to this agent's input
    #[serde(default)]
    pub rag_enabled: bool,
    /// Whether tool directives are advertised and expanded for this agent
    #[serde(default)]
    pub tool_enabled: bool,
    /// Output allowance mode
    #[serde(default)]
    pub token_mode: TokenMode,
    /// Output cap used in manual mode
    #[serde(default = "default_manual_cap")]
    pub manual_cap: usize,
    /// Agents whose outcomes this agent needs; `None` means every predecessor
    #[serde(default)]
    pub depends_on: Option<Vec<u32>>,
}

const fn default_manual_cap() -> usize {
    DEFAULT_MANUAL_CAP
}

impl AgentSpec {
    /// Creates a spec with default flags and dynamic token mode.
    pub fn new(agent_number: u32, provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            agent_number,
            provider,
            model: model.into(),
            instructions: String::new(),
            internet_enabled: false,
            rag_enabled: false,
            tool_enabled: false,
            token_mode: TokenMode::Dynamic,
            manual_cap: DEFAULT_MANUAL_CAP,
            depends_on: None,
        }
    }

    /// Sets the agent instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Restricts this agent to the given predecessors.
    #[must_use]
    pub fn with_dependencies(mut self, depends_on: Vec<u32>) -> Self {
        self.depends_on = Some(depends_on);
        self
    }

    /// Enables tool directives for this agent.
    #[must_use]
    pub fn with_tools(mut self) -> Self {
        self.tool_enabled = true;
        self
    }

    /// Switches to manual token mode with the given cap.
    #[must_use]
    pub fn with_manual_cap(mut self, cap: usize) -> Self {
        self.token_mode = TokenMode::Manual;
        self.manual_cap = cap;
        self
    }

    /// Agents whose outcomes must be recorded before this one may run.
    #[must_use]
    pub fn dependencies(&self) -> Vec<u32> {
        self.depends_on
            .clone()
            .unwrap_or_else(|| (1..self.agent_number).collect())
    }

    /// Returns `true` when `other` is an eligible predecessor of this agent.
    #[must_use]
    pub fn depends_on_agent(&self, other: u32) -> bool {
        other < self.agent_number
            && self
                .depends_on
                .as_ref()
                .is_none_or(|deps| deps.contains(&other))
    }

    /// Rejects malformed specs before dispatch.
    ///
    /// # Errors
    /// Returns `Error::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.agent_number == 0 {
            return Err(Error::Validation("agent_number must start at 1".to_owned()));
        }
        if self.model.trim().is_empty() {
            return Err(Error::Validation(format!(
                "agent {} has an empty model id",
                self.agent_number
            )));
        }
        if self.token_mode == TokenMode::Manual && self.manual_cap < OUTPUT_TOKEN_FLOOR {
            return Err(Error::Validation(format!(
                "agent {} manual_cap {} is below the {OUTPUT_TOKEN_FLOOR}-token floor",
                self.agent_number, self.manual_cap
            )));
        }
        if let Some(deps) = &self.depends_on
            && let Some(bad) = deps
                .iter()
                .find(|dep| **dep == 0 || **dep >= self.agent_number)
        {
            return Err(Error::Validation(format!(
                "agent {} cannot depend on agent {bad}",
                self.agent_number
            )));
        }
        Ok(())
    }
}

/// Speaker of a conversation history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person asking
    User,
    /// A previous pipeline answer
    Assistant,
    /// Out-of-band system note
    System,
}

impl Role {
    /// Label used when rendering history into a prompt.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::System => "System",
        }
    }
}

/// One prior exchange in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Who said it
    pub role: Role,
    /// What was said
    pub content: String,
}

impl ConversationTurn {
    /// Creates a history entry.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Accounting for one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// Agent that made the call
    pub agent_number: u32,
    /// Vendor that served it
    pub provider: ProviderKind,
    /// Model that served it
    pub model: String,
    /// Tokens sent
    pub input_tokens: usize,
    /// Tokens received
    pub output_tokens: usize,
    /// Estimated cost in USD
    pub cost: f64,
    /// Wall time from dispatch to termination
    pub duration: Duration,
    /// Whether the token counts came from a precise tokenizer
    pub is_precise: bool,
    /// When the call terminated
    pub finished_at: DateTime<Utc>,
}

impl ExchangeRecord {
    /// Zeroed record for an agent that never reached a provider.
    #[must_use]
    pub fn not_dispatched(spec: &AgentSpec) -> Self {
        Self {
            agent_number: spec.agent_number,
            provider: spec.provider,
            model: spec.model.clone(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            duration: Duration::ZERO,
            is_precise: false,
            finished_at: Utc::now(),
        }
    }
}

/// How an agent's turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// The call finished and produced text
    Completed,
    /// The call or its preparation failed
    Failed,
    /// A watchdog timeout fired
    TimedOut,
    /// The run was cancelled while this agent was in flight
    Cancelled,
}

/// Recorded result of one agent's turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    /// Final text (possibly a placeholder or error string)
    pub text: String,
    /// Whether `text` describes a failure rather than an answer
    pub is_error: bool,
    /// How the turn ended
    pub status: OutcomeStatus,
    /// Accounting for the call that produced this outcome
    pub exchange: ExchangeRecord,
}

impl AgentOutcome {
    /// Successful outcome.
    #[must_use]
    pub fn completed(text: String, exchange: ExchangeRecord) -> Self {
        Self {
            text,
            is_error: false,
            status: OutcomeStatus::Completed,
            exchange,
        }
    }

    /// Failed outcome carrying an error string.
    #[must_use]
    pub fn failed(text: String, exchange: ExchangeRecord) -> Self {
        Self {
            text,
            is_error: true,
            status: OutcomeStatus::Failed,
            exchange,
        }
    }

    /// Timed-out outcome carrying a placeholder.
    #[must_use]
    pub fn timed_out(text: String, exchange: ExchangeRecord) -> Self {
        Self {
            text,
            is_error: true,
            status: OutcomeStatus::TimedOut,
            exchange,
        }
    }

    /// Cancelled outcome.
    #[must_use]
    pub fn cancelled(text: String, exchange: ExchangeRecord) -> Self {
        Self {
            text,
            is_error: true,
            status: OutcomeStatus::Cancelled,
            exchange,
        }
    }
}

/// `agent_number → outcome`, written at most once per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMap {
    outcomes: BTreeMap<u32, AgentOutcome>,
}

impl OutcomeMap {
    /// Records an outcome.
    ///
    /// # Errors
    /// Returns an error if an outcome already exists for this agent.
    pub fn record(&mut self, agent_number: u32, outcome: AgentOutcome) -> Result<()> {
        match self.outcomes.entry(agent_number) {
            Entry::Vacant(slot) => {
                slot.insert(outcome);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::Other(format!(
                "outcome for agent {agent_number} already recorded"
            ))),
        }
    }

    /// Outcome for one agent.
    #[must_use]
    pub fn get(&self, agent_number: u32) -> Option<&AgentOutcome> {
        self.outcomes.get(&agent_number)
    }

    /// Whether an outcome exists for this agent.
    #[must_use]
    pub fn contains(&self, agent_number: u32) -> bool {
        self.outcomes.contains_key(&agent_number)
    }

    /// Number of recorded outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Outcomes in ascending agent order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &AgentOutcome)> {
        self.outcomes.iter().map(|(number, outcome)| (*number, outcome))
    }

    /// Outcomes the given agent is allowed to see, ascending.
    pub fn visible_to<'map>(
        &'map self,
        spec: &'map AgentSpec,
    ) -> impl Iterator<Item = (u32, &'map AgentOutcome)> {
        self.iter()
            .filter(|(number, _)| spec.depends_on_agent(*number))
    }
}

/// The full state of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Agents in ascending `agent_number` order
    pub specs: Vec<AgentSpec>,
    /// The current user message
    pub prompt: String,
    /// Prior conversation
    pub history: Vec<ConversationTurn>,
    /// Outcomes recorded so far
    pub outcomes: OutcomeMap,
}

impl PipelineRun {
    /// Validates the roster and creates an empty run.
    ///
    /// # Errors
    /// Returns `Error::Validation` for an empty roster, an invalid spec, or a
    /// duplicate agent number.
    pub fn new(
        mut specs: Vec<AgentSpec>,
        prompt: impl Into<String>,
        history: Vec<ConversationTurn>,
    ) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::Validation("a run needs at least one agent".to_owned()));
        }
        for spec in &specs {
            spec.validate()?;
        }
        specs.sort_by_key(|spec| spec.agent_number);
        if let Some(pair) = specs
            .windows(2)
            .find(|pair| pair[0].agent_number == pair[1].agent_number)
        {
            return Err(Error::Validation(format!(
                "duplicate agent number {}",
                pair[0].agent_number
            )));
        }

        Ok(Self {
            specs,
            prompt: prompt.into(),
            history,
            outcomes: OutcomeMap::default(),
        })
    }

    /// Highest agent number in the roster.
    #[must_use]
    pub fn last_agent_number(&self) -> u32 {
        self.specs.last().map_or(0, |spec| spec.agent_number)
    }

    /// Spec for one agent.
    #[must_use]
    pub fn spec(&self, agent_number: u32) -> Option<&AgentSpec> {
        self.specs
            .iter()
            .find(|spec| spec.agent_number == agent_number)
    }
}
