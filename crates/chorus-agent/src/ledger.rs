//! In-process exchange ledger.

use std::sync::Mutex;

use chorus_core::{ExchangeRecord, IgnoreLock as _, Ledger};

/// Aggregate accounting over recorded exchanges.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerTotals {
    /// Exchanges recorded
    pub calls: usize,
    /// Sum of input tokens
    pub input_tokens: usize,
    /// Sum of output tokens
    pub output_tokens: usize,
    /// Sum of cost in dollars
    pub cost: f64,
}

/// Ledger that keeps every exchange in memory, in arrival order.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    exchanges: Mutex<Vec<ExchangeRecord>>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every recorded exchange.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ExchangeRecord> {
        self.exchanges.lock_ignore_poison().clone()
    }

    /// Exchanges recorded for one agent.
    #[must_use]
    pub fn for_agent(&self, agent_number: u32) -> Vec<ExchangeRecord> {
        self.exchanges
            .lock_ignore_poison()
            .iter()
            .filter(|exchange| exchange.agent_number == agent_number)
            .cloned()
            .collect()
    }

    /// Totals across all recorded exchanges.
    #[must_use]
    pub fn totals(&self) -> LedgerTotals {
        self.exchanges
            .lock_ignore_poison()
            .iter()
            .fold(LedgerTotals::default(), |mut totals, exchange| {
                totals.calls += 1;
                totals.input_tokens += exchange.input_tokens;
                totals.output_tokens += exchange.output_tokens;
                totals.cost += exchange.cost;
                totals
            })
    }

    /// Number of recorded exchanges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.lock_ignore_poison().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Ledger for InMemoryLedger {
    fn record(&self, exchange: ExchangeRecord) {
        self.exchanges.lock_ignore_poison().push(exchange);
    }
}
