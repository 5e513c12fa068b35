use async_trait::async_trait;

use super::model::TokenUsage;
use crate::error::Result;
use crate::history::Turn;
use crate::session::SessionLease;

/// Append-only conversation the tool loop writes into.
#[async_trait]
pub trait Transcript: Send {
    fn turns(&self) -> &[Turn];
    fn append(&mut self, turn: Turn);
    fn record_usage(&mut self, usage: TokenUsage);

    /// Make everything appended so far durable.
    async fn checkpoint(&mut self) -> Result<()>;
}

#[async_trait]
impl Transcript for SessionLease {
    fn turns(&self) -> &[Turn] {
        SessionLease::turns(self)
    }

    fn append(&mut self, turn: Turn) {
        SessionLease::append(self, turn);
    }

    fn record_usage(&mut self, usage: TokenUsage) {
        self.add_tokens(usage.total);
    }

    async fn checkpoint(&mut self) -> Result<()> {
        SessionLease::checkpoint(self).await
    }
}

/// In-memory transcript for one-off prompts that are never stored.
#[derive(Debug, Default)]
pub struct Scratchpad {
    turns: Vec<Turn>,
    tokens: u64,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

#[async_trait]
impl Transcript for Scratchpad {
    fn turns(&self) -> &[Turn] {
        &self.turns
    }

    fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    fn record_usage(&mut self, usage: TokenUsage) {
        self.tokens = self.tokens.saturating_add(usage.total);
    }

    async fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }
}
