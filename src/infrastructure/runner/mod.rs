//! Subagent runner adapters.
//!
//! The real agent transport lives outside the core. The scripted runner
//! replays canned outcomes per role, which is what tests and `run --script`
//! dry runs use.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::models::session::{AgentRole, SubagentOutcome, SubagentTask};
use crate::domain::ports::{SubagentRunner, SubagentRunnerError};

/// A queue of canned outcomes per role, consumed front to back.
///
/// The on-disk form (see `ScriptFile`) lets a dry run drive the whole loop
/// from a JSON fixture.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<HashMap<AgentRole, Vec<SubagentOutcome>>>,
    /// Artificial latency per invocation, for timeout tests.
    delay_ms: u64,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Queue an outcome for a role.
    pub async fn push(&self, role: AgentRole, outcome: SubagentOutcome) {
        let mut outcomes = self.outcomes.lock().await;
        outcomes.entry(role).or_default().push(outcome);
    }

    /// Build a runner from a parsed script file.
    pub async fn from_script(script: ScriptFile) -> Self {
        let runner = Self::new();
        for entry in script.outcomes {
            runner.push(entry.role, entry.outcome).await;
        }
        runner
    }
}

#[async_trait]
impl SubagentRunner for ScriptedRunner {
    async fn run(
        &self,
        role: AgentRole,
        _task: &SubagentTask,
    ) -> Result<SubagentOutcome, SubagentRunnerError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }

        let mut outcomes = self.outcomes.lock().await;
        let queue = outcomes
            .get_mut(&role)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| SubagentRunnerError::ScriptExhausted(role.to_string()))?;
        Ok(queue.remove(0))
    }
}

/// Serialized form of a scripted run: a list of role/outcome pairs consumed
/// in order per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFile {
    pub outcomes: Vec<ScriptEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub role: AgentRole,
    pub outcome: SubagentOutcome,
}
