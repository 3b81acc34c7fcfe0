//! Response generators
//!
//! A generator is one backend call (or bounded tool loop) with a fixed role:
//! system prompt, few-shot examples, optional tools and an optional history
//! channel.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use tracing::debug;

use crate::history::{SharedHistory, record_exchange};
use crate::prompts;
use crate::providers::{ChatMessage, DEFAULT_MAX_ITERATIONS, LlmProvider, run_tool_loop};
use crate::tools::{ToolExecutor, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Router,
    Manager,
    Knowledge,
    Evaluator,
    Curator,
}

impl Role {
    fn system_template(&self) -> &'static str {
        match self {
            Self::Router => prompts::ROUTER_SYSTEM,
            Self::Manager => prompts::MANAGER_SYSTEM,
            Self::Knowledge => prompts::KNOWLEDGE_SYSTEM,
            Self::Evaluator => prompts::EVALUATOR_SYSTEM,
            Self::Curator => prompts::CURATOR_SYSTEM,
        }
    }

    fn few_shots(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Router => prompts::ROUTER_SHOTS,
            Self::Manager => prompts::MANAGER_SHOTS,
            Self::Knowledge | Self::Evaluator | Self::Curator => &[],
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Router => "router",
            Self::Manager => "manager",
            Self::Knowledge => "knowledge",
            Self::Evaluator => "evaluator",
            Self::Curator => "curator",
        };
        f.write_str(name)
    }
}

pub struct Generator {
    role: Role,
    provider: Arc<dyn LlmProvider>,
    tools: Option<Arc<ToolRegistry>>,
    history: Option<SharedHistory>,
    allow_silent: bool,
    max_iterations: usize,
    max_history: usize,
    utc_offset_hours: i32,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("role", &self.role)
            .field("model", &self.provider.model())
            .field("tools", &self.tools.as_ref().map(|t| t.len()))
            .field("history", &self.history.is_some())
            .finish()
    }
}

impl Generator {
    pub fn new(role: Role, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            role,
            provider,
            tools: None,
            history: None,
            allow_silent: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_history: 40,
            utc_offset_hours: -3,
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_history(mut self, history: SharedHistory, max_messages: usize) -> Self {
        self.history = Some(history);
        self.max_history = max_messages;
        self
    }

    /// Accept an empty answer as success
    pub fn silent(mut self) -> Self {
        self.allow_silent = true;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_utc_offset(mut self, hours: i32) -> Self {
        self.utc_offset_hours = hours;
        self
    }

    /// Run one call. The history channel, when set, stays locked until the
    /// exchange has been recorded.
    pub async fn generate(&self, input: &str) -> Result<String> {
        let system = prompts::render(self.role.system_template(), prompts::today_local(self.utc_offset_hours));

        let mut messages: Vec<ChatMessage> = Vec::new();
        for (human, ai) in self.role.few_shots() {
            messages.push(ChatMessage::user(*human));
            messages.push(ChatMessage::assistant(*ai));
        }

        let mut guard = match &self.history {
            Some(history) => Some(history.lock().await),
            None => None,
        };
        if let Some(entries) = guard.as_deref() {
            messages.extend(entries.iter().map(|e| e.to_message()));
        }
        messages.push(ChatMessage::user(input));

        let tool_defs = self.tools.as_ref().map(|t| t.list_tools()).unwrap_or_default();
        let executor = self.tools.as_deref().map(|t| t as &dyn ToolExecutor);

        debug!("{} generator called with {} message(s)", self.role, messages.len());

        let output = run_tool_loop(
            self.provider.as_ref(),
            messages,
            &system,
            &tool_defs,
            executor,
            self.max_iterations,
        )
        .await?;
        let output = output.trim().to_string();

        if output.is_empty() && !self.allow_silent {
            return Err(anyhow!("{} generator returned an empty answer", self.role));
        }

        if let Some(entries) = guard.as_deref_mut() {
            record_exchange(entries, input, &output, self.max_history);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Channel, HistoryStore};
    use crate::providers::scripted::{ScriptedProvider, ScriptedTurn};

    #[tokio::test]
    async fn test_router_sends_few_shots_and_history() {
        let provider = Arc::new(ScriptedProvider::new().on(
            prompts::ROUTER_PERSONA,
            vec![ScriptedTurn::text("Olá!"), ScriptedTurn::text("Tudo certo.")],
        ));
        let store = HistoryStore::new();
        let router = Generator::new(Role::Router, provider.clone()).with_history(store.channel("1", Channel::Router), 10);

        assert_eq!(router.generate("Oi").await.unwrap(), "Olá!");
        assert_eq!(router.generate("Tudo bem?").await.unwrap(), "Tudo certo.");

        let calls = provider.calls();
        let shots = prompts::ROUTER_SHOTS.len() * 2;
        assert_eq!(calls[0].messages.len(), shots + 1);
        assert_eq!(calls[1].messages.len(), shots + 3);
        assert!(!calls[0].system.contains(prompts::TODAY_PLACEHOLDER));
        assert_eq!(store.snapshot("1", Channel::Router).await.len(), 4);
    }

    #[tokio::test]
    async fn test_empty_answer_rejected_unless_silent() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .on(prompts::EVALUATOR_PERSONA, vec![ScriptedTurn::text("")])
                .on(prompts::CURATOR_PERSONA, vec![ScriptedTurn::text("")]),
        );
        let evaluator = Generator::new(Role::Evaluator, provider.clone());
        assert!(evaluator.generate("Pergunta: x").await.is_err());

        let curator = Generator::new(Role::Curator, provider.clone()).silent();
        assert_eq!(curator.generate("nada a guardar").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_failed_call_leaves_history_untouched() {
        let provider =
            Arc::new(ScriptedProvider::new().on(prompts::MANAGER_PERSONA, vec![ScriptedTurn::fail("503 unavailable")]));
        let store = HistoryStore::new();
        let manager =
            Generator::new(Role::Manager, provider).with_history(store.channel("1", Channel::Manager), 10);
        assert!(manager.generate("Liste as tarefas").await.is_err());
        assert!(store.snapshot("1", Channel::Manager).await.is_empty());
    }

    #[tokio::test]
    async fn test_tools_advertised() {
        use crate::tools::memory::register_memory_tools;
        use assessor_knowledge::{KnowledgeDb, SqliteMemoryStore};

        let provider = Arc::new(ScriptedProvider::new().on(prompts::CURATOR_PERSONA, vec![ScriptedTurn::text("")]));
        let mut registry = ToolRegistry::new();
        register_memory_tools(
            &mut registry,
            Arc::new(SqliteMemoryStore::new(KnowledgeDb::open_in_memory().unwrap())),
            "1",
        );
        let curator = Generator::new(Role::Curator, provider.clone())
            .with_tools(Arc::new(registry))
            .silent();
        curator.generate("x\nSessionID:1").await.unwrap();
        assert_eq!(
            provider.calls()[0].tool_names,
            vec!["list_memories", "pop_last_memory", "record_memory"]
        );
    }
}
