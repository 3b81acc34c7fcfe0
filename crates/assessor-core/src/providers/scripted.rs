//! Scripted provider for tests
//!
//! Responses are queued per system-prompt marker: a call is answered by the
//! first rule whose marker occurs in the system prompt. Every call is
//! recorded so tests can assert on what each generator was sent.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::types::{
    ChatMessage, ChatResponse, ChatResponseBlock, ChatUsage, LlmProvider, StopReason, ToolDefinition,
};

/// One canned reply
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Text(String),
    ToolCalls(Vec<(String, Value)>),
    Fail(String),
    /// Sleep before answering with the inner turn
    Stall(Duration, Box<ScriptedTurn>),
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool_call(name: impl Into<String>, input: Value) -> Self {
        Self::ToolCalls(vec![(name.into(), input)])
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self::Fail(msg.into())
    }

    pub fn stall(delay: Duration, then: ScriptedTurn) -> Self {
        Self::Stall(delay, Box::new(then))
    }
}

/// A call the provider received
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

impl RecordedCall {
    /// Text of the last message sent
    pub fn last_input(&self) -> String {
        self.messages.last().map(|m| m.text()).unwrap_or_default()
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    rules: Mutex<Vec<(String, VecDeque<ScriptedTurn>)>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue turns for calls whose system prompt contains `marker`
    pub fn on(self, marker: &str, turns: Vec<ScriptedTurn>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((marker.to_string(), turns.into()));
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls whose system prompt contains `marker`
    pub fn calls_for(&self, marker: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.system.contains(marker))
            .collect()
    }

    fn next_turn(&self, system: &str) -> Option<ScriptedTurn> {
        let mut rules = self.rules.lock().ok()?;
        rules
            .iter_mut()
            .find(|(marker, _)| system.contains(marker.as_str()))
            .and_then(|(_, turns)| turns.pop_front())
    }
}

fn respond(turn: ScriptedTurn) -> Result<ChatResponse> {
    match turn {
        ScriptedTurn::Text(text) => Ok(ChatResponse {
            blocks: if text.is_empty() {
                vec![]
            } else {
                vec![ChatResponseBlock::Text { text }]
            },
            stop_reason: StopReason::EndTurn,
            usage: ChatUsage::default(),
        }),
        ScriptedTurn::ToolCalls(calls) => Ok(ChatResponse {
            blocks: calls
                .into_iter()
                .enumerate()
                .map(|(i, (name, input))| ChatResponseBlock::ToolCall {
                    id: format!("call_{}_{}", name, i),
                    name,
                    input,
                })
                .collect(),
            stop_reason: StopReason::ToolUse,
            usage: ChatUsage::default(),
        }),
        ScriptedTurn::Fail(msg) => Err(anyhow!(msg)),
        ScriptedTurn::Stall(_, inner) => respond(*inner),
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition], system: &str) -> Result<ChatResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                system: system.to_string(),
                messages: messages.to_vec(),
                tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            });
        }

        let turn = self
            .next_turn(system)
            .ok_or_else(|| anyhow!("No scripted response left for this prompt"))?;

        if let ScriptedTurn::Stall(delay, _) = &turn {
            tokio::time::sleep(*delay).await;
        }
        respond(turn)
    }
}
