//! Per-destination conversation histories
//!
//! Each generator that keeps context writes to one destination channel of the
//! caller's session, so router, manager, knowledge and curator conversations
//! never mix, and neither do two employees' conversations. A generator holds
//! its channel lock for the whole call, which serializes concurrent requests
//! on the same session and destination.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::providers::{ChatMessage, ChatRole};

/// Destination part of a history key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Router,
    Knowledge,
    Manager,
    Curator,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "ROUTER_SESSION",
            Self::Knowledge => "RAG_SESSION",
            Self::Manager => "GERENTE_SESSION",
            Self::Curator => "CURADOR_SESSION",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: ChatRole,
    pub text: String,
}

impl HistoryEntry {
    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            ChatRole::Assistant => ChatMessage::assistant(self.text.clone()),
            _ => ChatMessage::user(self.text.clone()),
        }
    }
}

pub type SharedHistory = Arc<Mutex<Vec<HistoryEntry>>>;

/// Record one exchange and drop the oldest entries beyond `max_messages`
pub fn record_exchange(history: &mut Vec<HistoryEntry>, input: &str, output: &str, max_messages: usize) {
    history.push(HistoryEntry {
        role: ChatRole::User,
        text: input.to_string(),
    });
    // Silent generators leave no assistant turn
    if !output.is_empty() {
        history.push(HistoryEntry {
            role: ChatRole::Assistant,
            text: output.to_string(),
        });
    }
    if history.len() > max_messages {
        let excess = history.len() - max_messages;
        history.drain(..excess);
    }
    // Gemini expects the conversation to open with a user turn
    while history.first().is_some_and(|e| e.role == ChatRole::Assistant) {
        history.remove(0);
    }
}

/// Channels keyed by (session id, destination), created on first use
#[derive(Debug, Default)]
pub struct HistoryStore {
    channels: std::sync::Mutex<HashMap<(String, Channel), SharedHistory>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, session_id: &str, channel: Channel) -> SharedHistory {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| {
            warn!("History map lock poisoned, recovering");
            poisoned.into_inner()
        });
        channels.entry((session_id.to_string(), channel)).or_default().clone()
    }

    /// Copy of a channel's entries
    pub async fn snapshot(&self, session_id: &str, channel: Channel) -> Vec<HistoryEntry> {
        let history = self.channel(session_id, channel);
        let entries = history.lock().await;
        entries.clone()
    }
}
