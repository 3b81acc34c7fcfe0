//! assessor-core - Routing and dispatch for the assessor
//!
//! This crate provides:
//! - Gemini client behind a provider trait, with a bounded tool-use loop
//! - Ledger and memory tools exposed to the generators
//! - Strict parsing of the router's route line
//! - History channels keyed by session and destination
//! - The dispatcher that runs one message through router, destinations and fusion

pub mod dispatch;
pub mod error;
pub mod generator;
pub mod history;
pub mod prompts;
pub mod providers;
pub mod route;
pub mod tools;

// Re-export main types for convenience
pub use dispatch::{
    DispatchOutcome, DispatchSettings, Dispatcher, ERROR_PREFIX, OriginLabel, Services, resolve_session,
};
pub use error::{AssessorError, AssessorResult, Stage};
pub use generator::{Generator, Role};
pub use history::{Channel, HistoryEntry, HistoryStore, SharedHistory};
pub use providers::{
    Backends, ChatMessage, FixedProviderFactory, GoogleProvider, GoogleProviderFactory, GoogleSettings, LlmProvider,
    ProviderFactory,
};
pub use route::{Route, RouteError, RouterOutput, RoutingDecision, parse_router_output};
pub use tools::{ToolExecutor, ToolHandler, ToolRegistry};
