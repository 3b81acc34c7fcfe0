//! LLM provider abstraction
//!
//! Generators talk to the backend through the [`LlmProvider`] trait.
//! [`GoogleProvider`] maps it onto the Gemini API and [`run_tool_loop`]
//! drives the bounded tool-use conversation on top of any provider.

pub mod factory;
pub mod google;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;
pub mod tool_loop;
pub mod types;

pub use factory::{Backends, FixedProviderFactory, GoogleProviderFactory, GoogleSettings, ProviderFactory};
pub use google::GoogleProvider;
pub use tool_loop::{DEFAULT_MAX_ITERATIONS, run_tool_loop};
pub use types::{ChatMessage, ChatMessageContent, ChatResponse, ChatResponseBlock, ChatRole, LlmProvider, ToolDefinition};
