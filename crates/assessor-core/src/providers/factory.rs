//! Builds generative backends from a caller-supplied API key

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::AssessorError;

use super::google::GoogleProvider;
use super::types::LlmProvider;

/// The two backends every request needs
#[derive(Clone)]
pub struct Backends {
    /// Tool-augmented generators (manager, curator)
    pub main: Arc<dyn LlmProvider>,
    /// Router, knowledge and evaluator
    pub flash: Arc<dyn LlmProvider>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("main", &self.main.model())
            .field("flash", &self.flash.model())
            .finish()
    }
}

pub trait ProviderFactory: Send + Sync {
    /// Fails with [`AssessorError::BackendInitFailure`] for a blank key or
    /// a client that cannot be built
    fn build(&self, api_key: &str) -> Result<Backends, AssessorError>;
}

/// Model settings for the Gemini backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleSettings {
    pub model: String,
    pub flash_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub flash_temperature: f32,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            flash_model: "gemini-2.0-flash".to_string(),
            max_tokens: 8192,
            temperature: 0.95,
            flash_temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GoogleProviderFactory {
    settings: GoogleSettings,
}

impl GoogleProviderFactory {
    pub fn new(settings: GoogleSettings) -> Self {
        Self { settings }
    }
}

impl ProviderFactory for GoogleProviderFactory {
    fn build(&self, api_key: &str) -> Result<Backends, AssessorError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AssessorError::BackendInitFailure("API key is empty".to_string()));
        }

        let s = &self.settings;
        let main = GoogleProvider::new(api_key.to_string(), s.model.clone(), s.max_tokens, s.temperature)
            .map_err(|e| AssessorError::BackendInitFailure(e.to_string()))?;
        let flash = GoogleProvider::new(
            api_key.to_string(),
            s.flash_model.clone(),
            s.max_tokens,
            s.flash_temperature,
        )
        .map_err(|e| AssessorError::BackendInitFailure(e.to_string()))?;

        debug!("Built Gemini backends: main={}, flash={}", s.model, s.flash_model);

        Ok(Backends {
            main: Arc::new(main),
            flash: Arc::new(flash),
        })
    }
}

/// Factory that hands out the same backends for every key. Blank keys are
/// still rejected.
#[derive(Clone)]
pub struct FixedProviderFactory {
    backends: Backends,
}

impl FixedProviderFactory {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }
}

impl ProviderFactory for FixedProviderFactory {
    fn build(&self, api_key: &str) -> Result<Backends, AssessorError> {
        if api_key.trim().is_empty() {
            return Err(AssessorError::BackendInitFailure("API key is empty".to_string()));
        }
        Ok(self.backends.clone())
    }
}
