use anyhow::{Context, Result};
use assessor_core::{DispatchSettings, GoogleSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessorConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

// ── Gateway Config ──────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("api_token", &mask_secret(&self.api_token))
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            port: default_gateway_port(),
            api_token: String::new(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

// ── Provider Config ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub google: GoogleConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_google_model")]
    pub model: String,
    #[serde(default = "default_google_flash_model")]
    pub flash_model: String,
    #[serde(default = "default_google_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_flash_temperature")]
    pub flash_temperature: f32,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
}

impl std::fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("flash_model", &self.flash_model)
            .field("max_tokens", &self.max_tokens)
            .field("embedding_model", &self.embedding_model)
            .field("embedding_dimensions", &self.embedding_dimensions)
            .finish()
    }
}

fn default_google_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_google_flash_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_google_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.95
}

fn default_flash_temperature() -> f32 {
    0.3
}

fn default_embedding_model() -> String {
    "gemini-embedding-001".to_string()
}

fn default_embedding_dimensions() -> u32 {
    512
}

impl GoogleConfig {
    pub fn settings(&self) -> GoogleSettings {
        GoogleSettings {
            model: self.model.clone(),
            flash_model: self.flash_model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            flash_temperature: self.flash_temperature,
        }
    }
}

// ── Storage Config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.assessor/assessor.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".assessor")
}

impl AssessorConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // The file holds secrets; refuse group/other-readable copies
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!("Failed to read config at {}. Run `assessor init` first.", path.display())
        })?;

        let config = Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))?;

        if config.providers.google.api_key.starts_with("AIza") {
            warn!(
                "Google API key is hardcoded in config file. For security, use environment variables: api_key = \"${{GOOGLE_API_KEY}}\""
            );
        }

        Ok(config)
    }

    /// Expand allowlisted env vars, then parse
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(toml::from_str(&expanded)?)
    }

    /// Copy with secrets masked, for printing
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.gateway.api_token = mask_secret(&copy.gateway.api_token);
        copy.providers.google.api_key = mask_secret(&copy.providers.google.api_key);
        copy
    }

    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.storage.db_path)
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &["ASSESSOR_API_TOKEN", "GOOGLE_API_KEY", "GOOGLE_AI_API_KEY", "HOME", "USER"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..abs_start], value, &result[abs_start + end + 1..]);
        pos = abs_start + value.len();
    }
    result
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(s: &str) -> PathBuf {
    match (s.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(s),
    }
}

/// Write the default config, readable only by the owner
pub fn write_default(path: &Path) -> Result<()> {
    std::fs::write(path, DEFAULT_CONFIG).with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let cfg = AssessorConfig::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(cfg.gateway.port, 8000);
        assert_eq!(cfg.providers.google.embedding_dimensions, 512);
        assert_eq!(cfg.dispatch.retrieval_k, 3);
        assert_eq!(cfg.dispatch.utc_offset_hours, -3);
        assert_eq!(cfg.storage.db_path, "~/.assessor/assessor.db");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = AssessorConfig::parse("[providers.google]\napi_key = \"k\"\n").unwrap();
        assert_eq!(cfg.gateway.bind, "127.0.0.1");
        assert!(cfg.gateway.api_token.is_empty());
        assert_eq!(cfg.providers.google.model, "gemini-2.5-flash");
        assert_eq!(cfg.dispatch.call_timeout_secs, 120);
    }

    #[test]
    fn test_unlisted_env_var_left_unexpanded() {
        let input = "token = \"${SOME_OTHER_SECRET}\"";
        assert_eq!(expand_env_vars(input), input);
    }

    #[test]
    fn test_allowlisted_env_var_expanded() {
        let expanded = expand_env_vars("home = \"${HOME}\"");
        assert!(!expanded.contains("${HOME}"));
        assert_eq!(expanded, format!("home = \"{}\"", std::env::var("HOME").unwrap_or_default()));
    }

    #[test]
    fn test_unterminated_reference_kept() {
        assert_eq!(expand_env_vars("x = \"${HOME\""), "x = \"${HOME\"");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("AIzaSyA-very-long-key"), "AIz...-key");
    }

    #[test]
    fn test_debug_and_redacted_hide_secrets() {
        let mut cfg = AssessorConfig::parse(DEFAULT_CONFIG).unwrap();
        cfg.gateway.api_token = "super-secret-token".to_string();
        cfg.providers.google.api_key = "AIzaSyA-very-long-key".to_string();

        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("super-secret-token"));
        assert!(!debug.contains("AIzaSyA-very-long-key"));

        let printed = toml::to_string_pretty(&cfg.redacted()).unwrap();
        assert!(!printed.contains("super-secret-token"));
        assert!(printed.contains("sup...oken"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/var/lib/a.db"), PathBuf::from("/var/lib/a.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.assessor/a.db"), home.join(".assessor/a.db"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_write_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_default(&path).unwrap();
        let cfg = AssessorConfig::load(&Some(path)).unwrap();
        assert_eq!(cfg.gateway.allowed_origins, vec!["*".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissive_config_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, DEFAULT_CONFIG).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(AssessorConfig::load(&Some(path)).is_err());
    }
}
