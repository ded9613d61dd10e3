//! Runtime configuration: built-in defaults, then an optional TOML file, then `VIGIL__*` environment overrides.
//!
//! | Source | Example |
//! |--------|---------|
//! | File (`VIGIL_CONFIG`, default `config/vigil.toml`) | `[retry]\nmax_full_cycles = 3` |
//! | Env (prefix `VIGIL`, separator `__`) | `VIGIL__RETRY__BACKOFF_SECS=5` |
//! | Extra credentials | `VIGIL_API_KEYS=k1,k2`, `VIGIL_API_KEY`, `OPENROUTER_API_KEY` |

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::generation::RetryPolicy;
use crate::provider::ApiKey;

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";
pub const DEFAULT_TITLE_FALLBACK: &str = "New Chat";
pub const DEFAULT_SAFETY_THRESHOLD: u8 = 50;

const DEFAULT_CONFIG_PATH: &str = "config/vigil.toml";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, careful assistant. Answer clearly and decline unsafe requests.";

#[derive(Debug, Clone, Deserialize)]
pub struct VigilConfig {
    pub provider: ProviderSettings,
    pub retry: RetrySettings,
    pub detection: DetectionSettings,
    pub gateway: GatewaySettings,
    /// Title used when title generation fails for any reason.
    pub title_fallback: String,
    /// System prompt for chat turns.
    pub system_prompt: String,
    /// Directory of the sled database.
    pub storage_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub api_url: String,
    pub model: String,
    #[serde(default)]
    pub title_model: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    pub request_timeout_secs: u64,
}

impl ProviderSettings {
    /// Configured keys merged with `VIGIL_API_KEYS`, `VIGIL_API_KEY` and `OPENROUTER_API_KEY`, in that order.
    pub fn resolved_keys(&self) -> Vec<ApiKey> {
        let listed = env_opt_string("VIGIL_API_KEYS");
        let singles = [env_opt_string("VIGIL_API_KEY"), env_opt_string("OPENROUTER_API_KEY")];
        merge_keys(&self.api_keys, listed.as_deref(), &singles)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_full_cycles: u32,
    pub backoff_secs: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_full_cycles: self.max_full_cycles.max(1),
            backoff: Duration::from_secs(self.backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionSettings {
    pub safety_threshold: u8,
    /// When false, borderline content is held for humans without a Layer-2 pass.
    pub semantic_review: bool,
    /// Texts longer than this fail the deterministic scan (and are blocked).
    pub max_scan_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    pub bind_addr: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl VigilConfig {
    /// Load from `VIGIL_CONFIG` (or `config/vigil.toml`) and the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load with an explicit file path. A missing file is skipped.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("provider.api_url", DEFAULT_API_URL)?
            .set_default("provider.model", DEFAULT_MODEL)?
            .set_default("provider.request_timeout_secs", 60_i64)?
            .set_default("retry.max_full_cycles", 3_i64)?
            .set_default("retry.backoff_secs", 5_i64)?
            .set_default("detection.safety_threshold", i64::from(DEFAULT_SAFETY_THRESHOLD))?
            .set_default("detection.semantic_review", true)?
            .set_default("detection.max_scan_bytes", 32_768_i64)?
            .set_default("gateway.bind_addr", "127.0.0.1:8010")?
            .set_default("title_fallback", DEFAULT_TITLE_FALLBACK)?
            .set_default("system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("storage_path", "./data/vigil")?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?;

        let mut cfg: VigilConfig = built.try_deserialize()?;
        cfg.detection.safety_threshold = cfg.detection.safety_threshold.min(100);
        if let Some(url) = cfg.gateway.webhook_url.take() {
            cfg.gateway.webhook_url = Some(url.trim().to_string()).filter(|s| !s.is_empty());
        }
        Ok(cfg)
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Order-preserving merge; blanks and duplicates dropped.
fn merge_keys(configured: &[String], listed: Option<&str>, singles: &[Option<String>]) -> Vec<ApiKey> {
    let mut seen: Vec<String> = Vec::new();
    let candidates = configured
        .iter()
        .map(|s| s.as_str())
        .chain(listed.into_iter().flat_map(|l| l.split(',')))
        .chain(singles.iter().filter_map(|s| s.as_deref()));
    for key in candidates {
        let key = key.trim();
        if key.is_empty() || seen.iter().any(|k| k == key) {
            continue;
        }
        seen.push(key.to_string());
    }
    seen.into_iter().map(ApiKey::new).collect()
}
