use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CompassError, Result};

/// Top-level configuration for the Compass application.
///
/// Loaded from `~/.compass/config.toml` by default. Each section corresponds
/// to one stage of the conversation pipeline or a cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompassConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl CompassConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CompassConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| CompassError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// API server port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.compass/data".to_string(),
            log_level: "info".to_string(),
            port: 3040,
        }
    }
}

/// Text-generation backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// OpenAI-compatible chat completions endpoint base URL.
    pub base_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Environment variable holding the API key. No key means offline echo mode.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound on waiting for response headers.
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "COMPASS_MODEL_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            request_timeout_secs: 30,
        }
    }
}

/// Request pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-provider deadline before a signal is treated as absent.
    pub provider_timeout_ms: u64,
    /// Prior turns sent to the model as history.
    pub history_turns: usize,
    /// Maximum accepted user message length in characters.
    pub max_message_length: usize,
    /// Capacity of the per-request event channel.
    pub event_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 250,
            history_turns: 20,
            max_message_length: 4000,
            event_buffer: 64,
        }
    }
}

/// Synthesis gating and background refresh thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Number of prior conversations in which a theme may not resurface.
    pub cooldown_conversations: usize,
    /// New conversations since `computed_at` before the pattern cache is stale.
    pub refresh_after_conversations: u32,
    /// Age in hours after which the pattern cache is stale regardless of activity.
    pub refresh_max_age_hours: u64,
    /// New sessions since the last style analysis before it is stale.
    pub style_refresh_after_sessions: u32,
    /// Minimum sessions before the session-pattern summary is shown.
    pub session_pattern_min_sessions: u32,
    /// Sessions after discovery during which discovery context is injected.
    pub discovery_followup_sessions: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            cooldown_conversations: 3,
            refresh_after_conversations: 3,
            refresh_max_age_hours: 168,
            style_refresh_after_sessions: 5,
            session_pattern_min_sessions: 5,
            discovery_followup_sessions: 3,
        }
    }
}

/// Crisis detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Enable crisis language detection.
    pub crisis_detection: bool,
    /// Additional phrases treated as elevated-risk language.
    pub extra_crisis_phrases: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            crisis_detection: true,
            extra_crisis_phrases: Vec::new(),
        }
    }
}

/// Prompt library location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Optional TOML prompt library overriding the built-in one.
    pub library_path: Option<String>,
}

/// Bearer credential table standing in for the external auth service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token to user id.
    pub tokens: HashMap<String, String>,
}

/// Client-side streaming settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server base URL used by the client.
    pub base_url: String,
    /// Token buffer window in milliseconds.
    pub buffer_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3040".to_string(),
            buffer_window_ms: 75,
        }
    }
}
