use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::phase::Phase;

fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

/// Where completions come from. Both variants speak the OpenAI chat API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Provider {
    OpenRouter {
        api_key: String,
        #[serde(default = "default_openrouter_url")]
        base_url: String,
    },
    /// Any OpenAI-compatible endpoint (vLLM, Ollama, LM Studio, a proxy).
    OpenAiCompatible {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        base_url: String,
        model: String,
    },
}

impl Provider {
    pub fn default_model(&self) -> &str {
        match self {
            Provider::OpenRouter { .. } => "anthropic/claude-sonnet-4.6",
            Provider::OpenAiCompatible { model, .. } => model,
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            Provider::OpenRouter { base_url, .. } | Provider::OpenAiCompatible { base_url, .. } => {
                base_url.trim_end_matches('/')
            }
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        match self {
            Provider::OpenRouter { api_key, .. } => Some(api_key),
            Provider::OpenAiCompatible { api_key, .. } => api_key.as_deref(),
        }
    }
}

/// User-overridable model ids per phase.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseModels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<String>,
}

impl PhaseModels {
    pub fn get(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Discovery => self.discovery.as_deref(),
            Phase::Strategy => self.strategy.as_deref(),
            Phase::Execute => self.execute.as_deref(),
        }
    }

    /// Fill unset phases from `other`.
    pub fn or(self, other: &PhaseModels) -> PhaseModels {
        PhaseModels {
            discovery: self.discovery.or_else(|| other.discovery.clone()),
            strategy: self.strategy.or_else(|| other.strategy.clone()),
            execute: self.execute.or_else(|| other.execute.clone()),
        }
    }
}

/// Stored configuration: provider credentials plus run defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReinConfig {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_models: Option<PhaseModels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typecheck_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,
}

impl ReinConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            phase_models: None,
            test_command: None,
            typecheck_command: None,
            max_turns: None,
        }
    }

    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rein")
            .join("config.json")
    }

    /// Load from ~/.rein/config.json.
    pub fn load() -> Option<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                None
            }
        }
    }

    /// Save to ~/.rein/config.json (mode 0o600).
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Delete ~/.rein/config.json.
    pub fn clear() -> Result<(), std::io::Error> {
        let path = Self::config_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn phase_models(&self) -> PhaseModels {
        self.phase_models.clone().unwrap_or_default()
    }
}
