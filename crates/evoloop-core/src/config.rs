//! Engine, executor and generative-backend configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EvoError, Result};

/// Knobs consumed by the orchestrator for one case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Critic rounds before the loop hands over to the user.
    pub max_critic_turns: u32,
    /// Produce+execute attempts per turn (1 = no regeneration).
    pub max_regen_attempts: u32,
    /// Minimum quality score for an approval to count.
    pub quality_threshold: f64,
    /// Template producer/critic when `true`, generative backend otherwise.
    pub mock_mode: bool,
    pub execution_timeout_secs: u64,
    /// Cap on captured stderr/stdout suffixes (characters).
    pub stderr_tail_chars: usize,
    /// How many recent critic feedback items the producer sees.
    pub critic_context_depth: usize,
    pub seed_visual: Vec<String>,
    pub seed_data: Vec<String>,
    pub executor: ExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_critic_turns: 3,
            max_regen_attempts: 2,
            quality_threshold: 0.7,
            mock_mode: true,
            execution_timeout_secs: 300,
            stderr_tail_chars: evoloop_state::DEFAULT_TAIL_CHARS,
            critic_context_depth: 3,
            seed_visual: Vec::new(),
            seed_data: Vec::new(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject bounds that would make a case meaningless or unbounded.
    pub fn validate(&self) -> Result<()> {
        if self.max_critic_turns < 1 {
            return Err(EvoError::InvalidConfig(
                "max_critic_turns must be at least 1".to_string(),
            ));
        }
        if self.max_regen_attempts < 1 {
            return Err(EvoError::InvalidConfig(
                "max_regen_attempts must be at least 1".to_string(),
            ));
        }
        if !self.quality_threshold.is_finite() || !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(EvoError::InvalidConfig(format!(
                "quality_threshold must be within 0..=1, got {}",
                self.quality_threshold
            )));
        }
        if self.execution_timeout_secs == 0 {
            return Err(EvoError::InvalidConfig(
                "execution_timeout_secs must be positive".to_string(),
            ));
        }
        if self.stderr_tail_chars == 0 {
            return Err(EvoError::InvalidConfig(
                "stderr_tail_chars must be positive".to_string(),
            ));
        }
        self.executor.validate()
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// How produced scripts are run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// File name the source is written to inside the working directory.
    pub script_name: String,
    /// Parent of every per-case working directory.
    pub scratch_root: PathBuf,
    /// Files a run must leave behind to count as successful.
    pub required_outputs: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: Vec::new(),
            script_name: "plot_script.py".to_string(),
            scratch_root: std::env::temp_dir().join("evoloop-scratch"),
            required_outputs: Vec::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interpreter.trim().is_empty() {
            return Err(EvoError::InvalidConfig(
                "executor.interpreter must not be empty".to_string(),
            ));
        }
        let name = self.script_name.trim();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(EvoError::InvalidConfig(format!(
                "executor.script_name must be a plain file name, got {:?}",
                self.script_name
            )));
        }
        Ok(())
    }
}

/// Generative backend settings, read from the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://host/v1`.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub writer_model: Option<String>,
    pub critic_model: Option<String>,
    pub request_timeout_secs: u64,
}

impl GenerationConfig {
    pub const ENDPOINT_VAR: &'static str = "EVOLOOP_LLM_ENDPOINT";
    pub const API_KEY_VAR: &'static str = "EVOLOOP_LLM_API_KEY";
    pub const MODEL_VAR: &'static str = "EVOLOOP_LLM_MODEL";
    pub const WRITER_MODEL_VAR: &'static str = "EVOLOOP_LLM_WRITER_MODEL";
    pub const CRITIC_MODEL_VAR: &'static str = "EVOLOOP_LLM_CRITIC_MODEL";

    /// Read settings from `EVOLOOP_LLM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup (environment, map, ...).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            endpoint: get(Self::ENDPOINT_VAR),
            api_key: get(Self::API_KEY_VAR),
            model: get(Self::MODEL_VAR),
            writer_model: get(Self::WRITER_MODEL_VAR),
            critic_model: get(Self::CRITIC_MODEL_VAR),
            request_timeout_secs: 120,
        }
    }

    /// Model used by the code writer.
    pub fn writer_model(&self) -> Option<&str> {
        self.writer_model.as_deref().or(self.model.as_deref())
    }

    /// Model used by the critic.
    pub fn critic_model(&self) -> Option<&str> {
        self.critic_model.as_deref().or(self.model.as_deref())
    }

    /// Names of the variables still needed for a usable backend.
    pub fn missing_vars(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.endpoint.is_none() {
            missing.push(Self::ENDPOINT_VAR);
        }
        if self.api_key.is_none() {
            missing.push(Self::API_KEY_VAR);
        }
        if self.writer_model().is_none() {
            missing.push(Self::WRITER_MODEL_VAR);
        }
        if self.critic_model().is_none() {
            missing.push(Self::CRITIC_MODEL_VAR);
        }
        missing
    }

    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_vars();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EvoError::InvalidConfig(format!(
                "generative mode requires environment variables: {}",
                missing.join(", ")
            )))
        }
    }
}
