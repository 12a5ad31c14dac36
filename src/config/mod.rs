//! Runtime configuration.
//!
//! Loaded from a YAML file (default `<stepwise_home>/config.yaml`) and
//! then adjusted by the environment gates `SAFE_MODE`,
//! `MAX_FIND_RESULTS`, and `USE_SELF_HOSTED_LLM`.  A missing config file
//! is not an error; defaults let the CLI run with flags alone.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Base directory scanned for skill directories.
    pub skills_dir: PathBuf,
    /// Directory holding the plan file.
    pub plans_dir: PathBuf,
    /// Plan file name inside `plans_dir`.
    pub plan_file: String,
    /// Skill names suppressed from listing and decomposition.
    pub exclude_skills: Vec<String>,
    /// Group tags of the calling user, matched against skill
    /// `access_groups`.
    pub user_groups: Vec<String>,
    /// LM backend selection and credentials.
    pub model: ModelConfig,
    /// Hard cap on LM round-trips in baseline mode.
    pub max_lm_calls: usize,
    /// Per-step subprocess deadline in seconds.
    pub step_timeout_secs: u64,
    /// Gate on the shell-helper skill's arbitrary command execution.
    /// Env `SAFE_MODE` overrides; defaults on.
    pub safe_mode: bool,
    /// Cap on result counts in file-search operations.
    /// Env `MAX_FIND_RESULTS` overrides.
    pub max_find_results: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            skills_dir: PathBuf::from("./skills"),
            plans_dir: PathBuf::from("."),
            plan_file: "stepwised_plan.txt".to_string(),
            exclude_skills: Vec::new(),
            user_groups: Vec::new(),
            model: ModelConfig::default(),
            max_lm_calls: 12,
            step_timeout_secs: 30,
            safe_mode: true,
            max_find_results: 50,
        }
    }
}

/// LM backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelConfig {
    /// `"nvidia"` (vendor API) or `"self-hosted"`.
    pub provider: String,
    /// Model name to request.
    pub model: String,
    /// Full chat-completions URL override.
    pub endpoint: Option<String>,
    /// API key, plain text or an env-var reference like `$NVIDIA_API_KEY`.
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "nvidia".to_string(),
            model: "nvidia/llama-3.1-nemotron-nano-8b-v1".to_string(),
            endpoint: None,
            api_key: Some("$NVIDIA_API_KEY".to_string()),
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: a `$VAR` value reads the environment,
    /// anything else is used verbatim.  Missing values resolve to an
    /// empty string (local servers need none).
    pub fn resolved_api_key(&self) -> String {
        match self.api_key.as_deref() {
            Some(k) if k.starts_with('$') => std::env::var(&k[1..]).unwrap_or_default(),
            Some(k) => k.to_string(),
            None => String::new(),
        }
    }
}

impl Config {
    /// Read and parse the YAML configuration, then apply environment
    /// gates.  A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_yaml::from_str::<Config>(&contents)
                .with_context(|| format!("failed to parse config YAML {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };

        config.apply_env();
        config.validate()?;

        tracing::debug!(
            skills_dir = %config.skills_dir.display(),
            provider = %config.model.provider,
            safe_mode = config.safe_mode,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Fold the environment gates into the loaded values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SAFE_MODE") {
            self.safe_mode = !matches!(v.to_lowercase().as_str(), "0" | "false" | "off" | "no");
        }
        if let Ok(v) = std::env::var("MAX_FIND_RESULTS") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_find_results = n;
            }
        }
        if let Ok(v) = std::env::var("USE_SELF_HOSTED_LLM") {
            if v.to_lowercase() == "true" {
                self.model.provider = "self-hosted".to_string();
            }
        }
    }

    /// Semantic constraints serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.model.provider.as_str() {
            "nvidia" | "self-hosted" | "self_hosted" => {}
            other => anyhow::bail!("config: unknown model provider '{other}'"),
        }
        if self.max_lm_calls == 0 {
            anyhow::bail!("config: max_lm_calls must be at least 1");
        }
        if self.step_timeout_secs == 0 || self.step_timeout_secs > 120 {
            anyhow::bail!(
                "config: step_timeout_secs must be in 1..=120, got {}",
                self.step_timeout_secs
            );
        }
        if self.plan_file.trim().is_empty() {
            anyhow::bail!("config: plan_file must not be empty");
        }
        Ok(())
    }
}
