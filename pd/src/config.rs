//! Pipeline configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::reasoning::EvidenceTier;

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reasoning service configuration
    pub llm: LlmConfig,

    /// Retry/backoff policy for collaborator calls
    pub retry: RetryConfig,

    /// Fan-out rounds for concurrent stage batches
    pub fanout: FanOutConfig,

    /// Completion barrier polling
    pub poller: PollerConfig,

    /// Multi-round reasoning loop bounds
    pub reasoning: ReasoningConfig,

    /// Stage dispatch and task queue
    pub dispatch: DispatchConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Prompt template overrides
    pub prompts: PromptsConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Checks that required environment variables are set. Call this early in
    /// startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if std::env::var(&self.llm.api_key_env).is_err() {
            return Err(eyre::eyre!(
                "Reasoning service API key not found. Set the {} environment variable.",
                self.llm.api_key_env
            ));
        }
        if self.reasoning.max_verify_attempts == 0 {
            return Err(eyre::eyre!("reasoning.max-verify-attempts must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .footprintd.yml
        let local_config = PathBuf::from(".footprintd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/footprintd/footprintd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("footprintd").join("footprintd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Reasoning service (LLM) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "openai" compatible endpoints)
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Model used for the optional deep-research phase
    #[serde(rename = "deep-research-model")]
    pub deep_research_model: Option<String>,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl LlmConfig {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).context(format!("Environment variable {} is not set", self.api_key_env))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-search-preview".to_string(),
            deep_research_model: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com".to_string(),
            max_tokens: 8192,
            timeout_ms: 300_000,
        }
    }
}

/// Retry/backoff policy for individual collaborator calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the exponential part of the delay
    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Uniform random jitter added on top of each delay
    #[serde(rename = "jitter-ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 15_000,
            max_delay_ms: 180_000,
            jitter_ms: 5_000,
        }
    }
}

/// Fan-out rounds for concurrent batches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    #[serde(rename = "max-rounds")]
    pub max_rounds: u32,

    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    #[serde(rename = "jitter-ms")]
    pub jitter_ms: u64,

    /// Tasks claimed and run concurrently per batch
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            base_delay_ms: 20_000,
            jitter_ms: 5_000,
            batch_size: 10,
        }
    }
}

/// Completion barrier polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,

    /// Wall-clock budget after which completion is declared best-effort
    #[serde(rename = "deadline-secs")]
    pub deadline_secs: u64,

    /// Ids per batched fetch
    #[serde(rename = "id-batch-size")]
    pub id_batch_size: usize,

    /// Fixed delay before a self-rescheduled completion check
    #[serde(rename = "reschedule-delay-secs")]
    pub reschedule_delay_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            deadline_secs: 55 * 60,
            id_batch_size: entitystore::MAX_IN_VALUES,
            reschedule_delay_secs: 5 * 60,
        }
    }
}

/// Multi-round reasoning loop bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Retries shared by the "no result" and "no grounding" triggers
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Calls allowed for the verifier to produce a parseable verdict
    #[serde(rename = "max-verify-attempts")]
    pub max_verify_attempts: u32,

    /// Minimum evidence tier a candidate needs to pass verification
    #[serde(rename = "evidence-threshold")]
    pub evidence_threshold: EvidenceTier,

    /// Run one deep-research call before the direct phase
    #[serde(rename = "deep-research")]
    pub deep_research: bool,

    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_verify_attempts: 2,
            evidence_threshold: EvidenceTier::StrongInference,
            deep_research: false,
            max_tokens: 4096,
        }
    }
}

/// Stage dispatch and task queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Materials below this tier are expanded into their own sub-materials
    #[serde(rename = "max-tier")]
    pub max_tier: u32,

    /// Upper bound on entries requested per bill of materials
    #[serde(rename = "max-bom-items")]
    pub max_bom_items: usize,

    /// Pause before the single shallow retry of a downstream trigger
    #[serde(rename = "trigger-retry-delay-ms")]
    pub trigger_retry_delay_ms: u64,

    /// Attempts a task gets before it is parked as failed
    #[serde(rename = "task-max-attempts")]
    pub task_max_attempts: u32,

    /// Delay before a failed task becomes claimable again
    #[serde(rename = "task-retry-delay-ms")]
    pub task_retry_delay_ms: u64,

    /// Lease on a claimed task; an expired lease means redelivery
    #[serde(rename = "lease-secs")]
    pub lease_secs: u64,

    /// Worker sleep when no task is ready
    #[serde(rename = "idle-poll-ms")]
    pub idle_poll_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_tier: 1,
            max_bom_items: 20,
            trigger_retry_delay_ms: 500,
            task_max_attempts: 3,
            task_retry_delay_ms: 30_000,
            lease_secs: 15 * 60,
            idle_poll_ms: 1_000,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the entity store
    #[serde(rename = "store-dir")]
    pub store_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/footprintd on Linux)
        let store_dir = dirs::data_local_dir()
            .map(|d| d.join("footprintd").join("store"))
            .unwrap_or_else(|| PathBuf::from(".footprintd/store"));
        Self { store_dir }
    }
}

/// Prompt template overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Directory searched for `{name}.pmt` before the embedded templates
    #[serde(rename = "override-dir")]
    pub override_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.base_delay_ms, 15_000);
        assert_eq!(config.retry.max_delay_ms, 180_000);
        assert_eq!(config.fanout.max_rounds, 3);
        assert_eq!(config.poller.interval_secs, 30);
        assert_eq!(config.poller.deadline_secs, 3300);
        assert_eq!(config.poller.id_batch_size, 30);
        assert_eq!(config.reasoning.max_retries, 5);
        assert_eq!(config.reasoning.max_verify_attempts, 2);
        assert_eq!(config.reasoning.evidence_threshold, EvidenceTier::StrongInference);
        assert!(!config.reasoning.deep_research);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
reasoning:
  max-retries: 2
  evidence-threshold: probable
  deep-research: true
poller:
  interval-secs: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.reasoning.max_retries, 2);
        assert_eq!(config.reasoning.evidence_threshold, EvidenceTier::Probable);
        assert!(config.reasoning.deep_research);
        assert_eq!(config.reasoning.max_verify_attempts, 2);
        assert_eq!(config.poller.interval_secs, 5);
        assert_eq!(config.poller.deadline_secs, 3300);
        assert_eq!(config.retry.max_attempts, 10);
    }

    #[test]
    fn test_load_explicit_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("pd.yml");
        fs::write(&path, "dispatch:\n  max-tier: 3\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.dispatch.max_tier, 3);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = PathBuf::from("/nonexistent/footprintd.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    #[serial]
    fn test_validate_requires_api_key() {
        let mut config = Config::default();
        config.llm.api_key_env = "FOOTPRINTD_TEST_KEY".to_string();
        unsafe { std::env::remove_var("FOOTPRINTD_TEST_KEY") };
        assert!(config.validate().is_err());

        unsafe { std::env::set_var("FOOTPRINTD_TEST_KEY", "sk-test") };
        assert!(config.validate().is_ok());
        assert_eq!(config.llm.api_key().unwrap(), "sk-test");
        unsafe { std::env::remove_var("FOOTPRINTD_TEST_KEY") };
    }
}
