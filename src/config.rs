use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub agent: AgentSettings,
    pub guardrail: GuardrailConfig,
    pub sessions: SessionsConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentSettings {
    pub name: String,
    /// Senders allowed to submit tasks to the agent
    pub allowed_senders: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailConfig {
    /// Pattern confidence at or above which a request is blocked outright
    #[serde(default = "default_block_threshold")]
    pub block_threshold: f64,
    /// When false, only the pattern stage runs
    #[serde(default = "default_ai_enabled")]
    pub ai_enabled: bool,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub api_key: String,
    /// Hard ceiling on one classifier call; on expiry the verdict is dropped
    #[serde(default = "default_classifier_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_classifier_max_tokens")]
    pub max_output_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_sessions_path")]
    pub base_path: PathBuf,
    /// Baseline credential copied into each new session's sandbox-home.
    /// Supports ${ENV_VAR} substitution.
    pub credential_file: Option<PathBuf>,
    /// Directory under sandbox-home where the sandboxed agent persists
    /// conversation state. Non-empty means the session can be resumed.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    pub image: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Pay-per-use API key used when the primary credential fails.
    /// Supports ${ENV_VAR} substitution.
    #[serde(default)]
    pub fallback_api_key: String,
    /// Maximum bytes of raw container output kept on the result
    #[serde(default = "default_raw_output_tail")]
    pub raw_output_tail: usize,
    /// How long completed entries stay in the execution registry
    #[serde(default = "default_registry_retention")]
    pub registry_retention_secs: u64,
}

fn default_block_threshold() -> f64 {
    0.9
}

fn default_ai_enabled() -> bool {
    true
}

fn default_classifier_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

fn default_classifier_timeout() -> u64 {
    10
}

fn default_classifier_max_tokens() -> u32 {
    300
}

fn default_sessions_path() -> PathBuf {
    PathBuf::from("./data/sessions")
}

fn default_state_dir() -> String {
    ".agent/state".to_string()
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_cpu_cores() -> f64 {
    2.0
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_turns() -> u32 {
    30
}

fn default_raw_output_tail() -> usize {
    4000
}

fn default_registry_retention() -> u64 {
    300
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${ANTHROPIC_API_KEY}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Checks if a sender is allowed to submit tasks to the agent
    pub fn is_allowed(&self, sender: &str) -> bool {
        // Compare on the bare address (without display name)
        let bare = sender
            .rsplit('<')
            .next()
            .unwrap_or(sender)
            .trim_end_matches('>')
            .trim();
        self.agent
            .allowed_senders
            .iter()
            .any(|allowed| allowed == bare || allowed == "*")
    }
}
