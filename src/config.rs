//! Global configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keyring service name used for Slack credentials.
const KEYRING_SERVICE: &str = "thread-relay";

/// Permission modes accepted by the agent CLI.
const PERMISSION_MODES: &[&str] = &[
    "default",
    "acceptEdits",
    "dontAsk",
    "bypassPermissions",
    "plan",
];

/// Slack credentials for Socket Mode connectivity.
///
/// Tokens are loaded at runtime via OS keychain or environment variables,
/// never from the TOML config file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SlackConfig {
    /// App-level token used for Socket Mode (populated at runtime).
    #[serde(skip)]
    pub app_token: String,
    /// Bot user token used for posting messages (populated at runtime).
    #[serde(skip)]
    pub bot_token: String,
}

/// Which categories of agent activity are republished to chat.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Final text and completion summary only.
    Minimal,
    /// Adds tool activity and tool errors.
    Normal,
    /// Adds non-noisy tool results and compaction notices.
    #[default]
    Verbose,
}

impl Verbosity {
    /// Whether tool activity lines are shown.
    #[must_use]
    pub fn shows_activity(self) -> bool {
        self >= Self::Normal
    }

    /// Whether successful tool results are shown.
    #[must_use]
    pub fn shows_tool_results(self) -> bool {
        self == Self::Verbose
    }

    /// Whether context-compaction notices are shown.
    #[must_use]
    pub fn shows_compaction(self) -> bool {
        self == Self::Verbose
    }
}

/// Agent CLI invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent CLI binary.
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// Model override passed as `--model`.
    #[serde(default)]
    pub model: Option<String>,
    /// Permission mode; omitted from the command line when `default`.
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    /// Tools the agent may use without asking.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools the agent may never use.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// Turn cap per invocation.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Spend cap per invocation in USD.
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    /// Seconds the subprocess gets to exit after stdin closes.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            model: None,
            permission_mode: default_permission_mode(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            max_turns: None,
            max_budget_usd: None,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

fn default_agent_binary() -> String {
    "claude".into()
}

fn default_permission_mode() -> String {
    "acceptEdits".into()
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

/// Timer and throttle settings for the pipeline.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimingConfig {
    /// Stream inactivity before buffered output is flushed.
    #[serde(default = "default_idle_flush_ms")]
    pub idle_flush_ms: u64,
    /// Turn age at which the thread gets the long-running marker.
    #[serde(default = "default_long_running_seconds")]
    pub long_running_seconds: u64,
    /// Minimum spacing between posts to one channel.
    #[serde(default = "default_min_post_interval_ms")]
    pub min_post_interval_ms: u64,
    /// Idle age after which a session record is removed.
    #[serde(default = "default_session_max_age_hours")]
    pub session_max_age_hours: u64,
    /// How often the cleanup task runs.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// How long an agent-posed question waits for an answer.
    #[serde(default = "default_question_timeout_seconds")]
    pub question_timeout_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_flush_ms: default_idle_flush_ms(),
            long_running_seconds: default_long_running_seconds(),
            min_post_interval_ms: default_min_post_interval_ms(),
            session_max_age_hours: default_session_max_age_hours(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            question_timeout_seconds: default_question_timeout_seconds(),
        }
    }
}

impl TimingConfig {
    /// Idle-flush delay.
    #[must_use]
    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }

    /// Long-running marker delay.
    #[must_use]
    pub fn long_running(&self) -> Duration {
        Duration::from_secs(self.long_running_seconds)
    }

    /// Per-channel post spacing.
    #[must_use]
    pub fn min_post_interval(&self) -> Duration {
        Duration::from_millis(self.min_post_interval_ms)
    }

    /// Maximum idle age of a session record.
    #[must_use]
    pub fn session_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.session_max_age_hours).unwrap_or(i64::MAX))
    }

    /// Cleanup task period.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Question rendezvous timeout.
    #[must_use]
    pub fn question_timeout(&self) -> Duration {
        Duration::from_secs(self.question_timeout_seconds)
    }
}

fn default_idle_flush_ms() -> u64 {
    3000
}

fn default_long_running_seconds() -> u64 {
    60
}

fn default_min_post_interval_ms() -> u64 {
    1000
}

fn default_session_max_age_hours() -> u64 {
    24
}

fn default_cleanup_interval_seconds() -> u64 {
    3600
}

fn default_question_timeout_seconds() -> u64 {
    600
}

fn default_rate_limit() -> u32 {
    10
}

/// Directory name under the platform config and cache roots.
const APP_DIR: &str = "thread-relay";

/// Platform directory `root` joined with [`APP_DIR`], falling back to the
/// home directory and then the system temp directory.
fn platform_dir(root: Option<PathBuf>) -> PathBuf {
    root.map(|dir| dir.join(APP_DIR))
        .or_else(|| dirs::home_dir().map(|home| home.join(format!(".{APP_DIR}"))))
        .unwrap_or_else(|| env::temp_dir().join(APP_DIR))
}

fn default_state_dir() -> PathBuf {
    platform_dir(dirs::config_dir())
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Slack credentials (runtime only).
    #[serde(default)]
    pub slack: SlackConfig,
    /// Slack user IDs allowed to talk to the bot.
    ///
    /// Absent means open; an empty list blocks everyone.
    #[serde(default)]
    pub allowed_users: Option<Vec<String>>,
    /// Base for relative `channel_dirs` entries.
    #[serde(default)]
    pub base_directory: Option<PathBuf>,
    /// Channel name to working directory.
    #[serde(default)]
    pub channel_dirs: HashMap<String, String>,
    /// Messages per user per rolling minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Chat verbosity tier.
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Directory holding the persisted alias map.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Scratch directory for downloaded attachments.
    #[serde(default)]
    pub attachments_dir: Option<PathBuf>,
    /// Upload images the agent writes or mentions back into the thread.
    #[serde(default)]
    pub post_images: bool,
    /// Agent CLI settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Timers and throttles.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load Slack credentials from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env vars provide
    /// the required tokens.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.slack.app_token = load_credential("slack_app_token", "SLACK_APP_TOKEN").await?;
        self.slack.bot_token = load_credential("slack_bot_token", "SLACK_BOT_TOKEN").await?;
        Ok(())
    }

    /// Whether `user_id` may talk to the bot.
    #[must_use]
    pub fn is_user_allowed(&self, user_id: &str) -> bool {
        crate::pipeline::guard::is_allowed(self.allowed_users.as_deref(), user_id)
    }

    /// Path of the persisted alias map.
    #[must_use]
    pub fn alias_map_path(&self) -> PathBuf {
        self.state_dir.join("session_aliases.json")
    }

    /// Scratch root for attachment downloads, outside any working tree.
    #[must_use]
    pub fn attachments_root(&self) -> PathBuf {
        self.attachments_dir
            .clone()
            .unwrap_or_else(|| platform_dir(dirs::cache_dir()).join("attachments"))
    }

    /// Resolve the working directory mapped to a channel name.
    ///
    /// Relative entries are joined to `base_directory` and must not climb
    /// out of it. Absolute entries are an explicit operator choice and are
    /// used as configured, without confinement to `base_directory`.
    #[must_use]
    pub fn resolve_channel_dir(&self, channel_name: &str) -> Option<PathBuf> {
        let mapped = Path::new(self.channel_dirs.get(channel_name)?);
        if mapped.is_absolute() {
            return Some(mapped.to_path_buf());
        }
        if mapped
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            warn!(channel_name, "channel directory escapes base directory; ignored");
            return None;
        }
        Some(match &self.base_directory {
            Some(base) => base.join(mapped),
            None => mapped.to_path_buf(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limit == 0 {
            return Err(AppError::Config("rate_limit must be greater than zero".into()));
        }

        if self.agent.max_turns == Some(0) {
            return Err(AppError::Config("agent.max_turns must be greater than zero".into()));
        }

        if let Some(budget) = self.agent.max_budget_usd {
            if budget <= 0.0 || !budget.is_finite() {
                return Err(AppError::Config(
                    "agent.max_budget_usd must be a positive number".into(),
                ));
            }
        }

        if !PERMISSION_MODES.contains(&self.agent.permission_mode.as_str()) {
            return Err(AppError::Config(format!(
                "agent.permission_mode '{}' is not one of {}",
                self.agent.permission_mode,
                PERMISSION_MODES.join(", ")
            )));
        }

        let allowed_count = self.allowed_users.as_ref().map_or(usize::MAX, Vec::len);
        if self.agent.permission_mode == "bypassPermissions" && allowed_count > 1 {
            return Err(AppError::Config(
                "bypassPermissions requires allowed_users with at most one user".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
