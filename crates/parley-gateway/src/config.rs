use anyhow::{Context, Result};
use parley_core::{BatcherConfig, ConversationKey};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub conversations: Vec<ConversationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub id: String,
    /// Extra names that count as a mention, besides `@<id>`.
    #[serde(default)]
    pub mention_names: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            mention_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SchedulerConfig {
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: default_batch_delay_ms(),
            max_keys: default_max_keys(),
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            max_keys: self.max_keys,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MemoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Turns kept per conversation and loaded from the store on a cold cache.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Conversations whose history stays cached; the least recently used
    /// one is dropped past this.
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    #[serde(default = "default_warm_on_start")]
    pub warm_on_start: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            history_turns: default_history_turns(),
            max_conversations: default_max_conversations(),
            warm_on_start: default_warm_on_start(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConversationConfig {
    /// Conversation key, e.g. `group:friends` or `dm:alice`.
    pub r#match: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    #[serde(default)]
    pub trigger_regex: Option<String>,
}

/// When an inbound item forces its batch out instead of waiting for the
/// timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TriggerKind {
    /// Agent id or a configured name appears in the text.
    #[default]
    Mention,
    Always,
    Regex,
    /// Never forces; the batch goes out when the timer fires.
    Timer,
}

fn default_agent_id() -> String {
    "parley".to_owned()
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_max_keys() -> usize {
    32
}

fn default_db_path() -> String {
    "./data/parley.db".to_owned()
}

fn default_history_turns() -> usize {
    16
}

fn default_max_conversations() -> usize {
    32
}

fn default_warm_on_start() -> bool {
    true
}

impl Config {
    /// Load config from a TOML file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Load the resolved config file, or fall back to defaults when no file
    /// was given and none exists at the default locations.
    pub(crate) fn load_or_default(explicit: Option<&str>) -> Result<(Self, PathBuf)> {
        let path = Self::find_config_path(explicit);
        if explicit.is_none() && !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok((Self::default(), path));
        }
        Ok((Self::load(&path)?, path))
    }

    /// Check the values serde can't: non-empty ids, positive limits,
    /// well-formed keys and patterns.
    pub(crate) fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.agent.id.trim().is_empty(), "agent.id must not be empty");
        anyhow::ensure!(
            self.agent.mention_names.iter().all(|name| !name.trim().is_empty()),
            "agent.mention_names must not contain empty names"
        );
        anyhow::ensure!(
            self.scheduler.batch_delay_ms > 0,
            "scheduler.batch_delay_ms must be greater than zero"
        );
        anyhow::ensure!(
            self.scheduler.max_keys > 0,
            "scheduler.max_keys must be greater than zero"
        );
        anyhow::ensure!(
            self.memory.max_conversations > 0,
            "memory.max_conversations must be greater than zero"
        );

        for conversation in &self.conversations {
            conversation
                .r#match
                .parse::<ConversationKey>()
                .with_context(|| format!("conversations: bad key '{}'", conversation.r#match))?;

            match (&conversation.trigger, &conversation.trigger_regex) {
                (TriggerKind::Regex, None) => anyhow::bail!(
                    "conversations: '{}' uses trigger = \"regex\" without trigger_regex",
                    conversation.r#match
                ),
                (_, Some(pattern)) => {
                    Regex::new(pattern).with_context(|| {
                        format!(
                            "conversations: invalid trigger_regex for '{}'",
                            conversation.r#match
                        )
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolve the database path against the config file's directory.
    pub(crate) fn resolve_db_path(&self, base_dir: &Path) -> PathBuf {
        let db_path = PathBuf::from(&self.memory.db_path);
        let resolved = if db_path.is_absolute() {
            db_path
        } else {
            base_dir.join(db_path)
        };
        debug!(db_path = %resolved.display(), "resolved database path");
        resolved
    }

    /// Resolve config path: check arg, then default locations.
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        // Check current directory
        let local = PathBuf::from("parley.toml");
        if local.exists() {
            return local;
        }

        // Check XDG config
        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("parley/parley.toml");
            if xdg.exists() {
                return xdg;
            }
        }

        // Check ~/.config/parley
        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".config/parley/parley.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        // Default to local
        local
    }
}
