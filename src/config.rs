//! Configuration for chanwatch monitors.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CHANWATCH_HOME, CHANWATCH_CONFIG)
//! 2. Config file (.chanwatch/config.yaml)
//! 3. Defaults (~/.chanwatch, no monitors)
//!
//! Config file discovery:
//! - CHANWATCH_CONFIG points at a file explicitly, otherwise
//! - searches current directory and parents for .chanwatch/config.yaml
//! - `paths.home` is relative to the .chanwatch/ directory
//!
//! Secrets never live in the file: adapters name the environment
//! variable to read them from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{MonitorSettings, StepPolicies};
use crate::domain::{SetBounds, SourceRef, TrackingMode};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to config file)
    pub home: Option<String>,
}

/// One monitored channel group
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Unique monitor name (also its checkpoint directory)
    pub name: String,

    /// Dedup strategy
    pub tracking: TrackingMode,

    /// Sources visited each cycle, in order
    pub sources: Vec<SourceRef>,

    pub source: SourceConfig,

    pub transform: TransformConfig,

    pub sink: SinkConfig,

    /// Pause between cycles
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Epoch length; defaults to 6h for cursor and 1h for set tracking
    pub epoch_seconds: Option<u64>,

    #[serde(default)]
    pub retry: StepPolicies,

    #[serde(default)]
    pub set_bounds: SetBounds,

    /// Failing cycles before an item is dead-lettered (`null` = never)
    #[serde(default = "default_max_item_failures")]
    pub max_item_failures: Option<u32>,
}

fn default_interval_seconds() -> u64 {
    60
}
fn default_max_item_failures() -> Option<u32> {
    Some(10)
}

impl MonitorConfig {
    /// Effective epoch length
    pub fn epoch_length(&self) -> Duration {
        let seconds = self.epoch_seconds.unwrap_or(match self.tracking {
            TrackingMode::Cursor => 6 * 3600,
            TrackingMode::Set => 3600,
        });
        Duration::from_secs(seconds)
    }

    /// Loop settings derived from this config
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            name: self.name.clone(),
            sources: self.sources.clone(),
            tracking: self.tracking,
            set_bounds: self.set_bounds,
            interval: Duration::from_secs(self.interval_seconds),
            epoch_length: self.epoch_length(),
            retry: self.retry.clone(),
            max_item_failures: self.max_item_failures,
        }
    }

    /// Page size for Slack history polls.
    ///
    /// A poll must not return more ids than the set tracker keeps after
    /// eviction, or evicted ids come back as new on the next cycle.
    pub fn history_limit(&self) -> Option<u32> {
        match &self.source {
            SourceConfig::SlackHistory { limit, .. } => {
                Some(limit.unwrap_or(self.set_bounds.retain as u32))
            }
            SourceConfig::Telegram { .. } => None,
        }
    }

    /// Validate the monitor definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Monitor name cannot be empty");
        }
        if self.name.contains(['/', '\\']) || self.name.starts_with('.') {
            anyhow::bail!("Monitor name '{}' is not a valid directory name", self.name);
        }
        if self.sources.is_empty() {
            anyhow::bail!("Monitor '{}' must list at least one source", self.name);
        }
        if self.interval_seconds == 0 {
            anyhow::bail!("Monitor '{}': interval_seconds must be at least 1", self.name);
        }
        if self.set_bounds.retain == 0 || self.set_bounds.retain >= self.set_bounds.max_len {
            anyhow::bail!(
                "Monitor '{}': set_bounds.retain must be between 1 and max_len - 1",
                self.name
            );
        }
        if let Some(limit) = self.history_limit() {
            if limit == 0 {
                anyhow::bail!("Monitor '{}': source.limit must be at least 1", self.name);
            }
            if self.tracking == TrackingMode::Set && (limit as usize) > self.set_bounds.retain {
                anyhow::bail!(
                    "Monitor '{}': source.limit ({}) exceeds set_bounds.retain ({}); \
                     evicted messages would be delivered again",
                    self.name,
                    limit,
                    self.set_bounds.retain
                );
            }
        }
        for (step, policy) in [
            ("poll", &self.retry.poll),
            ("transform", &self.retry.transform),
            ("deliver", &self.retry.deliver),
        ] {
            if policy.max_attempts == 0 {
                anyhow::bail!(
                    "Monitor '{}': retry.{}.max_attempts must be at least 1",
                    self.name,
                    step
                );
            }
            if policy.timeout_seconds == 0 {
                anyhow::bail!(
                    "Monitor '{}': retry.{}.timeout_seconds must be at least 1",
                    self.name,
                    step
                );
            }
        }
        if self.max_item_failures == Some(0) {
            anyhow::bail!("Monitor '{}': max_item_failures must be at least 1", self.name);
        }
        Ok(())
    }
}

/// Where items come from
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Telegram Bot API channel posts
    Telegram {
        #[serde(default = "default_telegram_token_env")]
        token_env: String,
        #[serde(default)]
        api_base: Option<String>,
    },

    /// Slack conversations.history
    SlackHistory {
        #[serde(default = "default_slack_token_env")]
        token_env: String,
        /// Messages per poll; defaults to `set_bounds.retain`
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        api_base: Option<String>,
    },
}

/// How items are rewritten or filtered
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Translate to English via the Anthropic Messages API
    Translate {
        #[serde(default = "default_anthropic_key_env")]
        api_key_env: String,
        #[serde(default = "default_translate_model")]
        model: String,
        #[serde(default)]
        instructions: Option<String>,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default)]
        api_base: Option<String>,
    },

    /// Forward only Slack messages carrying an approval reaction
    ReactionGate {
        #[serde(default = "default_slack_token_env")]
        token_env: String,
        #[serde(default = "default_reaction")]
        reaction: String,
        #[serde(default)]
        api_base: Option<String>,
    },

    /// Forward text unchanged
    Passthrough,
}

/// Where content goes
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Slack incoming webhook
    SlackWebhook {
        #[serde(default = "default_webhook_env")]
        webhook_env: String,
        /// Prefix each message with a banner naming its source
        #[serde(default)]
        label_source: bool,
    },
}

fn default_telegram_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}
fn default_slack_token_env() -> String {
    "SLACK_TOKEN".to_string()
}
fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_translate_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_reaction() -> String {
    "white_check_mark".to_string()
}
fn default_webhook_env() -> String {
    "SLACK_WEBHOOK_URL".to_string()
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to chanwatch home (checkpoint state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Configured monitors
    pub monitors: Vec<MonitorConfig>,
}

impl ResolvedConfig {
    /// Directory holding one subdirectory per monitor
    pub fn monitors_dir(&self) -> PathBuf {
        self.home.join("monitors")
    }

    pub fn monitor(&self, name: &str) -> Option<&MonitorConfig> {
        self.monitors.iter().find(|m| m.name == name)
    }

    /// Monitors matching `names`, or all monitors when `names` is empty
    pub fn select(&self, names: &[String]) -> Result<Vec<&MonitorConfig>> {
        if names.is_empty() {
            return Ok(self.monitors.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.monitor(name)
                    .with_context(|| format!("No monitor named '{}' in configuration", name))
            })
            .collect()
    }

    /// Validate all monitors and name uniqueness
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for monitor in &self.monitors {
            monitor.validate()?;
            if !seen.insert(monitor.name.as_str()) {
                anyhow::bail!("Duplicate monitor name '{}'", monitor.name);
            }
        }
        Ok(())
    }
}

/// Find config file via CHANWATCH_CONFIG or by searching upwards
fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("CHANWATCH_CONFIG") {
        return Some(PathBuf::from(explicit));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".chanwatch").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse config YAML content
pub fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(serde_yaml::from_str(content)?)
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".chanwatch");

    let config_file = find_config_file();

    let (home, monitors) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let home = if let Ok(env_home) = std::env::var("CHANWATCH_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            let config_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(config_dir, home_path)
        } else {
            default_home
        };

        (home, config.monitors)
    } else {
        let home = std::env::var("CHANWATCH_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);

        (home, Vec::new())
    };

    let resolved = ResolvedConfig {
        home,
        config_file,
        monitors,
    };
    resolved.validate()?;
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the per-monitor checkpoint root ($CHANWATCH_HOME/monitors)
pub fn monitors_dir() -> Result<PathBuf> {
    Ok(config()?.monitors_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
paths:
  home: ./state
monitors:
  - name: tg-monitor
    tracking: cursor
    sources: [dmytrogorin, automation_remarks_ua, xpinjection_channel]
    source:
      type: telegram
    transform:
      type: translate
    sink:
      type: slack_webhook
      label_source: true
    retry:
      transform:
        max_attempts: 3
  - name: slack-approval
    tracking: set
    sources: [C09R8GCL2K1]
    source:
      type: slack_history
    transform:
      type: reaction_gate
    sink:
      type: slack_webhook
      webhook_env: SLACK_WEBHOOK_URL_NEWS
    max_item_failures: null
"#;

    fn resolved(content: &str) -> ResolvedConfig {
        let file = parse_config(content).unwrap();
        ResolvedConfig {
            home: PathBuf::from("/tmp/chanwatch"),
            config_file: None,
            monitors: file.monitors,
        }
    }

    #[test]
    fn test_config_file_parsing() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert_eq!(config.monitors.len(), 2);

        let tg = &config.monitors[0];
        assert_eq!(tg.tracking, TrackingMode::Cursor);
        assert_eq!(tg.sources[1], SourceRef::from("automation_remarks_ua"));
        assert_eq!(tg.interval_seconds, 60);
        assert_eq!(tg.max_item_failures, Some(10));
        assert_eq!(tg.retry.transform.max_attempts, 3);
        assert_eq!(tg.retry.transform.timeout_seconds, 180);
        assert_eq!(tg.retry.poll.timeout_seconds, 60);
        assert!(matches!(
            tg.sink,
            SinkConfig::SlackWebhook { label_source: true, .. }
        ));

        let slack = &config.monitors[1];
        assert_eq!(slack.max_item_failures, None);
        assert_eq!(slack.set_bounds, SetBounds::default());
        assert!(matches!(
            &slack.transform,
            TransformConfig::ReactionGate { reaction, .. } if reaction == "white_check_mark"
        ));
    }

    #[test]
    fn test_epoch_defaults_by_tracking() {
        let config = resolved(SAMPLE);
        assert_eq!(config.monitors[0].epoch_length(), Duration::from_secs(6 * 3600));
        assert_eq!(config.monitors[1].epoch_length(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = resolved(SAMPLE);
        let copy = config.monitors[0].clone();
        config.monitors.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_set_bounds_rejected() {
        let mut config = resolved(SAMPLE);
        config.monitors[1].set_bounds = SetBounds {
            max_len: 20,
            retain: 20,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_history_limit_follows_retained_set() {
        let mut config = resolved(SAMPLE);
        assert_eq!(config.monitors[0].history_limit(), None);
        assert_eq!(config.monitors[1].history_limit(), Some(20));

        config.monitors[1].set_bounds = SetBounds {
            max_len: 100,
            retain: 40,
        };
        assert_eq!(config.monitors[1].history_limit(), Some(40));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_history_limit_above_retain_rejected() {
        let mut config = resolved(SAMPLE);
        if let SourceConfig::SlackHistory { limit, .. } = &mut config.monitors[1].source {
            *limit = Some(50);
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_and_timeout_rejected() {
        let mut config = resolved(SAMPLE);
        config.monitors[0].interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = resolved(SAMPLE);
        config.monitors[1].retry.deliver.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_select_unknown_monitor() {
        let config = resolved(SAMPLE);
        assert_eq!(config.select(&[]).unwrap().len(), 2);
        assert!(config.select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.chanwatch");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.chanwatch/./state")
        );
    }
}
