use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{Result, eyre::Context};
use log::{info, warn};
use serde::Deserialize;
use strum::{VariantArray, VariantNames};
use strum_macros::{Display, EnumString, VariantArray, VariantNames};

use crate::retry::RetryPolicy;

const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("'{0}' is not a valid relationship type. Valid options: {valid:?}", valid = RelationshipKind::VARIANTS)]
    InvalidRelationship(String),
    #[error("'{0}' is not a valid user ID, expected a positive integer")]
    InvalidUserId(String),
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidSeconds { field: &'static str, value: f64 },
    #[error("{field} must be between 1 and {} (got {value})", MAX_BATCH_SIZE)]
    InvalidBatchSize { field: &'static str, value: usize },
    #[error("invalid retry policy: {0}")]
    InvalidRetry(&'static str),
}

/// Process-level settings read from the environment (and an optional `.env`).
#[derive(Debug, Deserialize)]
pub struct Environment {
    #[serde(default = "default_config_path")]
    pub config: PathBuf,
}

fn default_config_path() -> PathBuf {
    "config.json".into()
}

impl Environment {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        envy::prefixed("TRACKER_")
            .from_env::<Self>()
            .wrap_err("failed to load environment")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum RelationshipKind {
    Friends,
    Followers,
    Followings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, VariantArray)]
pub enum Channel {
    Discord,
    Guilded,
}

impl Channel {
    pub const fn webhook_prefix(&self) -> &'static str {
        match self {
            Self::Discord => "https://discord.com/api/webhooks/",
            Self::Guilded => "https://media.guilded.gg/webhooks/",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUserId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: f64,
    pub multiplier: f64,
    pub max_delay: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            multiplier: 2.0,
            max_delay: 30.0,
        }
    }
}

impl RetryConfig {
    fn into_policy(self) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry("max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry("multiplier must be at least 1.0"));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: seconds("retry.base_delay", self.base_delay)?,
            multiplier: self.multiplier,
            max_delay: seconds("retry.max_delay", self.max_delay)?,
        })
    }
}

#[derive(Deserialize)]
struct RawConfig {
    discord_webhook_url: String,
    guilded_webhook_url: String,
    #[serde(rename = "relationshipType")]
    relationship_type: String,
    #[serde(rename = "Your_User_ID")]
    user_id: RawUserId,
    send_discord_log: bool,
    send_guilded_log: bool,
    send_new_entries: bool,
    send_removed_entries: bool,
    #[serde(rename = "embed_wait_HTTP")]
    embed_wait: f64,
    #[serde(default = "default_local_data_file")]
    local_data_file: PathBuf,
    #[serde(default = "default_last_run_time_file")]
    last_run_time_file: PathBuf,
    #[serde(default = "default_api_wait")]
    roblox_api_wait: f64,
    #[serde(default = "default_request_timeout")]
    request_timeout: f64,
    #[serde(default = "default_batch_size")]
    username_batch_size: usize,
    #[serde(default = "default_batch_size")]
    thumbnail_batch_size: usize,
    #[serde(default = "default_avatar_size")]
    avatar_size: String,
    #[serde(default = "default_headshot_size")]
    headshot_size: String,
    #[serde(default = "default_true")]
    create_missing_files: bool,
    #[serde(default)]
    show_loaded_settings: bool,
    #[serde(default = "default_progress_every")]
    progress_every: i64,
    #[serde(default)]
    retry: RetryConfig,
}

fn default_local_data_file() -> PathBuf {
    "LocalDataTemp".into()
}

fn default_last_run_time_file() -> PathBuf {
    "LastRunTime.txt".into()
}

fn default_api_wait() -> f64 {
    1.2
}

fn default_request_timeout() -> f64 {
    15.0
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_avatar_size() -> String {
    "720x720".into()
}

fn default_headshot_size() -> String {
    "100x100".into()
}

fn default_true() -> bool {
    true
}

fn default_progress_every() -> i64 {
    5
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidSeconds { field, value })
}

fn batch_size(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if (1..=MAX_BATCH_SIZE).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidBatchSize { field, value })
    }
}

fn parse_user_id(raw: RawUserId) -> Result<String, ConfigError> {
    let text = match raw {
        RawUserId::Number(id) => id.to_string(),
        RawUserId::Text(text) => text.trim().to_owned(),
    };
    match text.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id.to_string()),
        _ => Err(ConfigError::InvalidUserId(text)),
    }
}

/// Validated, immutable run settings. Built once in `main` and passed by
/// reference to every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub discord_webhook_url: String,
    pub guilded_webhook_url: String,
    pub relationship: RelationshipKind,
    pub user_id: String,
    pub send_discord: bool,
    pub send_guilded: bool,
    pub send_new_entries: bool,
    pub send_removed_entries: bool,
    pub embed_wait: Duration,
    pub api_wait: Duration,
    pub request_timeout: Duration,
    pub local_data_file: PathBuf,
    pub last_run_time_file: PathBuf,
    pub username_batch_size: usize,
    pub thumbnail_batch_size: usize,
    pub avatar_size: String,
    pub headshot_size: String,
    pub create_missing_files: bool,
    pub show_loaded_settings: bool,
    /// Log progress every N pages or batches; `None` disables progress lines.
    pub progress_every: Option<usize>,
    pub retry: RetryPolicy,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&text, base_dir)
    }

    /// Parses and validates a config document. Relative file paths are
    /// resolved against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;

        let relationship: RelationshipKind = raw
            .relationship_type
            .parse()
            .map_err(|_| ConfigError::InvalidRelationship(raw.relationship_type.clone()))?;

        let mut settings = Self {
            discord_webhook_url: raw.discord_webhook_url,
            guilded_webhook_url: raw.guilded_webhook_url,
            relationship,
            user_id: parse_user_id(raw.user_id)?,
            send_discord: raw.send_discord_log,
            send_guilded: raw.send_guilded_log,
            send_new_entries: raw.send_new_entries,
            send_removed_entries: raw.send_removed_entries,
            embed_wait: seconds("embed_wait_HTTP", raw.embed_wait)?,
            api_wait: seconds("roblox_api_wait", raw.roblox_api_wait)?,
            request_timeout: seconds("request_timeout", raw.request_timeout)?,
            local_data_file: base_dir.join(raw.local_data_file),
            last_run_time_file: base_dir.join(raw.last_run_time_file),
            username_batch_size: batch_size("username_batch_size", raw.username_batch_size)?,
            thumbnail_batch_size: batch_size("thumbnail_batch_size", raw.thumbnail_batch_size)?,
            avatar_size: raw.avatar_size,
            headshot_size: raw.headshot_size,
            create_missing_files: raw.create_missing_files,
            show_loaded_settings: raw.show_loaded_settings,
            progress_every: usize::try_from(raw.progress_every).ok().filter(|n| *n > 0),
            retry: raw.retry.into_policy()?,
        };
        settings.check_webhook_urls();
        Ok(settings)
    }

    /// A webhook URL with the wrong prefix disables its channel instead of
    /// failing the run.
    fn check_webhook_urls(&mut self) {
        for channel in Channel::VARIANTS {
            if !self.webhook_url(*channel).starts_with(channel.webhook_prefix()) {
                warn!("The {channel} webhook URL is invalid. Sending {channel} webhooks is disabled.");
                *self.send_flag(*channel) = false;
            }
        }
    }

    fn send_flag(&mut self, channel: Channel) -> &mut bool {
        match channel {
            Channel::Discord => &mut self.send_discord,
            Channel::Guilded => &mut self.send_guilded,
        }
    }

    pub fn webhook_url(&self, channel: Channel) -> &str {
        match channel {
            Channel::Discord => &self.discord_webhook_url,
            Channel::Guilded => &self.guilded_webhook_url,
        }
    }

    pub const fn is_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Discord => self.send_discord,
            Channel::Guilded => self.send_guilded,
        }
    }

    pub fn enabled_channels(&self) -> Vec<Channel> {
        Channel::VARIANTS
            .iter()
            .copied()
            .filter(|channel| self.is_enabled(*channel))
            .collect()
    }

    pub fn log_summary(&self) {
        info!("Initial configuration and webhook status");
        for channel in Channel::VARIANTS {
            info!(
                "{channel}: {} | Enabled? {}",
                redact(self.webhook_url(*channel), channel.webhook_prefix()),
                self.is_enabled(*channel)
            );
        }
        info!("Current Relationship Type: {}", self.relationship);
        info!(
            "Send new entries: {} | Send removed entries: {}",
            self.send_new_entries, self.send_removed_entries
        );
        info!("Embed wait: {:.2}s", self.embed_wait.as_secs_f64());
    }
}

fn redact(url: &str, prefix: &str) -> String {
    match url.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() => format!("{prefix}***"),
        _ => url.to_owned(),
    }
}
