//! Broker configuration: TOML file with serde defaults and env override.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PARLEY_CONFIG: &str = "PARLEY_CONFIG";

const DEFAULT_GATEWAY_BIND: &str = "127.0.0.1:8444";
const DEFAULT_PLAYER_COMMAND: &[&str] = &["paplay", "{artifact}"];
const DEFAULT_GENERATOR_COMMAND: &[&str] =
    &["espeak-ng", "--stdout", "-s", "{speed_wpm}", "{text}"];
const DEFAULT_TTS_VOICE: &str = "alloy";
const DEFAULT_TTS_STYLE: &str = "neutral";
const DEFAULT_TTS_SPEED: f32 = 1.0;
const DEFAULT_TTS_MODEL: &str = "espeak-ng";
const DEFAULT_CACHE_DIR: &str = "/tmp/parley-tts-cache";
const DEFAULT_PREGENERATE_CONCURRENCY: usize = 4;
const DEFAULT_STALE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 30;
const DEFAULT_HISTORY_CAP: usize = 200;
const DEFAULT_RECOVERY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RECOVERY_COOLDOWN_SECS: u64 = 30;
const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 512;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParleyConfig {
    #[serde(default)]
    pub gateway: GatewayConfigToml,
    #[serde(default)]
    pub tts: TtsConfigToml,
    #[serde(default)]
    pub session: SessionConfigToml,
    #[serde(default)]
    pub recovery: RecoveryConfigToml,
    #[serde(default)]
    pub events: EventsConfigToml,
    /// Options appended to every choice presentation, deduplicated by label.
    #[serde(default)]
    pub extra_options: Vec<ExtraOptionToml>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfigToml {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

impl Default for GatewayConfigToml {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsConfigToml {
    /// Player argv; `{artifact}` is replaced with the cached audio path.
    #[serde(default = "default_player_command")]
    pub player_command: Vec<String>,
    /// Generator argv; `{text}`, `{voice}`, `{style}`, `{speed_wpm}`,
    /// `{model}` and `{out}` are substituted. Without `{out}` the generator's
    /// stdout is captured into the output file.
    #[serde(default = "default_generator_command")]
    pub generator_command: Vec<String>,
    /// Offline fallback generator, tried when the primary one fails.
    #[serde(default)]
    pub fallback_generator_command: Option<Vec<String>>,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    #[serde(default = "default_tts_style")]
    pub style: String,
    #[serde(default = "default_tts_speed")]
    pub speed: f32,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_pregenerate_concurrency")]
    pub pregenerate_concurrency: usize,
}

impl Default for TtsConfigToml {
    fn default() -> Self {
        Self {
            player_command: default_player_command(),
            generator_command: default_generator_command(),
            fallback_generator_command: None,
            voice: default_tts_voice(),
            style: default_tts_style(),
            speed: default_tts_speed(),
            model: default_tts_model(),
            cache_dir: default_cache_dir(),
            pregenerate_concurrency: default_pregenerate_concurrency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfigToml {
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

impl Default for SessionConfigToml {
    fn default() -> Self {
        Self {
            stale_timeout_secs: default_stale_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            history_cap: default_history_cap(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfigToml {
    #[serde(default = "default_recovery_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_recovery_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Escalating recovery argv list, attempt n runs `commands[n-1]`
    /// (clamped to the last entry).
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
}

impl Default for RecoveryConfigToml {
    fn default() -> Self {
        Self {
            max_attempts: default_recovery_max_attempts(),
            cooldown_secs: default_recovery_cooldown_secs(),
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfigToml {
    #[serde(default = "default_event_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for EventsConfigToml {
    fn default() -> Self {
        Self {
            buffer_capacity: default_event_buffer_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraOptionToml {
    pub label: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub silent: bool,
}

fn default_gateway_bind() -> String {
    DEFAULT_GATEWAY_BIND.to_owned()
}

fn default_player_command() -> Vec<String> {
    DEFAULT_PLAYER_COMMAND.iter().map(|s| (*s).to_owned()).collect()
}

fn default_generator_command() -> Vec<String> {
    DEFAULT_GENERATOR_COMMAND
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_tts_voice() -> String {
    DEFAULT_TTS_VOICE.to_owned()
}

fn default_tts_style() -> String {
    DEFAULT_TTS_STYLE.to_owned()
}

fn default_tts_speed() -> f32 {
    DEFAULT_TTS_SPEED
}

fn default_tts_model() -> String {
    DEFAULT_TTS_MODEL.to_owned()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_pregenerate_concurrency() -> usize {
    DEFAULT_PREGENERATE_CONCURRENCY
}

fn default_stale_timeout_secs() -> u64 {
    DEFAULT_STALE_TIMEOUT_SECS
}

fn default_maintenance_interval_secs() -> u64 {
    DEFAULT_MAINTENANCE_INTERVAL_SECS
}

fn default_history_cap() -> usize {
    DEFAULT_HISTORY_CAP
}

fn default_recovery_max_attempts() -> u32 {
    DEFAULT_RECOVERY_MAX_ATTEMPTS
}

fn default_recovery_cooldown_secs() -> u64 {
    DEFAULT_RECOVERY_COOLDOWN_SECS
}

fn default_event_buffer_capacity() -> usize {
    DEFAULT_EVENT_BUFFER_CAPACITY
}

impl ParleyConfig {
    /// Load from `PARLEY_CONFIG` if set, otherwise from the given default
    /// path; a missing file yields the built-in defaults.
    pub fn load(default_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_PARLEY_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_path.as_ref().to_path_buf());

        if !path.is_file() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::configuration(format!(
                "failed to read config {}: {error}",
                path.display()
            ))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|error| {
            ConfigError::configuration(format!(
                "failed to parse config {}: {error}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tts.player_command.is_empty() {
            return Err(ConfigError::configuration(
                "tts.player_command must not be empty",
            ));
        }
        if self.tts.generator_command.is_empty() {
            return Err(ConfigError::configuration(
                "tts.generator_command must not be empty",
            ));
        }
        if !(0.25..=4.0).contains(&self.tts.speed) {
            return Err(ConfigError::configuration(
                "tts.speed must be between 0.25 and 4.0",
            ));
        }
        if self.session.history_cap == 0 {
            return Err(ConfigError::configuration(
                "session.history_cap must be greater than 0",
            ));
        }
        if self.events.buffer_capacity == 0 {
            return Err(ConfigError::configuration(
                "events.buffer_capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}
