use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::correction::CorrectionRule;
use crate::tracker::DEFAULT_API_BASE_URL;

/// Config file read from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "pivotal-commenter.toml";

/// `KEY=VALUE` environment file read from the working directory when no path is given.
pub const DEFAULT_ENV_FILE: &str = ".env";

pub const ENV_TEXT_TO_LOOK_FOR: &str = "TEXT_TO_LOOK_FOR";
pub const ENV_TEXT_TO_REPLACE_WITH: &str = "TEXT_TO_REPLACE_WITH";
pub const ENV_NAME: &str = "NAME";
pub const ENV_AUTH_TOKEN: &str = "PIVOTAL_AUTH_TOKEN";
pub const ENV_PROJECT_ID: &str = "PIVOTAL_PROJECT_ID";

const DEFAULT_LOOKBACK_HOURS: u32 = 1;
const DEFAULT_POLL_INTERVAL_MINUTES: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to parse pivotal project id {value:?}")]
    InvalidProjectId { value: String },

    /// Fatal even though the other text values may be empty: every comment
    /// contains the empty string, so the bot would correct every story it sees.
    #[error("TEXT_TO_LOOK_FOR must not be empty")]
    EmptyTargetPhrase,

    #[error("poll interval must be at least one minute")]
    ZeroPollInterval,

    #[error("poll interval of {minutes} minutes is too large")]
    PollIntervalTooLarge { minutes: u64 },

    #[error("lookback window must be at least one hour")]
    ZeroLookback,

    #[error("failed to read {}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", .path.display())]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to load environment file {}", .path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

/// Variables from an optional `.env` file.
///
/// Values are only consulted for keys missing from the process
/// environment; the file never overrides a variable that is already set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    vars: HashMap<String, String>,
}

impl EnvFile {
    /// Parse `path`, or `Ok(None)` when it does not exist.
    pub fn read_optional(path: &Path) -> Result<Option<Self>, ConfigError> {
        let to_error = |source: dotenvy::Error| ConfigError::EnvFile {
            path: path.to_path_buf(),
            source,
        };
        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) if e.not_found() => return Ok(None),
            Err(e) => return Err(to_error(e)),
        };
        let vars = iter
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(to_error)?;
        Ok(Some(Self { vars }))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Lookup that prefers `primary` and falls back to this file.
    pub fn layered<'a, F>(&'a self, primary: F) -> impl Fn(&str) -> Option<String> + 'a
    where
        F: Fn(&str) -> Option<String> + 'a,
    {
        move |key: &str| primary(key).or_else(|| self.get(key).map(str::to_string))
    }
}

/// Project id as written in the config file; TOML users may quote it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawProjectId {
    Number(i64),
    Text(String),
}

impl RawProjectId {
    fn into_text(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

/// Optional on-disk configuration. Environment variables take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub text_to_look_for: Option<String>,
    pub text_to_replace_with: Option<String>,
    pub name: Option<String>,
    pub pivotal_auth_token: Option<String>,
    pub pivotal_project_id: Option<RawProjectId>,
    pub api_base_url: Option<String>,
    pub lookback_hours: Option<u32>,
    pub poll_interval_minutes: Option<u64>,
}

impl ConfigFile {
    /// Read `path`, or `Ok(None)` when it does not exist.
    pub fn read_optional(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Everything the commenter needs, resolved once at startup.
#[derive(Clone)]
pub struct CommenterConfig {
    pub text_to_look_for: String,
    pub text_to_replace_with: String,
    pub name: String,
    pub auth_token: String,
    pub project_id: u64,
    pub api_base_url: String,
    pub lookback_hours: u32,
    pub poll_interval: Duration,
    /// Log corrections instead of posting them.
    pub dry_run: bool,
}

impl std::fmt::Debug for CommenterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommenterConfig")
            .field("text_to_look_for", &self.text_to_look_for)
            .field("text_to_replace_with", &self.text_to_replace_with)
            .field("name", &self.name)
            .field("auth_token", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("api_base_url", &self.api_base_url)
            .field("lookback_hours", &self.lookback_hours)
            .field("poll_interval", &self.poll_interval)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl CommenterConfig {
    /// Load from the process environment, then an optional `.env` file,
    /// then an optional TOML config file, in that order of precedence.
    ///
    /// Missing files are not errors; they are logged and skipped.
    pub fn load(
        config_path: Option<&Path>,
        env_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let env_path = env_path.unwrap_or(Path::new(DEFAULT_ENV_FILE));
        let env_file = match EnvFile::read_optional(env_path)? {
            Some(env_file) => {
                info!(path = %env_path.display(), "Loaded environment file");
                env_file
            }
            None => {
                warn!(
                    path = %env_path.display(),
                    "Environment file not found (the bot may not work)"
                );
                EnvFile::default()
            }
        };

        let config_path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let file = ConfigFile::read_optional(config_path)?;
        if file.is_none() {
            debug!(path = %config_path.display(), "No config file");
        }

        Self::from_lookup(
            env_file.layered(|key| std::env::var(key).ok()),
            file.unwrap_or_default(),
        )
    }

    /// Resolve configuration from a variable lookup, falling back to `file`.
    pub fn from_lookup<F>(lookup: F, file: ConfigFile) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve = |key: &str, fallback: Option<String>| -> String {
            match lookup(key).or(fallback) {
                Some(value) => value,
                None => {
                    warn!(key, "Configuration value not set, using empty string");
                    String::new()
                }
            }
        };

        let raw_project_id = lookup(ENV_PROJECT_ID)
            .or_else(|| file.pivotal_project_id.clone().map(RawProjectId::into_text))
            .unwrap_or_default();
        let project_id = parse_project_id(&raw_project_id)?;

        let text_to_look_for = resolve(ENV_TEXT_TO_LOOK_FOR, file.text_to_look_for);
        if text_to_look_for.is_empty() {
            return Err(ConfigError::EmptyTargetPhrase);
        }

        let lookback_hours = file.lookback_hours.unwrap_or(DEFAULT_LOOKBACK_HOURS);
        if lookback_hours == 0 {
            return Err(ConfigError::ZeroLookback);
        }

        let poll_minutes = file
            .poll_interval_minutes
            .unwrap_or(DEFAULT_POLL_INTERVAL_MINUTES);
        if poll_minutes == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        let poll_secs = poll_minutes
            .checked_mul(60)
            .ok_or(ConfigError::PollIntervalTooLarge {
                minutes: poll_minutes,
            })?;

        Ok(Self {
            text_to_look_for,
            text_to_replace_with: resolve(ENV_TEXT_TO_REPLACE_WITH, file.text_to_replace_with),
            name: resolve(ENV_NAME, file.name),
            auth_token: resolve(ENV_AUTH_TOKEN, file.pivotal_auth_token),
            project_id,
            api_base_url: file
                .api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            lookback_hours,
            poll_interval: Duration::from_secs(poll_secs),
            dry_run: false,
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Tracker search filter for stories updated within the lookback window.
    pub fn story_filter(&self) -> String {
        format!("updated:-{}h", self.lookback_hours)
    }

    pub fn correction_rule(&self) -> CorrectionRule {
        CorrectionRule::new(
            self.text_to_look_for.as_str(),
            self.text_to_replace_with.as_str(),
            self.name.as_str(),
        )
    }
}

fn parse_project_id(raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidProjectId {
            value: raw.to_string(),
        })
}
