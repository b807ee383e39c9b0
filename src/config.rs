//! Configuration types.
//!
//! Loaded from a TOML file (path in `MAIL_TRIAGE_CONFIG`, default
//! `./mail-triage.toml`); secrets and a few scalars can be overridden from
//! the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::folders::{DestinationCatalog, FolderPath};
use crate::llm::LlmConfig;
use crate::mail::EligibilityWindow;
use crate::mail::graph::{DEFAULT_GRAPH_URL, DEFAULT_LOGIN_URL, GraphAuth, GraphConfig};

pub const CONFIG_PATH_ENV: &str = "MAIL_TRIAGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./mail-triage.toml";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Longest accepted folder cache TTL: one year.
pub const MAX_FOLDER_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub mailbox: MailboxConfig,
    pub schedule: ScheduleConfig,
    pub classifier: ClassifierConfig,
    pub graph: GraphSettings,
    pub cache: CacheConfig,
    /// Directory for a daily-rolling log file. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Which mailbox is triaged and where mail may go.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub owner_id: String,
    pub source_folder: String,
    /// Logical name → destination folder path.
    pub destinations: BTreeMap<String, String>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            source_folder: "Inbox".to_string(),
            destinations: BTreeMap::new(),
        }
    }
}

/// Cycle timing and batch limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub poll_interval_secs: u64,
    pub max_emails_per_run: usize,
    pub min_age_minutes: i64,
    pub max_age_hours: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300, // 5 minutes
            max_emails_per_run: 20,
            min_age_minutes: 5,
            max_age_hours: 72,
        }
    }
}

/// Model and prompt settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Handlebars template overriding the embedded decision prompt.
    pub prompt_template: Option<PathBuf>,
    pub system_policy: Option<String>,
    pub model: String,
    pub api_key: Option<SecretString>,
    /// Override for the API root.
    pub base_url: Option<String>,
    pub max_tool_rounds: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            prompt_template: None,
            system_policy: None,
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: None,
            max_tool_rounds: 4,
        }
    }
}

/// Microsoft Graph app registration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub base_url: Option<String>,
    pub login_url: Option<String>,
}

/// Folder cache settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Expire resolved folder ids after this many seconds. Never when unset.
    pub folder_ttl_secs: Option<u64>,
}

impl TriageConfig {
    /// Config file path from `MAIL_TRIAGE_CONFIG`.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Read `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::MissingRequired {
                    key: path.display().to_string(),
                    hint: format!("Create it or point {CONFIG_PATH_ENV} at a config file"),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MAIL_TRIAGE_OWNER_ID") {
            self.mailbox.owner_id = v;
        }
        if let Some(v) = get("MAIL_TRIAGE_SOURCE_FOLDER") {
            self.mailbox.source_folder = v;
        }
        if let Some(v) = get("MAIL_TRIAGE_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.schedule.poll_interval_secs = v;
        }
        if let Some(v) = get("MAIL_TRIAGE_MAX_EMAILS").and_then(|v| v.parse().ok()) {
            self.schedule.max_emails_per_run = v;
        }
        if let Some(v) = get("MAIL_TRIAGE_MODEL") {
            self.classifier.model = v;
        }
        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.classifier.api_key = Some(SecretString::from(v));
        }
        if let Some(v) = get("GRAPH_TENANT_ID") {
            self.graph.tenant_id = Some(v);
        }
        if let Some(v) = get("GRAPH_CLIENT_ID") {
            self.graph.client_id = Some(v);
        }
        if let Some(v) = get("GRAPH_CLIENT_SECRET") {
            self.graph.client_secret = Some(SecretString::from(v));
        }
        if let Some(v) = get("MAIL_TRIAGE_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
    }

    /// Reject settings the service cannot start with. Mailbox credentials
    /// are only required for a live run.
    pub fn validate(&self, dry_run: bool) -> Result<(), ConfigError> {
        if self.mailbox.owner_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mailbox.owner_id".into(),
                hint: "Set it in the config file or MAIL_TRIAGE_OWNER_ID".into(),
            });
        }
        if self.mailbox.destinations.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mailbox.destinations".into(),
                hint: "Add at least one `name = \"Folder/Path\"` entry".into(),
            });
        }
        for (name, path) in &self.mailbox.destinations {
            FolderPath::parse(path).map_err(|_| ConfigError::InvalidValue {
                key: format!("mailbox.destinations.{name}"),
                message: "folder path is empty".into(),
            })?;
        }
        FolderPath::parse(&self.mailbox.source_folder).map_err(|_| ConfigError::InvalidValue {
            key: "mailbox.source_folder".into(),
            message: "folder path is empty".into(),
        })?;
        if self.schedule.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "schedule.poll_interval_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.schedule.max_emails_per_run == 0 {
            return Err(ConfigError::InvalidValue {
                key: "schedule.max_emails_per_run".into(),
                message: "must be greater than zero".into(),
            });
        }
        let window = self.window()?;
        self.folder_ttl()?;
        if !window.is_valid() {
            tracing::warn!(
                min_age_minutes = self.schedule.min_age_minutes,
                max_age_hours = self.schedule.max_age_hours,
                "Eligibility window is empty; no mail will be fetched"
            );
        }

        self.llm_config()?;
        if !dry_run {
            self.graph_config()?;
        }
        Ok(())
    }

    pub fn window(&self) -> Result<EligibilityWindow, ConfigError> {
        fn age(
            value: i64,
            key: &str,
            to_delta: fn(i64) -> Option<TimeDelta>,
        ) -> Result<TimeDelta, ConfigError> {
            if value < 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must not be negative".into(),
                });
            }
            to_delta(value).ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{value} is out of range"),
            })
        }

        Ok(EligibilityWindow::new(
            age(
                self.schedule.min_age_minutes,
                "schedule.min_age_minutes",
                TimeDelta::try_minutes,
            )?,
            age(
                self.schedule.max_age_hours,
                "schedule.max_age_hours",
                TimeDelta::try_hours,
            )?,
        ))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_interval_secs)
    }

    pub fn folder_ttl(&self) -> Result<Option<Duration>, ConfigError> {
        match self.cache.folder_ttl_secs {
            Some(secs) if secs == 0 || secs > MAX_FOLDER_TTL_SECS => {
                Err(ConfigError::InvalidValue {
                    key: "cache.folder_ttl_secs".into(),
                    message: format!("must be between 1 and {MAX_FOLDER_TTL_SECS}"),
                })
            }
            secs => Ok(secs.map(Duration::from_secs)),
        }
    }

    pub fn catalog(&self) -> DestinationCatalog {
        DestinationCatalog::new(self.mailbox.destinations.clone())
    }

    pub fn llm_config(&self) -> Result<LlmConfig, ConfigError> {
        let api_key = self
            .classifier
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "classifier.api_key".into(),
                hint: "export ANTHROPIC_API_KEY=sk-ant-...".into(),
            })?;
        Ok(LlmConfig {
            api_key,
            model: self.classifier.model.clone(),
            base_url: self.classifier.base_url.clone(),
        })
    }

    pub fn graph_config(&self) -> Result<GraphConfig, ConfigError> {
        fn required<T: Clone>(value: &Option<T>, key: &str, env: &str) -> Result<T, ConfigError> {
            value.clone().ok_or_else(|| ConfigError::MissingRequired {
                key: key.to_string(),
                hint: format!("Set it in the config file or {env}"),
            })
        }

        Ok(GraphConfig {
            base_url: self
                .graph
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_GRAPH_URL.to_string()),
            auth: GraphAuth::ClientCredentials {
                tenant_id: required(&self.graph.tenant_id, "graph.tenant_id", "GRAPH_TENANT_ID")?,
                client_id: required(&self.graph.client_id, "graph.client_id", "GRAPH_CLIENT_ID")?,
                client_secret: required(
                    &self.graph.client_secret,
                    "graph.client_secret",
                    "GRAPH_CLIENT_SECRET",
                )?,
                login_url: self
                    .graph
                    .login_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            },
        })
    }
}
