use std::time::Duration;

use chrono::NaiveDate;
use clap::{Args, ValueEnum};
use reqwest::Url;

use crate::error::{IngestError, Result};

pub const DEFAULT_FEED_URL: &str = "https://api.nasa.gov/neo/rest/v1/feed";
pub const DEFAULT_DB_PATH: &str = "data/nasa.sqlite";

/// What to do when an asteroid id is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConflictPolicy {
    /// Keep the row written first and ignore later versions.
    #[default]
    KeepFirst,
    /// Overwrite the stored row with the attributes seen last.
    UpsertLatest,
}

/// Run parameters for `run`, each also readable from the environment.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// NASA API key
    #[arg(long, env = "NASA_API_KEY", default_value = "DEMO_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Feed endpoint
    #[arg(long, env = "NEO_FEED_URL", default_value = DEFAULT_FEED_URL)]
    pub base_url: String,

    /// First day of the feed window (YYYY-MM-DD)
    #[arg(long, env = "NEO_START_DATE", default_value = "2024-01-01")]
    pub start_date: NaiveDate,

    /// Last day of the feed window (YYYY-MM-DD)
    #[arg(long, env = "NEO_END_DATE", default_value = "2024-01-07")]
    pub end_date: NaiveDate,

    /// Stop after this many records
    #[arg(short = 'n', long, env = "NEO_TARGET", default_value = "10000")]
    pub target: usize,

    /// Seconds to wait between page requests
    #[arg(long, env = "NEO_REQUEST_DELAY", default_value = "1")]
    pub delay_secs: f64,

    /// Per-request timeout in seconds
    #[arg(long, env = "NEO_REQUEST_TIMEOUT", default_value = "30")]
    pub timeout_secs: f64,

    /// Records per committed transaction
    #[arg(long, env = "NEO_BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// How to treat an asteroid id that is already stored
    #[arg(long, env = "NEO_ON_CONFLICT", value_enum, default_value_t = ConflictPolicy::KeepFirst)]
    pub on_conflict: ConflictPolicy,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub api_key: String,
    pub base_url: Url,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub target: usize,
    pub request_delay: Duration,
    pub request_timeout: Duration,
}

impl FeedConfig {
    /// URL of the first feed page; later pages come from the response's `links.next`.
    pub fn first_page_url(&self) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("start_date", &self.start_date.format("%Y-%m-%d").to_string())
            .append_pair("end_date", &self.end_date.format("%Y-%m-%d").to_string())
            .append_pair("api_key", &self.api_key);
        url
    }
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub batch_size: usize,
    pub on_conflict: ConflictPolicy,
    pub show_progress: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            on_conflict: ConflictPolicy::KeepFirst,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed: FeedConfig,
    pub persist: PersistConfig,
    pub db_path: std::path::PathBuf,
}

impl RunArgs {
    pub fn into_config(self, db_path: impl Into<std::path::PathBuf>) -> Result<Config> {
        if self.api_key.trim().is_empty() {
            return Err(IngestError::Config("api key must not be empty".into()));
        }
        if self.end_date < self.start_date {
            return Err(IngestError::Config(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            )));
        }
        if self.target == 0 {
            return Err(IngestError::Config("target must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config("batch size must be at least 1".into()));
        }
        let request_delay = seconds("delay", self.delay_secs, true)?;
        let request_timeout = seconds("timeout", self.timeout_secs, false)?;
        let base_url = Url::parse(&self.base_url)
            .map_err(|e| IngestError::Config(format!("invalid feed url {}: {}", self.base_url, e)))?;

        Ok(Config {
            feed: FeedConfig {
                api_key: self.api_key,
                base_url,
                start_date: self.start_date,
                end_date: self.end_date,
                target: self.target,
                request_delay,
                request_timeout,
            },
            persist: PersistConfig {
                batch_size: self.batch_size,
                on_conflict: self.on_conflict,
                show_progress: std::io::IsTerminal::is_terminal(&std::io::stderr()),
            },
            db_path: db_path.into(),
        })
    }
}

fn seconds(name: &str, value: f64, allow_zero: bool) -> Result<Duration> {
    let valid = value.is_finite() && (value > 0.0 || (allow_zero && value == 0.0));
    if !valid {
        return Err(IngestError::Config(format!("invalid {} of {} seconds", name, value)));
    }
    Ok(Duration::from_secs_f64(value))
}
