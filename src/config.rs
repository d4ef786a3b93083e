use std::{path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Settings file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "hn_crawler.toml";

/// Runtime settings of the crawler.
///
/// Layered from built-in defaults, an optional TOML file and `HN_CRAWLER__*`
/// environment variables. Command line flags are applied last with
/// [`Settings::apply_overrides`].
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Front page of the news site, also the base for relative story links.
    pub base_url: String,
    /// Pause between two crawl cycles, in seconds.
    pub period_secs: u64,
    /// Directory the pages are mirrored into.
    pub root: PathBuf,
    pub logfile: Option<PathBuf>,
    pub verbose: bool,
    pub log_json: bool,
    pub user_agent: Option<String>,
    /// Timeout of a single fetch attempt, in seconds.
    pub fetch_timeout_secs: u64,
    pub max_attempts: u32,
    pub crawling_concurrency: usize,
    pub processing_concurrency: usize,
    /// Pause after each scraped request, in milliseconds.
    pub delay_ms: u64,
}

/// Values given on the command line; `None` keeps the layered value.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub period_secs: Option<u64>,
    pub root: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub verbose: bool,
}

impl Settings {
    pub fn load(config_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let (file, required) = match config_file {
            Some(path) => (path, true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        Config::builder()
            .set_default("base_url", "https://news.ycombinator.com/")?
            .set_default("period_secs", 15)?
            .set_default("root", "PAGES")?
            .set_default("verbose", false)?
            .set_default("log_json", false)?
            .set_default("fetch_timeout_secs", 15)?
            .set_default("max_attempts", 5)?
            .set_default("crawling_concurrency", 30)?
            .set_default("processing_concurrency", 30)?
            .set_default("delay_ms", 0)?
            .add_source(File::from(file).required(required))
            .add_source(Environment::with_prefix("HN_CRAWLER").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn apply_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(period_secs) = overrides.period_secs {
            self.period_secs = period_secs;
        }
        if let Some(root) = overrides.root {
            self.root = root;
        }
        if overrides.logfile.is_some() {
            self.logfile = overrides.logfile;
        }
        self.verbose |= overrides.verbose;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}
