use crate::datastore::Datastore;
use crate::error::{LimiterError, LimiterResult};
use crate::limiter::Limiter;
use crate::synchronizer::{BlockingSynchronizer, NonblockingSynchronizer};
use crate::window::{LocalWindow, StopFn, SyncWindow};
use clap::{Parser, ValueEnum};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use validator::Validate;

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_:.@-]+$").expect("valid key pattern"));

/// How a limiter's windows are kept in step with other instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// In-memory only, no datastore.
    Local,
    /// Exchange inline on the admitting thread.
    Blocking,
    /// Exchange on a background worker thread.
    #[default]
    Nonblocking,
}

/// Settings for one limiter.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LimiterConfig {
    /// Logical resource being limited; shared by all cooperating instances.
    #[validate(length(min = 1, max = 256))]
    pub key: String,

    #[serde(with = "humantime_serde")]
    pub size: Duration,

    #[validate(range(min = 1))]
    pub limit: i64,

    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    #[serde(default)]
    pub sync_mode: SyncMode,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key: "test".to_string(),
            size: Duration::from_secs(1),
            limit: 20,
            sync_interval: Duration::from_millis(200),
            sync_mode: SyncMode::default(),
        }
    }
}

impl LimiterConfig {
    /// Validates every field.
    pub fn check(&self) -> LimiterResult<()> {
        self.validate()?;

        if self.size.is_zero() {
            return Err(LimiterError::ValidationError(
                "Window size must be greater than 0".to_string(),
            ));
        }
        if self.sync_mode != SyncMode::Local && self.sync_interval.is_zero() {
            return Err(LimiterError::ValidationError(
                "Sync interval must be greater than 0".to_string(),
            ));
        }
        if !KEY_PATTERN.is_match(&self.key) {
            return Err(LimiterError::ValidationError(
                "Key can only contain alphanumeric characters and _ : . @ -".to_string(),
            ));
        }

        Ok(())
    }

    /// Datastore expiry recommended for this window size.
    pub fn datastore_ttl(&self) -> Duration {
        self.size * 2
    }

    /// Builds a limiter whose windows match `sync_mode`.
    ///
    /// Synchronized modes require a datastore.
    pub fn new_limiter(
        &self,
        store: Option<Arc<dyn Datastore>>,
    ) -> LimiterResult<(Limiter, StopFn)> {
        self.check()?;

        let store = match (self.sync_mode, store) {
            (SyncMode::Local, _) => {
                return Limiter::new(self.size, self.limit, LocalWindow::boxed);
            }
            (_, Some(store)) => store,
            (mode, None) => {
                return Err(LimiterError::Configuration(format!(
                    "sync mode {:?} requires a datastore",
                    mode
                )));
            }
        };

        let key = self.key.clone();
        let interval = self.sync_interval;

        if self.sync_mode == SyncMode::Blocking {
            Limiter::new(self.size, self.limit, || {
                SyncWindow::boxed(
                    key.clone(),
                    BlockingSynchronizer::new(store.clone(), interval),
                )
            })
        } else {
            Limiter::new(self.size, self.limit, || {
                SyncWindow::boxed(
                    key.clone(),
                    NonblockingSynchronizer::new(store.clone(), interval),
                )
            })
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Command line for the demo admission service.
#[derive(Debug, Clone, Parser)]
#[command(name = "slidingwindow", version, about = "Sliding-window admission service")]
pub struct Cli {
    /// The time duration during which the limit takes effect.
    #[arg(long, env = "SLIDINGWINDOW_SIZE", default_value = "1s", value_parser = parse_duration)]
    pub size: Duration,

    /// The maximum events permitted per window size.
    #[arg(long, env = "SLIDINGWINDOW_LIMIT", default_value_t = 20)]
    pub limit: i64,

    /// The name of the resource that will be limited.
    #[arg(long, env = "SLIDINGWINDOW_RESOURCE", default_value = "test")]
    pub resource: String,

    /// The time duration of the sync interval.
    #[arg(long = "sync", env = "SLIDINGWINDOW_SYNC", default_value = "200ms", value_parser = parse_duration)]
    pub sync_interval: Duration,

    #[arg(long, env = "SLIDINGWINDOW_SYNC_MODE", value_enum, default_value_t = SyncMode::Nonblocking)]
    pub sync_mode: SyncMode,

    /// The number of limiters that will work concurrently.
    #[arg(long, env = "SLIDINGWINDOW_SCALE", default_value_t = 2)]
    pub scale: usize,

    /// Redis URL; an in-memory datastore is used when absent.
    #[arg(long = "redis", env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// The listen address of the HTTP server.
    #[arg(long, env = "BIND_ADDR")]
    pub listen: SocketAddr,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            key: self.resource.clone(),
            size: self.size,
            limit: self.limit,
            sync_interval: self.sync_interval,
            sync_mode: self.sync_mode,
        }
    }

    pub fn check(&self) -> LimiterResult<()> {
        if self.scale == 0 {
            return Err(LimiterError::ValidationError(
                "Scale must be greater than 0".to_string(),
            ));
        }
        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(LimiterError::ValidationError(
                    "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
                ));
            }
        }
        self.limiter_config().check()
    }
}
