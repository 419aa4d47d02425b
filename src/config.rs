use crate::load::session::{SessionOptimizer, SessionSetting};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CHECKPOINT_PATH: &str = "./insert_checkpoint.json";
const MAX_DEFAULT_CONCURRENCY: usize = 8;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Option<Duration> {
    let secs = env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default_secs);
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Run-wide settings for a [`crate::BulkLoader`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Rows per batch for tables without their own batch size.
    pub batch_size: usize,
    /// Number of workers (and pooled connections). 1 selects the sequential executor.
    pub concurrency: usize,
    /// Persist progress after each table and resume from it on the next run.
    pub resumable: bool,
    pub checkpoint_path: PathBuf,
    /// Apply bulk-load session settings around the run.
    pub optimize_session: bool,
    pub lock_timeout: Option<Duration>,
    /// Replaces the default bulk settings when set.
    pub session_settings: Option<Vec<SessionSetting>>,
}

impl LoaderConfig {
    /// Built-in defaults, ignoring the environment.
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: 1,
            resumable: false,
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            optimize_session: true,
            lock_timeout: Some(Duration::from_secs(3600)),
            session_settings: None,
        }
    }

    pub fn from_env() -> Self {
        let default_concurrency = num_cpus::get().clamp(1, MAX_DEFAULT_CONCURRENCY);

        Self {
            batch_size: env_usize("BULK_LOAD_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            concurrency: env_usize("BULK_LOAD_CONCURRENCY", default_concurrency),
            resumable: env_bool("BULK_LOAD_RESUMABLE", false),
            checkpoint_path: PathBuf::from(env_string(
                "BULK_LOAD_CHECKPOINT_PATH",
                DEFAULT_CHECKPOINT_PATH,
            )),
            optimize_session: env_bool("BULK_LOAD_OPTIMIZE_SESSION", true),
            lock_timeout: env_duration_secs("BULK_LOAD_LOCK_TIMEOUT_SECS", 3600),
            session_settings: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn resumable(mut self, checkpoint_path: impl Into<PathBuf>) -> Self {
        self.resumable = true;
        self.checkpoint_path = checkpoint_path.into();
        self
    }

    pub fn with_session_optimization(mut self, enabled: bool) -> Self {
        self.optimize_session = enabled;
        self
    }

    pub fn with_session_settings(mut self, settings: Vec<SessionSetting>) -> Self {
        self.session_settings = Some(settings);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn session_optimizer(&self) -> SessionOptimizer {
        if !self.optimize_session {
            return SessionOptimizer::disabled();
        }
        match &self.session_settings {
            Some(settings) => SessionOptimizer::new(settings.clone()),
            None => SessionOptimizer::bulk_defaults(self.lock_timeout),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_clamps_zero_values() {
        let config = LoaderConfig::new().with_batch_size(0).with_concurrency(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_disabled_session_optimizer_has_no_settings() {
        let config = LoaderConfig::new().with_session_optimization(false);
        assert!(config.session_optimizer().settings().is_empty());
    }

    #[test]
    fn test_custom_session_settings_replace_defaults() {
        let config = LoaderConfig::new()
            .with_session_settings(vec![SessionSetting::new("work_mem", "256MB")]);

        let optimizer = config.session_optimizer();
        assert_eq!(optimizer.settings().len(), 1);
        assert_eq!(optimizer.settings()[0].name, "work_mem");
    }
}
