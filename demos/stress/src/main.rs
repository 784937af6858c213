//! Multi-threaded stress driver for a MySQL connection pool.
//!
//! Runs a number of rounds, each spawning a batch of concurrent tasks that borrow a pooled
//! connection and run a trivial query, then reports pool state.

mod logging;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use dbpool::{ConfigBuilder, Pool, PoolConfig};
use dbpool_mysql::{MysqlConnectionFactory, MysqlError};
use mysql::prelude::Queryable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::logging::LoggingConfig;

/// Prefix for configuration environment variables.
const ENV_PREFIX: &str = "DBPOOL_STRESS";

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        value_parser = validate_config_path,
        env = "DBPOOL_STRESS_CONFIG_FILE"
    )]
    config_file: Option<String>,
    /// Number of rounds to run, overrides configuration.
    #[arg(short, long)]
    rounds: Option<usize>,
    /// Number of concurrent tasks per round, overrides configuration.
    #[arg(short, long)]
    tasks: Option<usize>,
}

/// Sanitize provided configuration file path.
fn validate_config_path(v: &str) -> Result<String, String> {
    let path = v.to_string();
    let meta = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => return Err(format!("Unable to check file: {e}")),
    };
    if !meta.is_file() {
        return Err("Configuration is not a file".into());
    }
    Ok(path)
}

/// Workload parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct RunConfig {
    /// Number of rounds to run.
    #[serde(default = "RunConfig::default_rounds")]
    rounds: usize,
    /// Number of concurrent tasks per round.
    #[serde(default = "RunConfig::default_tasks")]
    tasks: usize,
    /// Pause between rounds.
    #[serde(default = "RunConfig::default_pause", with = "humantime_serde")]
    pause: Duration,
    /// Query each task runs.
    #[serde(default = "RunConfig::default_query")]
    query: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            rounds: Self::default_rounds(),
            tasks: Self::default_tasks(),
            pause: Self::default_pause(),
            query: Self::default_query(),
        }
    }
}

impl RunConfig {
    /// Default value for [`Self::rounds`].
    #[must_use]
    #[inline]
    fn default_rounds() -> usize {
        3
    }

    /// Default value for [`Self::tasks`].
    #[must_use]
    #[inline]
    fn default_tasks() -> usize {
        20
    }

    /// Default value for [`Self::pause`].
    #[must_use]
    #[inline]
    fn default_pause() -> Duration {
        Duration::from_secs(10)
    }

    /// Default value for [`Self::query`].
    #[must_use]
    #[inline]
    fn default_query() -> String {
        String::from("SELECT 1")
    }
}

/// Stress driver configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
struct StressConfig {
    /// Connection pool configuration.
    #[serde(default)]
    pool: PoolConfig,
    /// Logging configuration.
    #[serde(default)]
    logging: LoggingConfig,
    /// Workload parameters.
    #[serde(default)]
    run: RunConfig,
}

/// Task error type.
#[derive(Debug, thiserror::Error)]
enum TaskError {
    #[error(transparent)]
    Pool(#[from] dbpool::Error<MysqlError>),
    #[error("query failed: {0}")]
    Query(#[from] mysql::Error),
}

/// Application entry point.
fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    // Merge, load and deserialize configuration.
    let mut builder = ConfigBuilder::<StressConfig>::new();
    if let Some(path) = &args.config_file {
        builder = builder.with_file(path);
    }
    let mut config = builder.with_env(ENV_PREFIX).build()?;
    if let Some(rounds) = args.rounds {
        config.run.rounds = rounds;
    }
    if let Some(tasks) = args.tasks {
        config.run.tasks = tasks;
    }
    // Logging works until this guard is dropped.
    let _guard = config.logging.init()?;
    debug!(?args, ?config, "configuration loaded");

    let factory = MysqlConnectionFactory::new(&config.pool.connection)?;
    let pool = Pool::new(config.pool.clone(), factory)?;
    let mut failed = 0;
    for round in 1..=config.run.rounds {
        let span = info_span!("round", round).entered();
        let started = Instant::now();
        let round_failed = run_round(&pool, &config.run);
        let state = pool.state();
        info!(
            elapsed = ?started.elapsed(),
            failed = round_failed,
            size = state.size,
            idle = state.idle,
            in_use = state.in_use,
            stale_replaced = state.stale_replaced,
            "round finished"
        );
        failed += round_failed;
        drop(span);
        if round < config.run.rounds {
            thread::sleep(config.run.pause);
        }
    }
    let summary = pool.shutdown();
    info!(
        closed = summary.closed,
        failed = summary.failed,
        "pool shut down"
    );
    anyhow::ensure!(failed == 0, "{failed} tasks failed");
    Ok(())
}

/// Run a single batch of concurrent tasks.
///
/// Returns number of failed tasks.
fn run_round(pool: &Pool<MysqlConnectionFactory>, run: &RunConfig) -> usize {
    let failed = AtomicUsize::new(0);
    thread::scope(|s| {
        for task in 0..run.tasks {
            let failed = &failed;
            let spawned = thread::Builder::new()
                .name(format!("task-{task}"))
                .spawn_scoped(s, move || {
                    if let Err(err) = run_task(pool, &run.query) {
                        warn!(task, error = %err, "task failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            if let Err(err) = spawned {
                warn!(task, error = %err, "unable to spawn task");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    });
    failed.into_inner()
}

/// Borrow a connection and run the query once.
fn run_task(pool: &Pool<MysqlConnectionFactory>, query: &str) -> Result<(), TaskError> {
    pool.with_connection(|conn| {
        conn.query_drop(query)?;
        debug!(connection_id = conn.connection_id(), "query done");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use serde_json::{from_value, json};

    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();
    }

    #[test]
    fn args_override_workload() {
        let args = Args::try_parse_from(["dbpool-stress", "--rounds", "1", "-t", "50"]).unwrap();
        assert_eq!(args.rounds, Some(1));
        assert_eq!(args.tasks, Some(50));
    }

    #[test]
    fn config_defaults() {
        let cfg: StressConfig = from_value(json!({})).unwrap();
        assert_eq!(cfg, StressConfig::default());
        assert_eq!(cfg.run.tasks, 20);
        assert_eq!(cfg.run.query, "SELECT 1");
        assert_eq!(cfg.pool.max_connections, 10);
    }

    #[test]
    fn config_sections() {
        let cfg: StressConfig = from_value(json!({
            "pool": {
                "name": "stress",
                "max_connections": 5,
                "max_idle_timeout": "20s",
                "connection": {"database": "myproject"},
            },
            "logging": {"format": "compact", "level": "DEBUG"},
            "run": {"rounds": 1, "pause": "250ms"},
        }))
        .unwrap();
        assert_eq!(cfg.pool.label(), "stress");
        assert_eq!(cfg.pool.max_connections, 5);
        assert_eq!(cfg.pool.max_idle_timeout, Some(Duration::from_secs(20)));
        assert_eq!(cfg.pool.connection.database, "myproject");
        assert_eq!(cfg.run.rounds, 1);
        assert_eq!(cfg.run.pause, Duration::from_millis(250));
        assert_eq!(cfg.run.tasks, 20);
    }
}
