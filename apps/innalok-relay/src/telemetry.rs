use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Full `EnvFilter` directive string that replaces the level-derived one.
pub const FILTER_ENV: &str = "INNALOK_LOG_FILTER";

/// Crates whose verbosity follows `--log-level` past `info`.
const OWN_TARGETS: &[&str] = &["innalok", "innalok_relay", "omnisoft_proto", "query_bus"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn name(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Directives for this level. HTTP, TLS and websocket crates never go
    /// below `info`; only the relay's own targets get debug and trace output.
    fn directives(self) -> String {
        if self <= LogLevel::Info {
            return self.name().to_owned();
        }
        OWN_TARGETS.iter().fold(String::from("info"), |mut filter, target| {
            filter.push_str(&format!(",{target}={}", self.name()));
            filter
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Keeps the non-blocking writer flushing for the life of the process.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once one is installed, later calls return
/// `Ok` without touching it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(config.level.directives()),
    };
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_levels_only_raise_own_targets() {
        let trace = LogLevel::Trace.directives();
        assert!(trace.starts_with("info,"));
        assert!(trace.contains("innalok_relay=trace"));
        assert!(trace.contains("omnisoft_proto=trace"));
        assert!(!trace.contains("hyper"));

        assert_eq!(LogLevel::Debug.directives().matches("=debug").count(), OWN_TARGETS.len());
    }

    #[test]
    fn quiet_levels_apply_everywhere() {
        assert_eq!(LogLevel::Warn.directives(), "warn");
        assert_eq!(LogLevel::default().directives(), "info");
        assert!(LogLevel::Error < LogLevel::Warn);
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let config = LogConfig {
            level: LogLevel::Info,
            file: Some(PathBuf::from("/nonexistent/innalok/relay.log")),
        };
        match init(&config) {
            Err(InitError::Io { path, .. }) => assert_eq!(path, config.file.unwrap()),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
