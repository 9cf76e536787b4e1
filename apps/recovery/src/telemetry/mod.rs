//! Structured logging for the recovery binary.
//!
//! The operator console shows the banner, the pairing code and the shell
//! password, so log lines must not land on it. When stderr is that console
//! and no `--log-file` was given, logs go to [`logging::CONSOLE_LOG_PATH`].

pub mod logging {
    use clap::ValueEnum;
    use std::fs::{File, OpenOptions};
    use std::io::IsTerminal;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Used when stderr is the operator console and no file was requested.
    pub const CONSOLE_LOG_PATH: &str = "/run/recovery.log";

    const FILTER_ENV: &str = "RECOVERY_LOG_FILTER";
    const TRACE_DEPS_ENV: &str = "RECOVERY_TRACE_DEPS";

    /// SSH and runtime internals that flood the log below `info`.
    const NOISY_TARGETS: &[&str] = &["russh", "russh_keys", "mio", "tokio_util"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
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

    /// Where log lines are written.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum LogSink {
        /// An explicitly requested file; failing to open it is an error.
        File(PathBuf),
        /// The console log file, falling back to stderr if it cannot be opened.
        ConsoleFile(PathBuf),
        Stderr,
    }

    impl LogSink {
        pub fn resolve(config: &LogConfig, stderr_is_console: bool) -> Self {
            match &config.file {
                Some(path) => LogSink::File(path.clone()),
                None if stderr_is_console => LogSink::ConsoleFile(PathBuf::from(CONSOLE_LOG_PATH)),
                None => LogSink::Stderr,
            }
        }
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let stderr_is_console = std::io::stderr().is_terminal();
        let sink = LogSink::resolve(config, stderr_is_console);
        let (writer, guard, ansi) = match &sink {
            LogSink::File(path) => {
                let file = open_log(path).map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
                let (writer, guard) = tracing_appender::non_blocking(file);
                (writer, guard, false)
            }
            LogSink::ConsoleFile(path) => match open_log(path) {
                Ok(file) => {
                    let (writer, guard) = tracing_appender::non_blocking(file);
                    (writer, guard, false)
                }
                Err(_) => {
                    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
                    (writer, guard, stderr_is_console)
                }
            },
            LogSink::Stderr => {
                let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
                (writer, guard, false)
            }
        };

        let filter = std::env::var(FILTER_ENV)
            .unwrap_or_else(|_| default_directives(config.level.to_filter(), trace_deps()));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(ansi)
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        tracing::debug!(?sink, "log sink selected");
        Ok(())
    }

    fn open_log(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn trace_deps() -> bool {
        std::env::var(TRACE_DEPS_ENV)
            .map(|value| value != "0" && !value.is_empty())
            .unwrap_or(false)
    }

    /// `EnvFilter` directives for `level`. Our own crates get `level`;
    /// noisy dependencies stay at `info` unless `trace_deps` is set.
    pub(crate) fn default_directives(level: LevelFilter, trace_deps: bool) -> String {
        let level_name = level.to_string().to_lowercase();
        if level <= LevelFilter::INFO {
            return level_name;
        }
        let mut directives = format!("info,recovery={level_name},recovery_core={level_name}");
        if !trace_deps {
            for target in NOISY_TARGETS {
                directives.push_str(&format!(",{target}=info"));
            }
        }
        directives
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn explicit_file_wins() {
            let config = LogConfig {
                level: LogLevel::Info,
                file: Some(PathBuf::from("/tmp/r.log")),
            };
            assert_eq!(
                LogSink::resolve(&config, true),
                LogSink::File(PathBuf::from("/tmp/r.log"))
            );
        }

        #[test]
        fn console_stderr_is_kept_clear() {
            let config = LogConfig::default();
            assert_eq!(
                LogSink::resolve(&config, true),
                LogSink::ConsoleFile(PathBuf::from(CONSOLE_LOG_PATH))
            );
            assert_eq!(LogSink::resolve(&config, false), LogSink::Stderr);
        }

        #[test]
        fn quiet_levels_are_plain() {
            assert_eq!(default_directives(LevelFilter::WARN, false), "warn");
            assert_eq!(default_directives(LevelFilter::ERROR, true), "error");
        }

        #[test]
        fn verbose_levels_hold_back_dependencies() {
            let directives = default_directives(LevelFilter::DEBUG, false);
            assert!(directives.starts_with("info,recovery=debug,recovery_core=debug"));
            assert!(directives.contains(",russh=info"));
            let directives = default_directives(LevelFilter::TRACE, true);
            assert_eq!(directives, "info,recovery=trace,recovery_core=trace");
        }
    }
}
