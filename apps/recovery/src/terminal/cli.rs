use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::network::config::{DEFAULT_BIND_ADDRESS, DEFAULT_ENGINE_LOG_LEVEL, DEFAULT_INTERFACE};
use crate::network::engine::DEFAULT_ENGINE_BINARY;
use crate::session::SessionSettings;
use crate::session::lock::DEFAULT_LOCK_PATH;
use crate::telemetry::logging::{LogConfig, LogLevel};
use crate::terminal::error::CliError;

#[derive(Parser, Debug)]
#[command(
    name = "recovery",
    about = "🛟 Start a peer-to-peer recovery network and a password-protected shell",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long = "bind",
        env = "RECOVERY_BIND",
        default_value = DEFAULT_BIND_ADDRESS,
        value_name = "CIDR",
        help = "Address this machine takes inside the recovery network"
    )]
    pub bind_address: String,

    #[arg(
        long = "shell-port",
        env = "RECOVERY_SHELL_PORT",
        default_value_t = crate::server::shell::DEFAULT_SHELL_PORT,
        help = "TCP port for the recovery shell"
    )]
    pub shell_port: u16,

    #[arg(
        long = "interface",
        env = "RECOVERY_INTERFACE",
        default_value = DEFAULT_INTERFACE,
        help = "Name of the virtual interface created by the network engine"
    )]
    pub interface: String,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[arg(
        long = "shell",
        env = "RECOVERY_SHELL",
        value_name = "PROGRAM",
        help = "Program started for each shell session (defaults to $SHELL, then /bin/bash or /bin/sh)"
    )]
    pub shell: Option<String>,

    #[arg(
        long = "password-length",
        env = "RECOVERY_PASSWORD_LENGTH",
        default_value_t = crate::credentials::DEFAULT_PASSWORD_LENGTH,
        help = "Length of the generated shell password"
    )]
    pub password_length: usize,

    #[command(flatten)]
    pub timing: TimingArgs,

    #[arg(
        long = "console-tty",
        env = "RECOVERY_CONSOLE_TTY",
        default_value_t = crate::session::DEFAULT_CONSOLE_TTY,
        help = "Virtual terminal handed back to the login service when recovery ends"
    )]
    pub console_tty: u8,

    #[arg(
        long = "lock-file",
        env = "RECOVERY_LOCK_FILE",
        default_value = DEFAULT_LOCK_PATH,
        value_name = "PATH",
        help = "Lock file preventing two recovery sessions on one host"
    )]
    pub lock_file: PathBuf,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    #[arg(
        long = "engine-binary",
        env = "RECOVERY_ENGINE_BINARY",
        default_value = DEFAULT_ENGINE_BINARY,
        value_name = "PATH",
        help = "Network engine executable"
    )]
    pub binary: PathBuf,

    #[arg(
        long = "engine-arg",
        env = "RECOVERY_ENGINE_ARGS",
        value_name = "ARG",
        value_delimiter = ' ',
        allow_hyphen_values = true,
        help = "Argument passed to the engine ahead of the network flags (repeatable)"
    )]
    pub leading_args: Vec<String>,

    #[arg(
        long = "engine-log-level",
        env = "RECOVERY_ENGINE_LOG_LEVEL",
        default_value = DEFAULT_ENGINE_LOG_LEVEL,
        help = "Log level passed to the network engine"
    )]
    pub log_level: String,
}

#[derive(Args, Debug, Clone)]
pub struct TimingArgs {
    #[arg(
        long = "startup-grace",
        env = "RECOVERY_STARTUP_GRACE",
        default_value_t = 5,
        value_name = "SECONDS",
        help = "Delay before the first interface check"
    )]
    pub startup_grace_secs: u64,

    #[arg(
        long = "poll-interval",
        env = "RECOVERY_POLL_INTERVAL",
        default_value_t = 5,
        value_name = "SECONDS",
        help = "Delay between interface checks"
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long = "shutdown-timeout",
        env = "RECOVERY_SHUTDOWN_TIMEOUT",
        default_value_t = 5,
        value_name = "SECONDS",
        help = "How long teardown waits for the network and shell tasks"
    )]
    pub shutdown_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "RECOVERY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "RECOVERY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    /// Session settings derived from the arguments. Rejects values that
    /// would make the session unusable before anything is started.
    pub fn settings(&self) -> Result<SessionSettings, CliError> {
        if self.password_length == 0 {
            return Err(CliError::InvalidArgument(
                "--password-length must be at least 1".into(),
            ));
        }
        if self.timing.poll_interval_secs == 0 {
            return Err(CliError::InvalidArgument(
                "--poll-interval must be at least 1 second".into(),
            ));
        }
        if self.console_tty == 0 {
            return Err(CliError::InvalidArgument(
                "--console-tty must name a virtual terminal (1 or higher)".into(),
            ));
        }
        Ok(SessionSettings {
            bind_address: self.bind_address.clone(),
            shell_port: self.shell_port,
            interface: self.interface.clone(),
            engine_log_level: self.engine.log_level.clone(),
            password_length: self.password_length,
            startup_grace: Duration::from_secs(self.timing.startup_grace_secs),
            poll_interval: Duration::from_secs(self.timing.poll_interval_secs),
            shutdown_timeout: Duration::from_secs(self.timing.shutdown_timeout_secs),
            console_tty: self.console_tty,
            lock_path: self.lock_file.clone(),
        })
    }
}
