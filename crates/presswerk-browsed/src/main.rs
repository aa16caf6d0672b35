// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// presswerk-browsed — DNS-SD printer discovery and local queue reconciliation
// daemon. CLI parsing, config load, logging init, signal handling, then
// hands off to `app::DaemonApp::run`.

mod app;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use presswerk_core::{DaemonConfig, ShutdownMode};
use tracing::{error, info};

use app::DaemonApp;

#[derive(Parser, Debug)]
#[command(name = "presswerk-browsed", about = "DNS-SD printer discovery and queue reconciliation daemon")]
struct Cli {
    /// Path to the configuration file. Created with defaults on first run.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also log to a rotating file, in addition to stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the auto-shutdown trigger mode for this run.
    #[arg(long, value_enum)]
    shutdown_mode: Option<ShutdownModeArg>,

    /// Override the auto-shutdown timeout, in seconds.
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Inject an ad-hoc `key=value` config override (repeatable).
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ShutdownModeArg {
    NoQueues,
    NoJobs,
    Disabled,
}

impl From<ShutdownModeArg> for ShutdownMode {
    fn from(arg: ShutdownModeArg) -> Self {
        match arg {
            ShutdownModeArg::NoQueues => ShutdownMode::NoQueues,
            ShutdownModeArg::NoJobs => ShutdownMode::NoJobs,
            ShutdownModeArg::Disabled => ShutdownMode::Disabled,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file.as_deref());

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = match DaemonConfig::load(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "loaded configuration");
            config
        }
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Some(mode) = cli.shutdown_mode {
        config.shutdown.mode = mode.into();
    }
    if let Some(secs) = cli.shutdown_timeout {
        config.shutdown.timeout_secs = secs;
    }
    if let Err(e) = apply_set_overrides(&mut config, &cli.overrides) {
        error!(error = %e, "invalid --set override");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(config));
    std::process::exit(exit_code);
}

async fn run(config: DaemonConfig) -> i32 {
    let app = match DaemonApp::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "fatal initialization error");
            return 1;
        }
    };

    info!("presswerk-browsed is running, press Ctrl+C to stop");
    app.run().await;
    info!("presswerk-browsed stopped");
    0
}

fn default_config_path() -> PathBuf {
    dirs_config_dir().join("presswerk-browsed").join("config.toml")
}

/// Minimal `$XDG_CONFIG_HOME`-or-`~/.config` resolution; a full directories
/// crate is unnecessary for a single config file.
fn dirs_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg);
        }
    }
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".config"))
        .unwrap_or_else(|_| PathBuf::from("/etc"))
}

/// Apply `--set key=value` overrides against the handful of scalar fields
/// worth reaching from the CLI without a full dotted-path config editor.
fn apply_set_overrides(config: &mut DaemonConfig, overrides: &[String]) -> Result<(), String> {
    for raw in overrides {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
        match key {
            "http_max_retries" => {
                config.http_max_retries = value.parse().map_err(|_| format!("invalid u32: {value}"))?;
            }
            "default_options" => config.default_options = value.to_string(),
            "keep_generated_queues_on_shutdown" => {
                config.keep_generated_queues_on_shutdown = value.parse().map_err(|_| format!("invalid bool: {value}"))?;
            }
            "allow_resharing_remote_cups_printers" => {
                config.allow_resharing_remote_cups_printers =
                    value.parse().map_err(|_| format!("invalid bool: {value}"))?;
            }
            other => return Err(format!("unknown --set key '{other}'")),
        }
    }
    Ok(())
}

/// Layered stderr + optional rotating-file subscriber. The returned guard
/// must be held for the process lifetime to keep the non-blocking file
/// writer flushing.
fn init_logging(log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_env("PRESSWERK_BROWSED_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("presswerk-browsed.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(non_blocking).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(env_filter).with(stderr_layer).with(file_layer).init();
    guard
}
