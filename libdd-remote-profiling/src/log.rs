// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::{LogConfig, LogMethod};
use std::io;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

fn create_logfile(path: &Path) -> anyhow::Result<std::fs::File> {
    let log_file = std::fs::File::options()
        .create(true)
        .truncate(false)
        .append(true)
        .open(path)?;
    Ok(log_file)
}

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = if level.is_empty() {
        DEFAULT_LOG_LEVEL
    } else {
        level
    };
    Ok(EnvFilter::try_new(level)?)
}

/// Installs the global `tracing` subscriber described by `config`.
///
/// Fails if the level is not a valid filter, the log file cannot be opened,
/// or a global subscriber is already installed.
pub fn enable_logging(config: &LogConfig) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter(&config.level)?);

    match &config.method {
        LogMethod::Stdout => subscriber.with_writer(io::stdout).try_init(),
        LogMethod::Stderr => subscriber.with_writer(io::stderr).try_init(),
        LogMethod::File(path) => {
            let log_file = create_logfile(path)?;
            subscriber
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(log_file))
                .try_init()
        }
        LogMethod::Disabled => return Ok(()),
    }
    .map_err(|e| anyhow::anyhow!(e))
}
