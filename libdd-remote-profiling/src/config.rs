// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::transport::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LENGTH};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

const ENV_LISTEN_ADDR: &str = "DD_REMOTE_PROFILING_LISTEN_ADDR";
const ENV_CHUNK_SIZE: &str = "DD_REMOTE_PROFILING_CHUNK_SIZE";
const ENV_MAX_FRAME_LENGTH: &str = "DD_REMOTE_PROFILING_MAX_FRAME_LENGTH";
const ENV_CONNECT_TIMEOUT_MS: &str = "DD_REMOTE_PROFILING_CONNECT_TIMEOUT_MS";
const ENV_IO_TIMEOUT_MS: &str = "DD_REMOTE_PROFILING_IO_TIMEOUT_MS";

const ENV_LOG_LEVEL: &str = "DD_REMOTE_PROFILING_LOG_LEVEL";
const ENV_LOG_METHOD: &str = "DD_REMOTE_PROFILING_LOG_METHOD";
const LOG_METHOD_DISABLED: &str = "disabled";
const LOG_METHOD_STDOUT: &str = "stdout";
const LOG_METHOD_STDERR: &str = "stderr";

pub const DEFAULT_PORT: u16 = 6060;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Room left in a frame for the envelope around a chunk.
const FRAME_OVERHEAD: usize = 64;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LogMethod {
    Stdout,
    Stderr,
    File(PathBuf),
    Disabled,
}

impl Default for LogMethod {
    fn default() -> Self {
        Self::Disabled
    }
}

impl std::fmt::Display for LogMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogMethod::Disabled => write!(f, "{LOG_METHOD_DISABLED}"),
            LogMethod::Stdout => write!(f, "{LOG_METHOD_STDOUT}"),
            LogMethod::Stderr => write!(f, "{LOG_METHOD_STDERR}"),
            LogMethod::File(path) => write!(f, "file://{}", path.to_string_lossy()),
        }
    }
}

impl LogMethod {
    fn parse(method: &str) -> Self {
        match method {
            LOG_METHOD_DISABLED => LogMethod::Disabled,
            LOG_METHOD_STDOUT => LogMethod::Stdout,
            LOG_METHOD_STDERR => LogMethod::Stderr,
            method if method.starts_with("file://") => {
                // a plain path prefixed with file://, not an encoded uri
                LogMethod::File(PathBuf::from(&method[7..]))
            }
            _ => LogMethod::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LogConfig {
    pub method: LogMethod,
    /// An `EnvFilter` directive; empty means `info`.
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub chunk_size: usize,
    pub max_frame_length: usize,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn get() -> Self {
        FromEnv::server_config()
    }

    /// The chunk size actually used: at least one byte, and small enough for
    /// a chunk to fit in a frame.
    pub fn effective_chunk_size(&self) -> usize {
        let limit = self.max_frame_length.saturating_sub(FRAME_OVERHEAD).max(1);
        self.chunk_size.clamp(1, limit)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Read and write timeout of the connection. Collections that wait for
    /// completion extend the read timeout by their duration.
    pub io_timeout: Option<Duration>,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn get() -> Self {
        FromEnv::client_config()
    }
}

pub struct FromEnv {}

impl FromEnv {
    fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok()?.trim().parse().ok()
    }

    fn millis(name: &str) -> Option<Duration> {
        Self::parsed(name).map(Duration::from_millis)
    }

    pub fn listen_addr() -> SocketAddr {
        Self::parsed(ENV_LISTEN_ADDR).unwrap_or(ServerConfig::default().listen_addr)
    }

    pub fn chunk_size() -> usize {
        Self::parsed(ENV_CHUNK_SIZE)
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn max_frame_length() -> usize {
        Self::parsed(ENV_MAX_FRAME_LENGTH)
            .filter(|length| *length > FRAME_OVERHEAD)
            .unwrap_or(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn log_method() -> LogMethod {
        LogMethod::parse(&std::env::var(ENV_LOG_METHOD).unwrap_or_default())
    }

    pub fn log_level() -> String {
        std::env::var(ENV_LOG_LEVEL).unwrap_or_default()
    }

    pub fn log_config() -> LogConfig {
        LogConfig {
            method: Self::log_method(),
            level: Self::log_level(),
        }
    }

    pub fn server_config() -> ServerConfig {
        ServerConfig {
            listen_addr: Self::listen_addr(),
            chunk_size: Self::chunk_size(),
            max_frame_length: Self::max_frame_length(),
            log: Self::log_config(),
        }
    }

    pub fn client_config() -> ClientConfig {
        let io_timeout = match Self::parsed::<u64>(ENV_IO_TIMEOUT_MS) {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(DEFAULT_IO_TIMEOUT),
        };
        ClientConfig {
            connect_timeout: Self::millis(ENV_CONNECT_TIMEOUT_MS)
                .filter(|timeout| !timeout.is_zero())
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            io_timeout,
            max_frame_length: Self::max_frame_length(),
        }
    }
}
