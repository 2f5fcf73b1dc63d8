// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::profile_type::{DurationProfile, ProfileType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Stable status codes carried on the wire, so a client can tell failure
/// kinds apart without parsing messages.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    UnknownProfileType,
    UnknownVariable,
    NotInitialized,
    AlreadyInitialized,
    NotFound,
    IncompatibleProfile,
    InvalidProfile,
    CollectionStartFailed,
    TransportFailure,
    InvalidRequest,
    ConnectionRejected,
    Backend,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::UnknownProfileType => "unknown profile type",
            ErrorCode::UnknownVariable => "unknown variable",
            ErrorCode::NotInitialized => "not initialized",
            ErrorCode::AlreadyInitialized => "already initialized",
            ErrorCode::NotFound => "not found",
            ErrorCode::IncompatibleProfile => "incompatible profile",
            ErrorCode::InvalidProfile => "invalid profile",
            ErrorCode::CollectionStartFailed => "collection start failed",
            ErrorCode::TransportFailure => "transport failure",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::ConnectionRejected => "connection rejected",
            ErrorCode::Backend => "backend failure",
            ErrorCode::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// An error as it travels from the service to the client.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

/// Errors raised while collecting, caching or transporting profiles.
///
/// [`ProfilingError::IncompatibleProfile`] never reaches a caller of the
/// service; the profile store recovers from it by resetting the cache.
#[derive(Debug, thiserror::Error)]
pub enum ProfilingError {
    #[error("unknown profile type: {0}")]
    UnknownProfileType(String),
    #[error("unknown profiling variable: {0}")]
    UnknownVariable(String),
    #[error("profiling variables are not initialized yet")]
    NotInitialized,
    #[error("profiling variables are already initialized")]
    AlreadyInitialized,
    #[error("no profile data saved for {0}")]
    NotFound(ProfileType),
    #[error("incompatible profiles: {0}")]
    IncompatibleProfile(String),
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error("failed to start {profile} collection: {reason}")]
    CollectionStartFailed {
        profile: DurationProfile,
        reason: String,
    },
    #[error("transport failure: {0}")]
    TransportFailure(#[from] io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),
    #[error("profiling backend failure: {0}")]
    Backend(String),
    #[error("internal error: {0}")]
    Internal(String),
    /// A failure reported by the remote service.
    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },
}

impl ProfilingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProfilingError::UnknownProfileType(_) => ErrorCode::UnknownProfileType,
            ProfilingError::UnknownVariable(_) => ErrorCode::UnknownVariable,
            ProfilingError::NotInitialized => ErrorCode::NotInitialized,
            ProfilingError::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            ProfilingError::NotFound(_) => ErrorCode::NotFound,
            ProfilingError::IncompatibleProfile(_) => ErrorCode::IncompatibleProfile,
            ProfilingError::InvalidProfile(_) => ErrorCode::InvalidProfile,
            ProfilingError::CollectionStartFailed { .. } => ErrorCode::CollectionStartFailed,
            ProfilingError::TransportFailure(_) => ErrorCode::TransportFailure,
            ProfilingError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ProfilingError::ConnectionRejected(_) => ErrorCode::ConnectionRejected,
            ProfilingError::Backend(_) => ErrorCode::Backend,
            ProfilingError::Internal(_) => ErrorCode::Internal,
            ProfilingError::Remote { code, .. } => *code,
        }
    }

    pub fn backend(error: anyhow::Error) -> Self {
        Self::Backend(format!("{error:#}"))
    }

    pub fn invalid_profile(error: impl fmt::Display) -> Self {
        Self::InvalidProfile(error.to_string())
    }

    /// Converts the error into its wire form. A remote error keeps its
    /// original message instead of being wrapped again.
    pub fn to_remote(&self) -> RemoteError {
        let message = match self {
            ProfilingError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RemoteError {
            code: self.code(),
            message,
        }
    }
}

impl From<RemoteError> for ProfilingError {
    fn from(error: RemoteError) -> Self {
        ProfilingError::Remote {
            code: error.code,
            message: error.message,
        }
    }
}

impl From<tokio::task::JoinError> for ProfilingError {
    #[cold]
    fn from(error: tokio::task::JoinError) -> Self {
        ProfilingError::Internal(format!("background task failed: {error}"))
    }
}

pub type Result<T, E = ProfilingError> = std::result::Result<T, E>;
