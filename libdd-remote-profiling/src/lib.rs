// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Remote profiling of a live process.
//!
//! A [service::ProfileService] takes snapshots of lookup profiles and runs
//! duration-bound collections through a [backend::ProfilingBackend], keeps
//! merged profiles in a [store::ProfileStore], and streams raw profile bytes
//! in chunks. [server::ProfileServer] exposes it over the network and
//! [client::ProfileClient] drives it synchronously from the other end.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod pprof;
pub mod profile_type;
pub mod server;
pub mod service;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod variables;

pub use error::{ErrorCode, ProfilingError, Result};
pub use profile_type::{DurationProfile, LookupProfile, ProfileType};
