// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The seam between the engine and whatever actually produces profile bytes
//! inside the host process.

use crate::profile_type::{DurationProfile, LookupProfile};
use crate::variables::ProfileVariable;
use std::io::Write;

/// Destination of a duration-bound collection. The backend owns it from
/// `start_collection` until the matching `stop_collection` returns, and must
/// drop it by then so buffered bytes reach the caller.
pub type ProfileSink = Box<dyn Write + Send>;

/// In-process profiling primitives of the host runtime.
///
/// Every method may block; the engine always calls them from the tokio
/// blocking pool. A duration-bound collection is a singleton per
/// [DurationProfile]: `start_collection` must fail while the same profile is
/// already being collected.
pub trait ProfilingBackend: Send + Sync + 'static {
    /// Begins collecting `profile` into `sink`.
    fn start_collection(&self, profile: DurationProfile, sink: ProfileSink) -> anyhow::Result<()>;

    /// Ends the collection of `profile`, writing any outstanding data and
    /// releasing the sink handed to `start_collection`.
    fn stop_collection(&self, profile: DurationProfile) -> anyhow::Result<()>;

    /// Writes an instantaneous snapshot of `profile` to `out`.
    ///
    /// Returns `Ok(false)` without writing anything when the runtime has no
    /// data for this profile, e.g. because its sampling is disabled.
    fn snapshot(&self, profile: LookupProfile, out: &mut dyn Write) -> anyhow::Result<bool>;

    fn variable(&self, variable: ProfileVariable) -> i64;

    fn set_variable(&self, variable: ProfileVariable, value: i64);
}
