// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backend::{ProfileSink, ProfilingBackend};
use crate::error::{ProfilingError, Result};
use crate::pprof;
use crate::profile_type::{DurationProfile, LookupProfile, ProfileType};
use crate::session::{SessionRegistry, SessionState};
use crate::store::ProfileStore;
use crate::transport::PING_TOKEN;
use crate::variables::{ProfileVariable, VariableRegistry};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server-side facade: every operation a remote caller can request.
///
/// Streaming operations write their payload into a caller-provided sink and
/// flush it before returning; what a sink has received is never taken back
/// when an operation fails later on.
#[derive(Clone)]
pub struct ProfileService {
    backend: Arc<dyn ProfilingBackend>,
    store: Arc<ProfileStore>,
    variables: Arc<VariableRegistry>,
    sessions: Arc<SessionRegistry>,
}

/// Forwards writes to the caller while keeping a copy for the store.
struct TeeSink<W> {
    inner: W,
    copy: Arc<Mutex<Vec<u8>>>,
}

impl<W: Write> Write for TeeSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.copy.lock().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ProfileService {
    /// Creates a service whose variable defaults are captured right away.
    pub fn new(backend: Arc<dyn ProfilingBackend>) -> Self {
        let variables = Arc::new(VariableRegistry::capture(backend.as_ref()));
        Self::with_variables(backend, variables)
    }

    /// Creates a service around an existing, possibly uninitialized, registry.
    pub fn with_variables(
        backend: Arc<dyn ProfilingBackend>,
        variables: Arc<VariableRegistry>,
    ) -> Self {
        ProfileService {
            backend,
            store: Arc::new(ProfileStore::new()),
            variables,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn variables(&self) -> &VariableRegistry {
        &self.variables
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn initialize_variables(&self) -> Result<()> {
        self.variables.initialize(self.backend.as_ref())
    }

    pub fn ping(&self) -> &'static str {
        PING_TOKEN
    }

    pub fn clear_cache(&self) {
        self.store.clear();
        info!("profile cache cleared");
    }

    /// Returns the value the variable had before.
    pub fn set_variable(&self, variable: ProfileVariable, value: i64) -> Result<i64> {
        let previous = self.variables.set(self.backend.as_ref(), variable, value)?;
        info!(%variable, value, previous, "profiling variable set");
        Ok(previous)
    }

    /// Returns the restored default.
    pub fn reset_variable(&self, variable: ProfileVariable) -> Result<i64> {
        let value = self.variables.reset(self.backend.as_ref(), variable)?;
        info!(%variable, value, "profiling variable reset");
        Ok(value)
    }

    async fn keep(&self, profile: ProfileType, bytes: Vec<u8>) -> Result<()> {
        let store = self.store.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let parsed = pprof::parse(&bytes)?;
            store.put(profile, parsed)
        })
        .await??;
        debug!(%profile, ?outcome, "kept profile");
        Ok(())
    }

    /// Snapshots a lookup profile and streams the raw bytes into `sink`.
    ///
    /// The bytes are streamed whether or not `keep` is set; with `keep` they
    /// are then parsed and merged into the cache. A profile without data
    /// yields an empty stream.
    pub async fn snapshot_profile<W: Write>(
        &self,
        profile: ProfileType,
        keep: bool,
        mut sink: W,
    ) -> Result<()> {
        let lookup = LookupProfile::try_from(profile)?;
        let backend = self.backend.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            let mut bytes = Vec::new();
            backend.snapshot(lookup, &mut bytes).map(|available| (available, bytes))
        })
        .await?;
        let (available, bytes) = snapshot.map_err(ProfilingError::backend)?;
        if !available {
            debug!(%profile, "no snapshot data available");
            return Ok(());
        }

        sink.write_all(&bytes)?;
        sink.flush()?;
        if keep {
            self.keep(profile, bytes).await?;
        }
        Ok(())
    }

    /// Runs a duration-bound collection.
    ///
    /// With `wait_for_completion`, the collected bytes are streamed into
    /// `sink` as the backend produces them, and cancelling `cancel` ends the
    /// collection early. Otherwise the call returns as soon as the
    /// collection is running, `sink` receives nothing, and the collection
    /// keeps going until its duration elapses or it is stopped. In both
    /// cases `keep` merges the result into the cache once it is collected.
    pub async fn collect_profile<W: Write + Send + 'static>(
        &self,
        profile: ProfileType,
        duration: Duration,
        wait_for_completion: bool,
        keep: bool,
        sink: W,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let duration_profile = DurationProfile::try_from(profile)?;
        let copy = Arc::new(Mutex::new(Vec::new()));

        if !wait_for_completion {
            drop(sink);
            let session_sink: ProfileSink = if keep {
                Box::new(TeeSink {
                    inner: io::sink(),
                    copy: copy.clone(),
                })
            } else {
                Box::new(io::sink())
            };
            let session = self
                .sessions
                .start(
                    self.backend.clone(),
                    duration_profile,
                    duration,
                    session_sink,
                    &CancellationToken::new(),
                )
                .await?;

            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.wait().await {
                    warn!(%profile, "background collection failed: {e}");
                    return;
                }
                if keep {
                    let bytes = std::mem::take(&mut *copy.lock());
                    if let Err(e) = service.keep(profile, bytes).await {
                        warn!(%profile, "could not keep background collection: {e}");
                    }
                }
            });
            return Ok(());
        }

        let session_sink: ProfileSink = if keep {
            Box::new(TeeSink {
                inner: sink,
                copy: copy.clone(),
            })
        } else {
            Box::new(sink)
        };
        let session = self
            .sessions
            .start(
                self.backend.clone(),
                duration_profile,
                duration,
                session_sink,
                cancel,
            )
            .await?;
        session.wait().await?;

        if keep {
            let bytes = std::mem::take(&mut *copy.lock());
            self.keep(profile, bytes).await?;
        }
        Ok(())
    }

    /// Stops the running collection of `profile`, if any.
    pub async fn stop_collection(&self, profile: ProfileType) -> Result<()> {
        let duration_profile = DurationProfile::try_from(profile)?;
        self.sessions.stop(duration_profile).await;
        Ok(())
    }

    pub fn collection_status(&self, profile: ProfileType) -> Result<SessionState> {
        let duration_profile = DurationProfile::try_from(profile)?;
        Ok(self.sessions.status(duration_profile))
    }

    /// Streams the cached profile of `profile` into `sink`.
    pub async fn download_cached<W: Write>(&self, profile: ProfileType, mut sink: W) -> Result<()> {
        let cached = self.store.get(profile)?;
        let bytes = tokio::task::spawn_blocking(move || pprof::serialize(&cached)).await??;
        sink.write_all(&bytes)?;
        sink.flush()?;
        Ok(())
    }

    /// Streams the executable image of the running process into `sink`.
    pub async fn binary_dump<W: Write + Send + 'static>(&self, mut sink: W) -> Result<()> {
        let copied = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut file = std::env::current_exe()
                .and_then(std::fs::File::open)
                .map_err(|e| ProfilingError::Internal(format!("cannot open the executable: {e}")))?;
            let copied = io::copy(&mut file, &mut sink)?;
            sink.flush()?;
            Ok(copied)
        })
        .await??;
        debug!(bytes = copied, "binary dump sent");
        Ok(())
    }
}
