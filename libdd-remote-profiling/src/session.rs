// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Duration-bound collections.
//!
//! A session reserves its [DurationProfile] in the [SessionRegistry], starts
//! the backend, then hands over to a single background task. That task waits
//! for the deadline or for cancellation, whichever comes first, and is the
//! only place the backend's stop is ever called from.

use crate::backend::{ProfileSink, ProfilingBackend};
use crate::error::{ProfilingError, Result};
use crate::profile_type::DurationProfile;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
    Collected,
}

struct ActiveSession {
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

/// Tracks the running session of every duration-bound profile. There is at
/// most one per profile.
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<DurationProfile, ActiveSession>>,
}

/// Removes the registry entry when the owning task ends, including when the
/// task panics or is dropped with its runtime. Once armed, it also stops the
/// backend unless the task already took over that duty.
struct Reservation {
    registry: Arc<SessionRegistry>,
    profile: DurationProfile,
    backend: Option<Arc<dyn ProfilingBackend>>,
}

impl Reservation {
    fn arm(&mut self, backend: Arc<dyn ProfilingBackend>) {
        self.backend = Some(backend);
    }

    fn disarm(&mut self) -> Option<Arc<dyn ProfilingBackend>> {
        self.backend.take()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            warn!(profile = %self.profile, "collection task ended abnormally, stopping the backend");
            if let Err(e) = backend.stop_collection(self.profile) {
                warn!(profile = %self.profile, "failed to stop collection: {e:#}");
            }
        }
        self.registry.active.lock().remove(&self.profile);
    }
}

/// Records the first write error of the backend and cancels the session.
struct SessionSink {
    inner: ProfileSink,
    failure: Arc<Mutex<Option<io::Error>>>,
    cancel: CancellationToken,
}

impl SessionSink {
    fn check<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &result {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(io::Error::new(e.kind(), e.to_string()));
                self.cancel.cancel();
            }
        }
        result
    }
}

impl Write for SessionSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.inner.write(buf);
        self.check(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.inner.flush();
        self.check(result)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting `profile` into `sink` for `duration`. A duration
    /// too large to be represented as a deadline collects until stopped.
    ///
    /// Cancelling `cancel`, or calling [SessionRegistry::stop], ends the
    /// collection early. Fails with [ProfilingError::CollectionStartFailed]
    /// if `profile` is already being collected or the backend refuses to
    /// start; no session exists afterwards in either case.
    pub async fn start(
        self: &Arc<Self>,
        backend: Arc<dyn ProfilingBackend>,
        profile: DurationProfile,
        duration: Duration,
        sink: ProfileSink,
        cancel: &CancellationToken,
    ) -> Result<CollectionSession> {
        let cancel = cancel.child_token();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        {
            let mut active = self.active.lock();
            if active.contains_key(&profile) {
                return Err(ProfilingError::CollectionStartFailed {
                    profile,
                    reason: "a collection is already active".into(),
                });
            }
            active.insert(
                profile,
                ActiveSession {
                    cancel: cancel.clone(),
                    state: state_rx.clone(),
                },
            );
        }
        let mut reservation = Reservation {
            registry: self.clone(),
            profile,
            backend: None,
        };

        let started_at = Instant::now();
        let deadline = started_at.checked_add(duration);
        let failure = Arc::new(Mutex::new(None));
        let sink = SessionSink {
            inner: sink,
            failure: failure.clone(),
            cancel: cancel.clone(),
        };
        let start_backend = backend.clone();
        let started =
            tokio::task::spawn_blocking(move || start_backend.start_collection(profile, Box::new(sink)))
                .await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ProfilingError::CollectionStartFailed {
                    profile,
                    reason: format!("{e:#}"),
                })
            }
            Err(e) => {
                return Err(ProfilingError::CollectionStartFailed {
                    profile,
                    reason: e.to_string(),
                })
            }
        }
        reservation.arm(backend);
        state_tx.send_replace(SessionState::Running);
        info!(%profile, ?duration, "collection started");

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let elapsed = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = elapsed => {
                    debug!(%profile, "collection duration elapsed");
                }
                _ = task_cancel.cancelled() => {
                    state_tx.send_replace(SessionState::Stopping);
                    debug!(%profile, "collection cancelled");
                }
            }

            let stopped = match reservation.disarm() {
                Some(backend) => {
                    tokio::task::spawn_blocking(move || backend.stop_collection(profile)).await
                }
                None => Ok(Ok(())),
            };
            drop(reservation);
            state_tx.send_replace(SessionState::Collected);
            info!(%profile, elapsed = ?started_at.elapsed(), "collection finished");

            if let Some(e) = failure.lock().take() {
                warn!(%profile, "collection sink failed: {e}");
                return Err(ProfilingError::TransportFailure(e));
            }
            stopped?.map_err(ProfilingError::backend)
        });

        Ok(CollectionSession {
            profile,
            started_at,
            cancel,
            state: state_rx,
            task,
        })
    }

    /// Cancels the running session of `profile`, if any, and waits until it
    /// is collected. Stopping a profile that is not collected is a no-op.
    pub async fn stop(&self, profile: DurationProfile) {
        let session = self
            .active
            .lock()
            .get(&profile)
            .map(|session| (session.cancel.clone(), session.state.clone()));
        let Some((cancel, mut state)) = session else {
            debug!(%profile, "nothing to stop");
            return;
        };
        cancel.cancel();
        // An error means the session task is gone, so it is collected too.
        let _ = state.wait_for(|state| *state == SessionState::Collected).await;
    }

    pub fn status(&self, profile: DurationProfile) -> SessionState {
        self.active
            .lock()
            .get(&profile)
            .map(|session| *session.state.borrow())
            .unwrap_or(SessionState::Idle)
    }

    pub fn is_active(&self, profile: DurationProfile) -> bool {
        self.active.lock().contains_key(&profile)
    }
}

/// Handle on a running collection.
pub struct CollectionSession {
    profile: DurationProfile,
    started_at: Instant,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Result<()>>,
}

impl CollectionSession {
    pub fn profile(&self) -> DurationProfile {
        self.profile
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Ends the collection early. [CollectionSession::wait] still reports
    /// how it went.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits until the session is collected.
    pub async fn wait(self) -> Result<()> {
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::test_utils::{FailingWriter, FakeBackend};

    fn setup() -> (Arc<SessionRegistry>, Arc<FakeBackend>) {
        (Arc::new(SessionRegistry::new()), Arc::new(FakeBackend::new()))
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn times_out_and_stops_once() {
        let (registry, backend) = setup();
        let session = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_millis(100),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let started_at = session.started_at();
        let mut states = session.subscribe();
        assert_eq!(SessionState::Running, session.state());
        assert_eq!(
            SessionState::Running,
            registry.status(DurationProfile::Cpu)
        );

        session.wait().await.unwrap();
        let elapsed = started_at.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

        assert_eq!(SessionState::Collected, *states.borrow_and_update());
        assert_eq!(1, backend.start_count(DurationProfile::Cpu));
        assert_eq!(1, backend.stop_count(DurationProfile::Cpu));
        assert!(!backend.is_collecting(DurationProfile::Cpu));
        assert_eq!(SessionState::Idle, registry.status(DurationProfile::Cpu));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn cancellation_stops_early() {
        let (registry, backend) = setup();
        let cancel = CancellationToken::new();
        let session = registry
            .start(
                backend.clone(),
                DurationProfile::Trace,
                Duration::from_secs(60),
                Box::new(std::io::sink()),
                &cancel,
            )
            .await
            .unwrap();
        let started_at = session.started_at();

        cancel.cancel();
        session.wait().await.unwrap();
        assert!(started_at.elapsed() < Duration::from_secs(30));
        assert_eq!(1, backend.stop_count(DurationProfile::Trace));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn explicit_stop_is_idempotent() {
        let (registry, backend) = setup();
        registry.stop(DurationProfile::Cpu).await;
        assert_eq!(0, backend.stop_count(DurationProfile::Cpu));

        let session = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_secs(60),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let mut states = session.subscribe();

        registry.stop(DurationProfile::Cpu).await;
        assert_eq!(SessionState::Collected, *states.borrow_and_update());
        registry.stop(DurationProfile::Cpu).await;

        session.wait().await.unwrap();
        assert_eq!(1, backend.stop_count(DurationProfile::Cpu));
        assert!(!registry.is_active(DurationProfile::Cpu));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn second_start_is_rejected() {
        let (registry, backend) = setup();
        let first = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_secs(60),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let err = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_secs(60),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(ErrorCode::CollectionStartFailed, err.code());
        assert_eq!(1, backend.start_count(DurationProfile::Cpu));

        // Trace is independent from CPU.
        let trace = registry
            .start(
                backend.clone(),
                DurationProfile::Trace,
                Duration::from_millis(10),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        trace.wait().await.unwrap();

        first.cancel();
        first.wait().await.unwrap();
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn backend_refusal_leaves_no_session() {
        let (registry, backend) = setup();
        backend.fail_next_start("profiling disabled");
        let err = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_secs(1),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(ErrorCode::CollectionStartFailed, err.code());
        assert!(err.to_string().contains("profiling disabled"));
        assert!(!registry.is_active(DurationProfile::Cpu));
        assert_eq!(0, backend.stop_count(DurationProfile::Cpu));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn unbounded_duration_runs_until_stopped() {
        let (registry, backend) = setup();
        let session = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_secs(u64::MAX),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(SessionState::Running, registry.status(DurationProfile::Cpu));
        assert!(backend.is_collecting(DurationProfile::Cpu));

        registry.stop(DurationProfile::Cpu).await;
        session.wait().await.unwrap();
        assert_eq!(1, backend.stop_count(DurationProfile::Cpu));
        assert!(!backend.is_collecting(DurationProfile::Cpu));

        // The profile can be collected again afterwards.
        let again = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_millis(10),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        again.wait().await.unwrap();
        assert_eq!(2, backend.stop_count(DurationProfile::Cpu));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn dropped_session_task_still_stops_the_backend() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (registry, backend) = setup();
        let session = rt
            .block_on(registry.start(
                backend.clone(),
                DurationProfile::Trace,
                Duration::from_secs(60),
                Box::new(std::io::sink()),
                &CancellationToken::new(),
            ))
            .unwrap();
        assert!(backend.is_collecting(DurationProfile::Trace));

        // Shutting the runtime down drops the session task mid-collection.
        drop(rt);
        assert_eq!(1, backend.stop_count(DurationProfile::Trace));
        assert!(!backend.is_collecting(DurationProfile::Trace));
        assert!(!registry.is_active(DurationProfile::Trace));
        drop(session);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn sink_failure_aborts_and_still_stops() {
        let (registry, backend) = setup();
        let session = registry
            .start(
                backend.clone(),
                DurationProfile::Cpu,
                Duration::from_secs(60),
                Box::new(FailingWriter),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(backend.emit(DurationProfile::Cpu, b"samples").is_err());
        let err = session.wait().await.unwrap_err();
        assert_eq!(ErrorCode::TransportFailure, err.code());
        assert_eq!(1, backend.stop_count(DurationProfile::Cpu));
        assert!(!backend.is_collecting(DurationProfile::Cpu));
    }
}
