// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ServerConfig;
use crate::error::{ProfilingError, Result};
use crate::service::ProfileService;
use crate::transport::{
    new_transport, ChunkWriter, ProfileRequest, ProfileResponse, ServerTransport,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Responses<S> = SplitSink<ServerTransport<S>, ProfileResponse>;
type Requests<S> = SplitStream<ServerTransport<S>>;

/// Serves a [ProfileService] to remote clients.
#[derive(Clone)]
pub struct ProfileServer {
    service: ProfileService,
    chunk_size: usize,
    max_frame_length: usize,
    shutdown: CancellationToken,
}

/// A server accepting connections in the background.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes the open ones.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("profile server task failed: {e}");
        }
    }
}

impl ProfileServer {
    pub fn new(service: ProfileService, config: &ServerConfig) -> Self {
        ProfileServer {
            service,
            chunk_size: config.effective_chunk_size(),
            max_frame_length: config.max_frame_length,
            shutdown: CancellationToken::new(),
        }
    }

    /// Binds `config.listen_addr` and serves connections until the returned
    /// handle is stopped.
    pub async fn start(service: ProfileService, config: &ServerConfig) -> Result<RunningServer> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let server = Self::new(service, config);
        let shutdown = server.shutdown.clone();
        info!(%local_addr, "profile server listening");
        let task = tokio::spawn(server.serve(listener));
        Ok(RunningServer {
            local_addr,
            shutdown,
            task,
        })
    }

    pub async fn serve(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted profiling connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, "could not disable nagle: {e}");
                        }
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.accept_connection(stream).await;
                            debug!(%peer, "profiling connection closed");
                        });
                    }
                    Err(e) => warn!("failed to accept profiling connection: {e}"),
                },
            }
        }
        info!("profile server stopped");
    }

    /// Serves requests arriving on `stream` until the peer hangs up or the
    /// server shuts down. Any byte stream works, so callers can authenticate
    /// the connection (e.g. with TLS) before handing it over.
    pub async fn accept_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let transport: ServerTransport<S> = new_transport(stream, self.max_frame_length);
        let (mut responses, mut requests): (Responses<S>, Requests<S>) = transport.split();
        let mut pending = None;

        loop {
            let next = match pending.take() {
                Some(next) => next,
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    next = requests.next() => match next {
                        Some(next) => next,
                        None => break,
                    },
                },
            };
            let request = match next {
                Ok(request) => request,
                Err(e) => {
                    debug!("malformed profiling request: {e}");
                    let error = ProfilingError::InvalidRequest(e.to_string());
                    if responses
                        .send(ProfileResponse::Error(error.to_remote()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };

            debug!(?request, "handling profiling request");
            let handled = if request.is_streaming() {
                self.stream(request, &mut responses, &mut requests, &mut pending)
                    .await
            } else {
                let response = match self.unary(request).await {
                    Ok(response) => response,
                    Err(e) => ProfileResponse::Error(e.to_remote()),
                };
                responses.send(response).await
            };
            if let Err(e) = handled {
                debug!("dropping profiling connection: {e}");
                break;
            }
        }
    }

    async fn unary(&self, request: ProfileRequest) -> Result<ProfileResponse> {
        let service = &self.service;
        Ok(match request {
            ProfileRequest::Ping => ProfileResponse::Pong(service.ping().to_owned()),
            ProfileRequest::ClearCache => {
                service.clear_cache();
                ProfileResponse::Ack
            }
            ProfileRequest::SetVariable { variable, value } => {
                ProfileResponse::Value(service.set_variable(variable, value)?)
            }
            ProfileRequest::ResetVariable { variable } => {
                ProfileResponse::Value(service.reset_variable(variable)?)
            }
            ProfileRequest::StopCollection { profile } => {
                service.stop_collection(profile).await?;
                ProfileResponse::Ack
            }
            ProfileRequest::CollectionStatus { profile } => {
                ProfileResponse::Status(service.collection_status(profile)?)
            }
            streaming => {
                return Err(ProfilingError::InvalidRequest(format!(
                    "{streaming:?} is a streaming request"
                )))
            }
        })
    }

    async fn run_streaming(
        service: ProfileService,
        request: ProfileRequest,
        sink: ChunkWriter,
        cancel: CancellationToken,
    ) -> Result<()> {
        match request {
            ProfileRequest::SnapshotProfile { profile, keep } => {
                service.snapshot_profile(profile, keep, sink).await
            }
            ProfileRequest::CollectProfile {
                profile,
                duration,
                wait_for_completion,
                keep,
            } => {
                service
                    .collect_profile(profile, duration, wait_for_completion, keep, sink, &cancel)
                    .await
            }
            ProfileRequest::DownloadCached { profile } => {
                service.download_cached(profile, sink).await
            }
            ProfileRequest::BinaryDump => service.binary_dump(sink).await,
            unary => Err(ProfilingError::InvalidRequest(format!(
                "{unary:?} is not a streaming request"
            ))),
        }
    }

    /// Relays the chunks of a streaming request while watching the
    /// connection. A closed connection cancels the request.
    async fn stream<S>(
        &self,
        request: ProfileRequest,
        responses: &mut Responses<S>,
        requests: &mut Requests<S>,
        pending: &mut Option<io::Result<ProfileRequest>>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, mut chunks) = ChunkWriter::new(self.chunk_size);
        let cancel = CancellationToken::new();
        let mut handler = tokio::spawn(Self::run_streaming(
            self.service.clone(),
            request,
            sink,
            cancel.clone(),
        ));
        let mut connected = true;

        let result = loop {
            tokio::select! {
                Some(chunk) = chunks.recv() => {
                    if let Err(e) = responses.send(ProfileResponse::Chunk(chunk)).await {
                        cancel.cancel();
                        let _ = (&mut handler).await;
                        return Err(e);
                    }
                }
                result = &mut handler => break result,
                next = requests.next(), if connected && pending.is_none() => match next {
                    Some(next) => *pending = Some(next),
                    None => {
                        info!("profiling client disconnected, cancelling its request");
                        cancel.cancel();
                        connected = false;
                    }
                },
            }
        };

        let result = result.map_err(ProfilingError::from).and_then(|result| result);
        if !connected {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client went away during a stream",
            ));
        }
        while let Ok(chunk) = chunks.try_recv() {
            responses.send(ProfileResponse::Chunk(chunk)).await?;
        }
        let trailer = match result {
            Ok(()) => ProfileResponse::EndOfStream,
            Err(e) => {
                debug!("streaming request failed: {e}");
                ProfileResponse::Error(e.to_remote())
            }
        };
        responses.send(trailer).await
    }
}
