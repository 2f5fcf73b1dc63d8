// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ClientConfig;
use crate::error::{ProfilingError, Result};
use crate::profile_type::ProfileType;
use crate::session::SessionState;
use crate::transport::blocking::BlockingTransport;
use crate::transport::{ProfileRequest, ProfileResponse, PING_TOKEN};
use crate::variables::ProfileVariable;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// A byte stream the client can talk over.
pub trait ClientStream: Read + Write {
    /// Bounds how long a single read may block; `None` waits forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ClientStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl ClientStream for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }
}

fn unexpected(response: ProfileResponse) -> ProfilingError {
    ProfilingError::TransportFailure(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected response: {response:?}"),
    ))
}

/// Synchronous client of a profile server.
///
/// Streaming calls write every received chunk to the given sink as it
/// arrives and return the number of bytes written. On failure the sink keeps
/// whatever it already received.
pub struct ProfileClient<S = TcpStream> {
    transport: BlockingTransport<S>,
    io_timeout: Option<Duration>,
}

impl ProfileClient<TcpStream> {
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &ClientConfig) -> Result<Self> {
        let mut last_error = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(config.io_timeout)?;
                    debug!(%addr, "connected to profile server");
                    return Self::with_timeout(stream, config.max_frame_length, config.io_timeout);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no address to connect to")
            })
            .into())
    }
}

impl<S: ClientStream> ProfileClient<S> {
    /// Wraps an established stream and checks that a profile server answers.
    pub fn from_stream(stream: S, max_frame_length: usize) -> Result<Self> {
        Self::with_timeout(stream, max_frame_length, None)
    }

    fn with_timeout(stream: S, max_frame_length: usize, io_timeout: Option<Duration>) -> Result<Self> {
        stream.set_read_timeout(io_timeout)?;
        let mut client = ProfileClient {
            transport: BlockingTransport::new(stream, max_frame_length),
            io_timeout,
        };
        match client.ping() {
            Ok(token) if token == PING_TOKEN => Ok(client),
            Ok(token) => Err(ProfilingError::ConnectionRejected(format!(
                "unexpected liveness token {token:?}"
            ))),
            Err(e) => Err(ProfilingError::ConnectionRejected(e.to_string())),
        }
    }

    pub fn into_inner(self) -> S {
        self.transport.into_inner()
    }

    fn call(&mut self, request: &ProfileRequest) -> Result<ProfileResponse> {
        match self.transport.call(request)? {
            ProfileResponse::Error(e) => Err(e.into()),
            response => Ok(response),
        }
    }

    fn receive_stream(&mut self, sink: &mut dyn Write) -> Result<u64> {
        let mut written = 0u64;
        let mut sink_error = None;
        loop {
            match self.transport.read_response()? {
                ProfileResponse::Chunk(chunk) => {
                    if sink_error.is_some() {
                        continue;
                    }
                    match sink.write_all(&chunk) {
                        Ok(()) => written += chunk.len() as u64,
                        // Keep reading so the connection stays in sync.
                        Err(e) => sink_error = Some(e),
                    }
                }
                ProfileResponse::EndOfStream => break,
                ProfileResponse::Error(e) => return Err(e.into()),
                other => return Err(unexpected(other)),
            }
        }
        if let Some(e) = sink_error {
            return Err(e.into());
        }
        sink.flush()?;
        Ok(written)
    }

    fn stream(&mut self, request: &ProfileRequest, sink: &mut dyn Write) -> Result<u64> {
        self.transport.send(request)?;
        self.receive_stream(sink)
    }

    pub fn ping(&mut self) -> Result<String> {
        match self.call(&ProfileRequest::Ping)? {
            ProfileResponse::Pong(token) => Ok(token),
            other => Err(unexpected(other)),
        }
    }

    fn ack(&mut self, request: &ProfileRequest) -> Result<()> {
        match self.call(request)? {
            ProfileResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn value(&mut self, request: &ProfileRequest) -> Result<i64> {
        match self.call(request)? {
            ProfileResponse::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn clear_cache(&mut self) -> Result<()> {
        self.ack(&ProfileRequest::ClearCache)
    }

    /// Returns the value the variable had before.
    pub fn set_variable(&mut self, variable: ProfileVariable, value: i64) -> Result<i64> {
        self.value(&ProfileRequest::SetVariable { variable, value })
    }

    /// Returns the restored default.
    pub fn reset_variable(&mut self, variable: ProfileVariable) -> Result<i64> {
        self.value(&ProfileRequest::ResetVariable { variable })
    }

    pub fn snapshot_profile(
        &mut self,
        profile: ProfileType,
        keep: bool,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        self.stream(&ProfileRequest::SnapshotProfile { profile, keep }, sink)
    }

    pub fn collect_profile(
        &mut self,
        profile: ProfileType,
        duration: Duration,
        wait_for_completion: bool,
        keep: bool,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let request = ProfileRequest::CollectProfile {
            profile,
            duration,
            wait_for_completion,
            keep,
        };
        if !wait_for_completion {
            return self.stream(&request, sink);
        }

        let extended = self.io_timeout.map(|timeout| timeout.saturating_add(duration));
        self.transport.get_ref().set_read_timeout(extended)?;
        let result = self.stream(&request, sink);
        self.transport.get_ref().set_read_timeout(self.io_timeout)?;
        result
    }

    pub fn stop_collection(&mut self, profile: ProfileType) -> Result<()> {
        self.ack(&ProfileRequest::StopCollection { profile })
    }

    pub fn collection_status(&mut self, profile: ProfileType) -> Result<SessionState> {
        match self.call(&ProfileRequest::CollectionStatus { profile })? {
            ProfileResponse::Status(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub fn download_cached(&mut self, profile: ProfileType, sink: &mut dyn Write) -> Result<u64> {
        self.stream(&ProfileRequest::DownloadCached { profile }, sink)
    }

    /// Downloads the executable of the profiled process.
    pub fn binary_dump(&mut self, sink: &mut dyn Write) -> Result<u64> {
        self.stream(&ProfileRequest::BinaryDump, sink)
    }
}
