// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol between the profile server and its clients.
//!
//! Every message is a bincode envelope inside a length-delimited frame.
//! Streaming requests are answered with any number of
//! [ProfileResponse::Chunk] frames followed by exactly one
//! [ProfileResponse::EndOfStream] or [ProfileResponse::Error].

pub mod blocking;

use crate::error::RemoteError;
use crate::profile_type::ProfileType;
use crate::session::SessionState;
use crate::variables::ProfileVariable;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_serde::formats::Bincode;
use tokio_serde::Framed as SerdeFramed;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Token returned by [ProfileRequest::Ping].
pub const PING_TOKEN: &str = "pong";

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProfileRequest {
    Ping,
    ClearCache,
    SetVariable {
        variable: ProfileVariable,
        value: i64,
    },
    ResetVariable {
        variable: ProfileVariable,
    },
    SnapshotProfile {
        profile: ProfileType,
        keep: bool,
    },
    CollectProfile {
        profile: ProfileType,
        duration: Duration,
        wait_for_completion: bool,
        keep: bool,
    },
    StopCollection {
        profile: ProfileType,
    },
    CollectionStatus {
        profile: ProfileType,
    },
    DownloadCached {
        profile: ProfileType,
    },
    BinaryDump,
}

impl ProfileRequest {
    /// Whether the request is answered with a chunk stream.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            ProfileRequest::SnapshotProfile { .. }
                | ProfileRequest::CollectProfile { .. }
                | ProfileRequest::DownloadCached { .. }
                | ProfileRequest::BinaryDump
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProfileResponse {
    Pong(String),
    Ack,
    /// A variable value: the replaced one for a set, the restored default for
    /// a reset.
    Value(i64),
    Status(SessionState),
    Chunk(Bytes),
    EndOfStream,
    Error(RemoteError),
}

pub type DefaultCodec<Item, SinkItem> = Bincode<Item, SinkItem>;

/// A framed, serializing transport over an async byte stream.
pub type Transport<S, Item, SinkItem> =
    SerdeFramed<Framed<S, LengthDelimitedCodec>, Item, SinkItem, DefaultCodec<Item, SinkItem>>;

pub type ServerTransport<S> = Transport<S, ProfileRequest, ProfileResponse>;
pub type ClientTransport<S> = Transport<S, ProfileResponse, ProfileRequest>;

pub fn length_delimited(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

pub fn new_transport<S, Item, SinkItem>(io: S, max_frame_length: usize) -> Transport<S, Item, SinkItem>
where
    S: AsyncRead + AsyncWrite,
{
    SerdeFramed::new(
        Framed::new(io, length_delimited(max_frame_length)),
        DefaultCodec::default(),
    )
}

/// A blocking [Write] that cuts what is written into chunks of at most
/// `chunk_size` bytes and queues them, in order, for the connection task.
///
/// The queue is unbounded so writers never wait on the network. A chunk is
/// queued once it is full, on flush, and on drop. Writing after the receiver
/// is gone fails with [io::ErrorKind::BrokenPipe].
pub struct ChunkWriter {
    buffer: BytesMut,
    chunk_size: usize,
    sender: mpsc::UnboundedSender<Bytes>,
}

impl ChunkWriter {
    pub fn new(chunk_size: usize) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let chunk_size = chunk_size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = Self {
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            sender,
        };
        (writer, receiver)
    }

    fn send_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.sender
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "chunk receiver dropped"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.sender.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "chunk receiver dropped",
            ));
        }
        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buffer.len();
            let (now, later) = rest.split_at(room.min(rest.len()));
            self.buffer.extend_from_slice(now);
            if self.buffer.len() == self.chunk_size {
                self.send_buffer()?;
                self.buffer.reserve(self.chunk_size);
            }
            rest = later;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer()
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        let _ = self.send_buffer();
    }
}
