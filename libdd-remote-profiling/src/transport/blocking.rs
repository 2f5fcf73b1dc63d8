// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{length_delimited, DefaultCodec, ProfileRequest, ProfileResponse};
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::pin::pin;
use tokio_serde::{Deserializer, Serializer};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const READ_CHUNK: usize = 8 * 1024;

/// Synchronous request/response framing over any [Read] + [Write] stream,
/// speaking the same protocol as the async server.
pub struct BlockingTransport<S> {
    stream: S,
    codec: LengthDelimitedCodec,
    read_buffer: BytesMut,
}

impl<S> BlockingTransport<S> {
    pub fn new(stream: S, max_frame_length: usize) -> Self {
        BlockingTransport {
            stream,
            codec: length_delimited(max_frame_length),
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> BlockingTransport<S> {
    pub fn send(&mut self, request: &ProfileRequest) -> io::Result<()> {
        let data = pin!(DefaultCodec::<(), ProfileRequest>::default()).serialize(request)?;
        let mut buf = BytesMut::with_capacity(data.len() + 4);
        self.codec.encode(data, &mut buf)?;
        self.stream.write_all(&buf)?;
        self.stream.flush()
    }

    pub fn read_response(&mut self) -> io::Result<ProfileResponse> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
                return pin!(DefaultCodec::<ProfileResponse, ()>::default()).deserialize(&frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a response",
                ));
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn call(&mut self, request: &ProfileRequest) -> io::Result<ProfileResponse> {
        self.send(request)?;
        self.read_response()
    }
}
