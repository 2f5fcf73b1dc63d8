// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::{BufMut, BytesMut};
use libdd_remote_profiling::client::ProfileClient;
use libdd_remote_profiling::config::{ClientConfig, ServerConfig};
use libdd_remote_profiling::pprof;
use libdd_remote_profiling::server::{ProfileServer, RunningServer};
use libdd_remote_profiling::service::ProfileService;
use libdd_remote_profiling::session::SessionState;
use libdd_remote_profiling::test_utils::FakeBackend;
use libdd_remote_profiling::transport::blocking::BlockingTransport;
use libdd_remote_profiling::transport::{
    ProfileRequest, ProfileResponse, DEFAULT_MAX_FRAME_LENGTH,
};
use libdd_remote_profiling::variables::ProfileVariable;
use libdd_remote_profiling::{DurationProfile, ErrorCode, LookupProfile, ProfileType};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{self, Runtime};

struct Harness {
    rt: Runtime,
    server: Option<RunningServer>,
    service: ProfileService,
    backend: Arc<FakeBackend>,
}

impl Harness {
    fn start(chunk_size: usize) -> Self {
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let backend = Arc::new(FakeBackend::new());
        let service = ProfileService::new(backend.clone());
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            chunk_size,
            ..Default::default()
        };
        let server = rt
            .block_on(ProfileServer::start(service.clone(), &config))
            .unwrap();
        Harness {
            rt,
            server: Some(server),
            service,
            backend,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.server.as_ref().unwrap().local_addr()
    }

    fn client(&self) -> ProfileClient {
        ProfileClient::connect(self.addr(), &ClientConfig::default()).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            self.rt.block_on(server.stop());
        }
    }
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting until {what}");
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
#[cfg_attr(miri, ignore)]
fn ping_and_clear_cache() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();
    assert_eq!("pong", client.ping().unwrap());

    let mut out = Vec::new();
    client
        .snapshot_profile(ProfileType::Heap, true, &mut out)
        .unwrap();
    assert_eq!(1, harness.service.store().len());
    client.clear_cache().unwrap();
    assert!(harness.service.store().is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn chunked_transport_round_trip() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();

    for len in [0, 1, 4096, 10_000_000] {
        let expected = payload(len);
        harness
            .backend
            .set_snapshot(LookupProfile::Goroutine, expected.clone());
        let mut out = Vec::with_capacity(len);
        let written = client
            .snapshot_profile(ProfileType::Goroutine, false, &mut out)
            .unwrap();
        assert_eq!(len as u64, written);
        assert!(expected == out, "payload of {len} bytes was altered");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn one_byte_chunks_round_trip() {
    let harness = Harness::start(1);
    let mut client = harness.client();

    for len in [0, 1, 4096] {
        let expected = payload(len);
        harness
            .backend
            .set_snapshot(LookupProfile::ThreadCreate, expected.clone());
        let mut out = Vec::new();
        client
            .snapshot_profile(ProfileType::ThreadCreate, false, &mut out)
            .unwrap();
        assert_eq!(expected, out);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn unavailable_snapshot_is_empty() {
    let harness = Harness::start(64 * 1024);
    harness.backend.set_unavailable(LookupProfile::Block);
    let mut client = harness.client();
    let mut out = Vec::new();
    assert_eq!(
        0,
        client
            .snapshot_profile(ProfileType::Block, true, &mut out)
            .unwrap()
    );
    assert!(out.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn download_cached_after_keep() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();

    let mut out = Vec::new();
    let err = client
        .download_cached(ProfileType::Heap, &mut out)
        .unwrap_err();
    assert_eq!(ErrorCode::NotFound, err.code());
    assert!(out.is_empty());

    let mut snapshot = Vec::new();
    client
        .snapshot_profile(ProfileType::Heap, true, &mut snapshot)
        .unwrap();
    client
        .download_cached(ProfileType::Heap, &mut out)
        .unwrap();
    assert_eq!(
        pprof::parse(&snapshot).unwrap(),
        pprof::parse(&out).unwrap()
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn collect_with_keep() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();

    let mut out = Vec::new();
    let written = client
        .collect_profile(
            ProfileType::Cpu,
            Duration::from_millis(100),
            true,
            true,
            &mut out,
        )
        .unwrap();
    assert_eq!(out.len() as u64, written);
    let collected = pprof::parse(&out).unwrap();

    let mut cached = Vec::new();
    client
        .download_cached(ProfileType::Cpu, &mut cached)
        .unwrap();
    assert_eq!(collected, pprof::parse(&cached).unwrap());
    assert_eq!(1, harness.backend.stop_count(DurationProfile::Cpu));
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_collections_are_rejected() {
    let harness = Harness::start(64 * 1024);
    let addr = harness.addr();
    let first = std::thread::spawn(move || {
        let mut client = ProfileClient::connect(addr, &ClientConfig::default()).unwrap();
        let mut out = Vec::new();
        let written = client
            .collect_profile(
                ProfileType::Cpu,
                Duration::from_secs(30),
                true,
                false,
                &mut out,
            )
            .unwrap();
        (written, out)
    });

    let mut client = harness.client();
    eventually("the first collection runs", || {
        client.collection_status(ProfileType::Cpu).unwrap() == SessionState::Running
    });

    let mut out = Vec::new();
    let err = client
        .collect_profile(
            ProfileType::Cpu,
            Duration::from_secs(1),
            true,
            false,
            &mut out,
        )
        .unwrap_err();
    assert_eq!(ErrorCode::CollectionStartFailed, err.code());
    assert!(out.is_empty());

    client.stop_collection(ProfileType::Cpu).unwrap();
    let (written, out) = first.join().unwrap();
    assert_eq!(out.len() as u64, written);
    pprof::parse(&out).unwrap();
    assert_eq!(1, harness.backend.start_count(DurationProfile::Cpu));
    assert_eq!(1, harness.backend.stop_count(DurationProfile::Cpu));
    assert_eq!(
        SessionState::Idle,
        client.collection_status(ProfileType::Cpu).unwrap()
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn stop_without_session_succeeds() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();
    client.stop_collection(ProfileType::Cpu).unwrap();
    client.stop_collection(ProfileType::Trace).unwrap();
    assert_eq!(0, harness.backend.stop_count(DurationProfile::Cpu));
}

#[test]
#[cfg_attr(miri, ignore)]
fn disconnect_cancels_the_session() {
    let harness = Harness::start(64 * 1024);
    let stream = TcpStream::connect(harness.addr()).unwrap();
    let mut transport = BlockingTransport::new(stream, DEFAULT_MAX_FRAME_LENGTH);
    transport
        .send(&ProfileRequest::CollectProfile {
            profile: ProfileType::Trace,
            duration: Duration::from_secs(60),
            wait_for_completion: true,
            keep: false,
        })
        .unwrap();
    // The trace header is written as soon as the collection starts.
    match transport.read_response().unwrap() {
        ProfileResponse::Chunk(chunk) => assert!(!chunk.is_empty()),
        other => panic!("unexpected response {other:?}"),
    }
    drop(transport);

    eventually("the collection is stopped", || {
        harness.backend.stop_count(DurationProfile::Trace) == 1
    });
    eventually("the session is gone", || {
        harness
            .service
            .collection_status(ProfileType::Trace)
            .unwrap()
            == SessionState::Idle
    });
    assert!(!harness.backend.is_collecting(DurationProfile::Trace));
}

#[test]
#[cfg_attr(miri, ignore)]
fn fire_and_forget_then_download() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();

    let mut out = Vec::new();
    let written = client
        .collect_profile(
            ProfileType::Cpu,
            Duration::from_secs(60),
            false,
            true,
            &mut out,
        )
        .unwrap();
    assert_eq!(0, written);
    assert_eq!(
        SessionState::Running,
        client.collection_status(ProfileType::Cpu).unwrap()
    );

    client.stop_collection(ProfileType::Cpu).unwrap();
    let mut cached = Vec::new();
    eventually("the background collection is cached", || {
        cached.clear();
        client
            .download_cached(ProfileType::Cpu, &mut cached)
            .is_ok()
    });
    pprof::parse(&cached).unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn wrong_profile_family() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();

    let heap: ProfileType = "memory".parse().unwrap();
    let err = client
        .collect_profile(heap, Duration::from_millis(10), true, false, &mut Vec::new())
        .unwrap_err();
    assert_eq!(ErrorCode::UnknownProfileType, err.code());

    let err = client.stop_collection(ProfileType::Goroutine).unwrap_err();
    assert_eq!(ErrorCode::UnknownProfileType, err.code());

    let err = client
        .snapshot_profile(ProfileType::Trace, false, &mut Vec::new())
        .unwrap_err();
    assert_eq!(ErrorCode::UnknownProfileType, err.code());

    // The connection is still usable afterwards.
    assert_eq!("pong", client.ping().unwrap());
}

#[test]
#[cfg_attr(miri, ignore)]
fn variables_over_the_wire() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();
    let variable: ProfileVariable = "alloc-rate".parse().unwrap();

    assert_eq!(524_288, client.set_variable(variable, 1).unwrap());
    assert_eq!(1, client.set_variable(variable, 2).unwrap());
    assert_eq!(524_288, client.reset_variable(variable).unwrap());
    assert_eq!(
        524_288,
        harness.service.variables().get(variable).unwrap()
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn malformed_frame_gets_an_error() {
    let harness = Harness::start(64 * 1024);
    let mut stream = TcpStream::connect(harness.addr()).unwrap();

    let garbage = [0xffu8; 7];
    let mut frame = BytesMut::new();
    frame.put_u32(garbage.len() as u32);
    frame.put_slice(&garbage);
    stream.write_all(&frame).unwrap();

    let mut transport = BlockingTransport::new(stream, DEFAULT_MAX_FRAME_LENGTH);
    match transport.read_response().unwrap() {
        ProfileResponse::Error(e) => assert_eq!(ErrorCode::InvalidRequest, e.code),
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(
        ProfileResponse::Pong("pong".into()),
        transport.call(&ProfileRequest::Ping).unwrap()
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn binary_dump() {
    let harness = Harness::start(64 * 1024);
    let mut client = harness.client();
    let mut out = Vec::new();
    let written = client.binary_dump(&mut out).unwrap();
    let expected = std::fs::metadata(std::env::current_exe().unwrap()).unwrap();
    assert_eq!(expected.len(), written);
}

#[test]
#[cfg_attr(miri, ignore)]
fn streams_into_a_file() {
    let harness = Harness::start(1024);
    harness
        .backend
        .set_snapshot(LookupProfile::Mutex, payload(100_000));
    let mut client = harness.client();

    let mut file = tempfile::tempfile().unwrap();
    let written = client
        .snapshot_profile(ProfileType::Mutex, false, &mut file)
        .unwrap();
    assert_eq!(100_000, written);
    assert_eq!(100_000, file.metadata().unwrap().len());
}

#[test]
#[cfg_attr(miri, ignore)]
fn failed_keep_still_delivers_the_bytes() {
    let harness = Harness::start(4);
    let mut client = harness.client();
    let garbage = b"definitely not a pprof profile".to_vec();
    harness
        .backend
        .set_snapshot(LookupProfile::Block, garbage.clone());

    let mut out = Vec::new();
    let err = client
        .snapshot_profile(ProfileType::Block, true, &mut out)
        .unwrap_err();
    assert_eq!(ErrorCode::InvalidProfile, err.code());
    assert_eq!(garbage, out);
    assert!(harness.service.store().is_empty());

    // The error trailer ends the stream cleanly.
    assert_eq!("pong", client.ping().unwrap());
}
