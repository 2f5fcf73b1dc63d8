// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synthetic profiles and a scriptable in-memory backend for tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::backend::{ProfileSink, ProfilingBackend};
use crate::pprof::{self, Function, Label, Line, Location, Profile, Sample, ValueType};
use crate::profile_type::{DurationProfile, LookupProfile};
use crate::variables::ProfileVariable;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Write};

/// Header a trace collection writes as soon as it starts.
pub const TRACE_HEADER: &[u8] = b"go 1.21 trace\x00\x00\x00";

/// Builds small but valid pprof profiles.
///
/// Stacks are given root first; each distinct frame name becomes one
/// function with one location.
pub struct ProfileBuilder {
    profile: Profile,
    strings: HashMap<String, i64>,
    frames: HashMap<String, u64>,
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self {
            profile: Profile {
                string_table: vec![String::new()],
                ..Default::default()
            },
            strings: HashMap::from([(String::new(), 0)]),
            frames: HashMap::new(),
        }
    }
}

impl ProfileBuilder {
    pub fn new(sample_types: &[(&str, &str)]) -> Self {
        Self::default().sample_types(sample_types)
    }

    fn id(&mut self, s: &str) -> i64 {
        if let Some(id) = self.strings.get(s) {
            return *id;
        }
        let id = self.profile.string_table.len() as i64;
        self.profile.string_table.push(s.to_owned());
        self.strings.insert(s.to_owned(), id);
        id
    }

    fn value_type(&mut self, r#type: &str, unit: &str) -> ValueType {
        ValueType {
            r#type: self.id(r#type),
            unit: self.id(unit),
        }
    }

    fn location(&mut self, frame: &str) -> u64 {
        if let Some(id) = self.frames.get(frame) {
            return *id;
        }
        let id = self.profile.locations.len() as u64 + 1;
        let function = Function {
            id,
            name: self.id(frame),
            system_name: self.id(frame),
            filename: self.id("src/main.rs"),
            start_line: 0,
        };
        self.profile.functions.push(function);
        self.profile.locations.push(Location {
            id,
            mapping_id: 0,
            address: 0x1000 + id * 0x10,
            lines: vec![Line {
                function_id: id,
                line: id as i64,
            }],
            is_folded: false,
        });
        self.frames.insert(frame.to_owned(), id);
        id
    }

    /// Adds `s` to the string table without referencing it.
    pub fn intern(mut self, s: &str) -> Self {
        self.id(s);
        self
    }

    pub fn sample_types(mut self, sample_types: &[(&str, &str)]) -> Self {
        self.profile.sample_types = sample_types
            .iter()
            .map(|(r#type, unit)| self.value_type(r#type, unit))
            .collect();
        self
    }

    pub fn period_type(mut self, r#type: &str, unit: &str) -> Self {
        self.profile.period_type = Some(self.value_type(r#type, unit));
        self
    }

    pub fn period(mut self, period: i64) -> Self {
        self.profile.period = period;
        self
    }

    pub fn time_nanos(mut self, time_nanos: i64) -> Self {
        self.profile.time_nanos = time_nanos;
        self
    }

    pub fn duration_nanos(mut self, duration_nanos: i64) -> Self {
        self.profile.duration_nanos = duration_nanos;
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        let id = self.id(comment);
        self.profile.comment.push(id);
        self
    }

    pub fn sample(self, stack: &[&str], values: &[i64]) -> Self {
        self.labeled_sample(stack, values, &[])
    }

    pub fn labeled_sample(mut self, stack: &[&str], values: &[i64], labels: &[(&str, &str)]) -> Self {
        let location_ids = stack.iter().rev().map(|frame| self.location(frame)).collect();
        let labels = labels
            .iter()
            .map(|(key, value)| Label {
                key: self.id(key),
                str: self.id(value),
                num: 0,
                num_unit: 0,
            })
            .collect();
        self.profile.samples.push(Sample {
            location_ids,
            values: values.to_vec(),
            labels,
        });
        self
    }

    pub fn build(self) -> Profile {
        self.profile
    }

    /// The profile as the runtime would emit it: gzip-compressed protobuf.
    pub fn encode(self) -> Vec<u8> {
        pprof::serialize(&self.profile).expect("encoding an in-memory profile")
    }
}

/// Frame names of `sample`, root first.
pub fn stack_of(profile: &Profile, sample: &Sample) -> Vec<String> {
    sample
        .location_ids
        .iter()
        .rev()
        .map(|id| {
            let location = profile.locations.iter().find(|l| l.id == *id).unwrap();
            let function_id = location.lines[0].function_id;
            let function = profile.functions.iter().find(|f| f.id == function_id).unwrap();
            profile.string(function.name).unwrap().to_owned()
        })
        .collect()
}

pub fn cpu_profile() -> ProfileBuilder {
    ProfileBuilder::new(&[("samples", "count"), ("cpu", "nanoseconds")])
        .period_type("cpu", "nanoseconds")
        .period(10_000_000)
}

pub fn heap_profile() -> ProfileBuilder {
    ProfileBuilder::new(&[
        ("alloc_objects", "count"),
        ("alloc_space", "bytes"),
        ("inuse_objects", "count"),
        ("inuse_space", "bytes"),
    ])
    .period_type("space", "bytes")
    .period(524_288)
}

pub fn contention_profile() -> ProfileBuilder {
    ProfileBuilder::new(&[("contentions", "count"), ("delay", "nanoseconds")])
        .period_type("contentions", "count")
        .period(1)
}

pub fn count_profile(name: &str) -> ProfileBuilder {
    ProfileBuilder::new(&[(name, "count")]).period_type(name, "count").period(1)
}

/// What a snapshot of one lookup profile produces.
#[derive(Clone)]
enum Snapshot {
    Unavailable,
    Payload(Vec<u8>),
}

struct Collection {
    sink: ProfileSink,
}

#[derive(Default)]
struct FakeState {
    active: HashMap<DurationProfile, Collection>,
    starts: HashMap<DurationProfile, usize>,
    stops: HashMap<DurationProfile, usize>,
    payloads: HashMap<DurationProfile, Vec<u8>>,
    snapshots: HashMap<LookupProfile, Snapshot>,
    variables: HashMap<ProfileVariable, i64>,
    start_failure: Option<String>,
}

/// An in-memory [ProfilingBackend] that records every call.
///
/// CPU collections write one pprof profile when they stop; trace collections
/// write [TRACE_HEADER] when they start and a body when they stop. Lookup
/// snapshots are generated per profile type unless overridden.
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        let state = FakeState {
            variables: HashMap::from([
                (ProfileVariable::MemProfileRate, 524_288),
                (ProfileVariable::MutexProfileFraction, 0),
                (ProfileVariable::BlockProfileRate, 0),
            ]),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn start_count(&self, profile: DurationProfile) -> usize {
        self.state.lock().starts.get(&profile).copied().unwrap_or(0)
    }

    pub fn stop_count(&self, profile: DurationProfile) -> usize {
        self.state.lock().stops.get(&profile).copied().unwrap_or(0)
    }

    pub fn is_collecting(&self, profile: DurationProfile) -> bool {
        self.state.lock().active.contains_key(&profile)
    }

    /// Bytes written when a collection of `profile` stops.
    pub fn set_collection_payload(&self, profile: DurationProfile, payload: Vec<u8>) {
        self.state.lock().payloads.insert(profile, payload);
    }

    pub fn set_snapshot(&self, profile: LookupProfile, payload: Vec<u8>) {
        self.state
            .lock()
            .snapshots
            .insert(profile, Snapshot::Payload(payload));
    }

    /// Makes `profile` report that no data is available.
    pub fn set_unavailable(&self, profile: LookupProfile) {
        self.state
            .lock()
            .snapshots
            .insert(profile, Snapshot::Unavailable);
    }

    /// Makes the next `start_collection` fail with `reason`.
    pub fn fail_next_start(&self, reason: &str) {
        self.state.lock().start_failure = Some(reason.to_owned());
    }

    /// Writes `bytes` into the sink of a running collection, the way a runtime
    /// emits data while it is still collecting.
    pub fn emit(&self, profile: DurationProfile, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        let collection = state
            .active
            .get_mut(&profile)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not collecting"))?;
        collection.sink.write_all(bytes)?;
        collection.sink.flush()
    }

    fn default_payload(profile: DurationProfile) -> Vec<u8> {
        match profile {
            DurationProfile::Cpu => cpu_profile()
                .duration_nanos(100_000_000)
                .sample(&["main", "busy"], &[1, 10_000_000])
                .encode(),
            DurationProfile::Trace => b"\x00\x01trace-events".to_vec(),
        }
    }

    fn default_snapshot(profile: LookupProfile) -> Vec<u8> {
        match profile {
            LookupProfile::Heap => heap_profile()
                .sample(&["main", "alloc"], &[1, 1024, 1, 1024])
                .encode(),
            LookupProfile::Mutex | LookupProfile::Block => contention_profile()
                .sample(&["main", "lock"], &[1, 1000])
                .encode(),
            LookupProfile::ThreadCreate => count_profile("threadcreate")
                .sample(&["main", "spawn"], &[1])
                .encode(),
            LookupProfile::Goroutine => count_profile("goroutine")
                .sample(&["main", "park"], &[2])
                .encode(),
        }
    }
}

impl ProfilingBackend for FakeBackend {
    fn start_collection(&self, profile: DurationProfile, mut sink: ProfileSink) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = state.start_failure.take() {
            anyhow::bail!(reason);
        }
        if state.active.contains_key(&profile) {
            anyhow::bail!("{profile} profiling already in use");
        }
        if profile == DurationProfile::Trace {
            sink.write_all(TRACE_HEADER)
                .and_then(|()| sink.flush())
                .context("writing the trace header")?;
        }
        *state.starts.entry(profile).or_default() += 1;
        state.active.insert(profile, Collection { sink });
        Ok(())
    }

    fn stop_collection(&self, profile: DurationProfile) -> anyhow::Result<()> {
        let (collection, payload) = {
            let mut state = self.state.lock();
            *state.stops.entry(profile).or_default() += 1;
            let payload = state
                .payloads
                .get(&profile)
                .cloned()
                .unwrap_or_else(|| Self::default_payload(profile));
            (state.active.remove(&profile), payload)
        };
        let Some(mut collection) = collection else {
            return Ok(());
        };
        collection.sink.write_all(&payload)?;
        collection.sink.flush()?;
        Ok(())
    }

    fn snapshot(&self, profile: LookupProfile, out: &mut dyn Write) -> anyhow::Result<bool> {
        let snapshot = self.state.lock().snapshots.get(&profile).cloned();
        let payload = match snapshot {
            Some(Snapshot::Unavailable) => return Ok(false),
            Some(Snapshot::Payload(payload)) => payload,
            None => Self::default_snapshot(profile),
        };
        out.write_all(&payload)?;
        Ok(true)
    }

    fn variable(&self, variable: ProfileVariable) -> i64 {
        self.state
            .lock()
            .variables
            .get(&variable)
            .copied()
            .unwrap_or_default()
    }

    fn set_variable(&self, variable: ProfileVariable, value: i64) {
        self.state.lock().variables.insert(variable, value);
    }
}

/// A writer whose every write fails, to exercise broken sinks.
pub struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A cloneable in-memory sink, for operations that need an owned writer.
#[derive(Clone, Default)]
pub struct SharedBuffer(std::sync::Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
