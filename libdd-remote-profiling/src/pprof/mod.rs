// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing, serialization and merging of pprof encoded profiles.

mod merge;

pub use libdd_remote_profiling_protobuf::*;
pub use merge::merge;

use crate::error::{ProfilingError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use std::io::{Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decodes a profile from raw or gzip-compressed protobuf bytes.
pub fn parse(bytes: &[u8]) -> Result<Profile> {
    if bytes.is_empty() {
        return Err(ProfilingError::InvalidProfile("empty input".into()));
    }

    let profile = if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::with_capacity(bytes.len().saturating_mul(4));
        GzDecoder::new(bytes)
            .read_to_end(&mut decoded)
            .map_err(ProfilingError::invalid_profile)?;
        Profile::decode(decoded.as_slice())
    } else {
        Profile::decode(bytes)
    }
    .map_err(ProfilingError::invalid_profile)?;

    match profile.string_table.first() {
        Some(first) if first.is_empty() => Ok(profile),
        _ => Err(ProfilingError::InvalidProfile(
            "string table must start with the empty string".into(),
        )),
    }
}

/// Encodes a profile as gzip-compressed protobuf.
pub fn serialize(profile: &Profile) -> Result<Vec<u8>> {
    let encoded = profile.encode_to_vec();
    let mut encoder = GzEncoder::new(Vec::with_capacity(encoded.len() / 2), Compression::default());
    encoder.write_all(&encoded)?;
    Ok(encoder.finish()?)
}

/// Two profiles are compatible when their period type and their sample types
/// resolve to the same `(type, unit)` strings, in the same order.
pub fn check_compatible(a: &Profile, b: &Profile) -> Result<()> {
    let period_a = resolve_optional(a, a.period_type.as_ref())?;
    let period_b = resolve_optional(b, b.period_type.as_ref())?;
    if period_a != period_b {
        return Err(ProfilingError::IncompatibleProfile(format!(
            "incompatible period types {period_a:?} and {period_b:?}"
        )));
    }

    let samples_a = resolve_all(a)?;
    let samples_b = resolve_all(b)?;
    if samples_a != samples_b {
        return Err(ProfilingError::IncompatibleProfile(format!(
            "incompatible sample types {samples_a:?} and {samples_b:?}"
        )));
    }
    Ok(())
}

fn resolve<'a>(profile: &'a Profile, value_type: &ValueType) -> Result<(&'a str, &'a str)> {
    profile
        .value_type_strings(value_type)
        .ok_or_else(|| ProfilingError::InvalidProfile("value type refers to a missing string".into()))
}

fn resolve_optional<'a>(
    profile: &'a Profile,
    value_type: Option<&ValueType>,
) -> Result<Option<(&'a str, &'a str)>> {
    value_type.map(|vt| resolve(profile, vt)).transpose()
}

fn resolve_all(profile: &Profile) -> Result<Vec<(&str, &str)>> {
    profile
        .sample_types
        .iter()
        .map(|vt| resolve(profile, vt))
        .collect()
}
