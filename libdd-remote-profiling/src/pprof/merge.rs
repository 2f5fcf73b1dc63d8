// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{check_compatible, Function, Label, Line, Location, Mapping, Profile, Sample, ValueType};
use crate::error::{ProfilingError, Result};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::hash::BuildHasherDefault;

type Hasher = BuildHasherDefault<rustc_hash::FxHasher>;
type FxIndexSet<K> = IndexSet<K, Hasher>;
type FxIndexMap<K, V> = IndexMap<K, V, Hasher>;

/// Merges compatible profiles into a single one.
///
/// Every profile is checked against the first one with [check_compatible]
/// before anything is combined. String tables, mappings, functions and
/// locations are deduplicated; samples with the same stack and the same
/// labels are folded together by summing their values. Samples whose values
/// are all zero are dropped.
pub fn merge(profiles: &[Profile]) -> Result<Profile> {
    let Some((first, rest)) = profiles.split_first() else {
        return Err(ProfilingError::InvalidProfile("no profiles to merge".into()));
    };
    for other in rest {
        check_compatible(first, other)?;
    }

    let mut merger = Merger::new();
    for profile in profiles {
        merger.add(profile)?;
    }
    Ok(merger.finish())
}

#[derive(Eq, PartialEq, Hash)]
struct SampleKey {
    location_ids: Vec<u64>,
    labels: Vec<Label>,
}

/// Accumulates profiles. Ids in the key sets are already translated to the
/// merged string table, and the final id of an entry is its index + 1.
struct Merger {
    strings: FxIndexSet<String>,
    mappings: FxIndexSet<Mapping>,
    functions: FxIndexSet<Function>,
    locations: FxIndexSet<Location>,
    samples: FxIndexMap<SampleKey, Vec<i64>>,
    comments: FxIndexSet<i64>,
    header: Option<Header>,
    time_nanos: i64,
    duration_nanos: i64,
    period: i64,
    default_sample_type: i64,
}

struct Header {
    sample_types: Vec<ValueType>,
    period_type: Option<ValueType>,
    drop_frames: i64,
    keep_frames: i64,
}

fn translate(ids: &HashMap<u64, u64>, id: u64, what: &str) -> Result<u64> {
    if id == 0 {
        return Ok(0);
    }
    ids.get(&id)
        .copied()
        .ok_or_else(|| ProfilingError::InvalidProfile(format!("unknown {what} id {id}")))
}

fn entry_id(index: usize) -> u64 {
    index as u64 + 1
}

impl Merger {
    fn new() -> Self {
        let mut strings = FxIndexSet::default();
        strings.insert(String::new());
        Self {
            strings,
            mappings: Default::default(),
            functions: Default::default(),
            locations: Default::default(),
            samples: Default::default(),
            comments: Default::default(),
            header: None,
            time_nanos: 0,
            duration_nanos: 0,
            period: 0,
            default_sample_type: 0,
        }
    }

    fn intern(&mut self, s: &str) -> i64 {
        let index = match self.strings.get_index_of(s) {
            Some(index) => index,
            None => self.strings.insert_full(s.to_owned()).0,
        };
        index as i64
    }

    fn add(&mut self, profile: &Profile) -> Result<()> {
        let string_ids: Vec<i64> = profile
            .string_table
            .iter()
            .map(|s| self.intern(s))
            .collect();
        let string = |id: i64| -> Result<i64> {
            usize::try_from(id)
                .ok()
                .and_then(|index| string_ids.get(index).copied())
                .ok_or_else(|| {
                    ProfilingError::InvalidProfile(format!("string index {id} out of range"))
                })
        };
        let value_type = |vt: &ValueType| -> Result<ValueType> {
            Ok(ValueType {
                r#type: string(vt.r#type)?,
                unit: string(vt.unit)?,
            })
        };

        if self.header.is_none() {
            self.header = Some(Header {
                sample_types: profile
                    .sample_types
                    .iter()
                    .map(value_type)
                    .collect::<Result<_>>()?,
                period_type: profile.period_type.as_ref().map(value_type).transpose()?,
                drop_frames: string(profile.drop_frames)?,
                keep_frames: string(profile.keep_frames)?,
            });
        }
        if profile.time_nanos != 0 && (self.time_nanos == 0 || profile.time_nanos < self.time_nanos)
        {
            self.time_nanos = profile.time_nanos;
        }
        self.duration_nanos = self.duration_nanos.saturating_add(profile.duration_nanos);
        self.period = self.period.max(profile.period);
        for comment in &profile.comment {
            self.comments.insert(string(*comment)?);
        }
        if self.default_sample_type == 0 {
            self.default_sample_type = string(profile.default_sample_type)?;
        }

        let mut mapping_ids = HashMap::with_capacity(profile.mappings.len());
        for mapping in &profile.mappings {
            let key = Mapping {
                id: 0,
                filename: string(mapping.filename)?,
                build_id: string(mapping.build_id)?,
                ..*mapping
            };
            let (index, _) = self.mappings.insert_full(key);
            mapping_ids.insert(mapping.id, entry_id(index));
        }

        let mut function_ids = HashMap::with_capacity(profile.functions.len());
        for function in &profile.functions {
            let key = Function {
                id: 0,
                name: string(function.name)?,
                system_name: string(function.system_name)?,
                filename: string(function.filename)?,
                start_line: function.start_line,
            };
            let (index, _) = self.functions.insert_full(key);
            function_ids.insert(function.id, entry_id(index));
        }

        let mut location_ids = HashMap::with_capacity(profile.locations.len());
        for location in &profile.locations {
            let lines = location
                .lines
                .iter()
                .map(|line| {
                    Ok(Line {
                        function_id: translate(&function_ids, line.function_id, "function")?,
                        line: line.line,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let key = Location {
                id: 0,
                mapping_id: translate(&mapping_ids, location.mapping_id, "mapping")?,
                address: location.address,
                lines,
                is_folded: location.is_folded,
            };
            let (index, _) = self.locations.insert_full(key);
            location_ids.insert(location.id, entry_id(index));
        }

        let width = profile.sample_types.len();
        for sample in &profile.samples {
            if sample.values.iter().all(|v| *v == 0) {
                continue;
            }
            if sample.values.len() != width {
                return Err(ProfilingError::InvalidProfile(format!(
                    "sample has {} values but the profile has {width} sample types",
                    sample.values.len()
                )));
            }
            let location_ids = sample
                .location_ids
                .iter()
                .map(|id| translate(&location_ids, *id, "location"))
                .collect::<Result<Vec<_>>>()?;
            let mut labels = sample
                .labels
                .iter()
                .map(|label| {
                    Ok(Label {
                        key: string(label.key)?,
                        str: string(label.str)?,
                        num: label.num,
                        num_unit: string(label.num_unit)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            labels.sort_unstable();

            let values = self
                .samples
                .entry(SampleKey {
                    location_ids,
                    labels,
                })
                .or_insert_with(|| vec![0; width]);
            for (total, value) in values.iter_mut().zip(&sample.values) {
                *total = total.saturating_add(*value);
            }
        }
        Ok(())
    }

    fn finish(self) -> Profile {
        let header = self.header.unwrap_or(Header {
            sample_types: Vec::new(),
            period_type: None,
            drop_frames: 0,
            keep_frames: 0,
        });
        Profile {
            sample_types: header.sample_types,
            samples: self
                .samples
                .into_iter()
                .filter(|(_, values)| values.iter().any(|v| *v != 0))
                .map(|(key, values)| Sample {
                    location_ids: key.location_ids,
                    values,
                    labels: key.labels,
                })
                .collect(),
            mappings: self
                .mappings
                .into_iter()
                .enumerate()
                .map(|(index, mapping)| Mapping {
                    id: entry_id(index),
                    ..mapping
                })
                .collect(),
            locations: self
                .locations
                .into_iter()
                .enumerate()
                .map(|(index, location)| Location {
                    id: entry_id(index),
                    ..location
                })
                .collect(),
            functions: self
                .functions
                .into_iter()
                .enumerate()
                .map(|(index, function)| Function {
                    id: entry_id(index),
                    ..function
                })
                .collect(),
            string_table: self.strings.into_iter().collect(),
            drop_frames: header.drop_frames,
            keep_frames: header.keep_frames,
            time_nanos: self.time_nanos,
            duration_nanos: self.duration_nanos,
            period_type: header.period_type,
            period: self.period,
            comment: self.comments.into_iter().collect(),
            default_sample_type: self.default_sample_type,
        }
    }
}
