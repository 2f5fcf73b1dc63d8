// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Message types for the [`profiles`] protobuf format, as emitted by the
//! host-runtime profilers whose output is collected remotely.
//!
//! The structs are written by hand rather than generated, so there is no
//! build step. Every field that refers to a string is an index into
//! [Profile::string_table], where index 0 is always the empty string.
//!
//! [`profiles`]: https://github.com/google/pprof/blob/main/proto/profile.proto

mod prost_impls;

pub use prost_impls::*;

impl Profile {
    /// Resolves a string table index. Returns `None` for negative or
    /// out-of-range indices.
    pub fn string(&self, id: i64) -> Option<&str> {
        let index = usize::try_from(id).ok()?;
        self.string_table.get(index).map(String::as_str)
    }

    /// Resolves the `(type, unit)` strings of a value type.
    pub fn value_type_strings(&self, value_type: &ValueType) -> Option<(&str, &str)> {
        Some((self.string(value_type.r#type)?, self.string(value_type.unit)?))
    }

    /// Sum of the values of every sample, per sample type.
    pub fn value_totals(&self) -> Vec<i64> {
        let mut totals = vec![0i64; self.sample_types.len()];
        for sample in &self.samples {
            for (total, value) in totals.iter_mut().zip(&sample.values) {
                *total = total.saturating_add(*value);
            }
        }
        totals
    }
}
