// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backend::ProfilingBackend;
use crate::error::{ProfilingError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Process-wide sampling knobs of the host runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ProfileVariable {
    /// Average number of allocated bytes between two heap samples.
    MemProfileRate,
    /// One out of this many mutex contention events is reported.
    MutexProfileFraction,
    /// Nanoseconds spent blocked between two block samples.
    BlockProfileRate,
}

impl ProfileVariable {
    pub const ALL: [ProfileVariable; 3] = [
        ProfileVariable::MemProfileRate,
        ProfileVariable::MutexProfileFraction,
        ProfileVariable::BlockProfileRate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProfileVariable::MemProfileRate => "MemProfileRate",
            ProfileVariable::MutexProfileFraction => "MutexProfileFraction",
            ProfileVariable::BlockProfileRate => "BlockProfileRate",
        }
    }
}

impl fmt::Display for ProfileVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProfileVariable {
    type Err = ProfilingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memprofilerate" | "alloc-rate" => Ok(ProfileVariable::MemProfileRate),
            "mutexprofilefraction" | "mutex-fraction" => Ok(ProfileVariable::MutexProfileFraction),
            "blockprofilerate" | "block-rate" => Ok(ProfileVariable::BlockProfileRate),
            _ => Err(ProfilingError::UnknownVariable(s.to_owned())),
        }
    }
}

struct Values {
    defaults: HashMap<ProfileVariable, i64>,
    current: HashMap<ProfileVariable, i64>,
}

impl Values {
    fn default_of(&self, variable: ProfileVariable) -> Result<i64> {
        self.defaults
            .get(&variable)
            .copied()
            .ok_or_else(|| ProfilingError::UnknownVariable(variable.to_string()))
    }

    fn apply(
        &mut self,
        backend: &dyn ProfilingBackend,
        variable: ProfileVariable,
        value: i64,
    ) -> Result<i64> {
        let previous = self
            .current
            .insert(variable, value)
            .ok_or_else(|| ProfilingError::UnknownVariable(variable.to_string()))?;
        backend.set_variable(variable, value);
        Ok(previous)
    }
}

/// Current values of every [ProfileVariable], together with the process
/// defaults captured the first time the registry is initialized.
///
/// Defaults are captured exactly once; `reset` always goes back to them, no
/// matter how the runtime values changed in between.
#[derive(Default)]
pub struct VariableRegistry {
    values: Mutex<Option<Values>>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry initialized from the backend's current values.
    pub fn capture(backend: &dyn ProfilingBackend) -> Self {
        let registry = Self::new();
        *registry.values.lock() = Some(Self::read_all(backend));
        registry
    }

    fn read_all(backend: &dyn ProfilingBackend) -> Values {
        let defaults: HashMap<_, _> = ProfileVariable::ALL
            .iter()
            .map(|variable| (*variable, backend.variable(*variable)))
            .collect();
        Values {
            current: defaults.clone(),
            defaults,
        }
    }

    pub fn initialize(&self, backend: &dyn ProfilingBackend) -> Result<()> {
        let mut values = self.values.lock();
        if values.is_some() {
            return Err(ProfilingError::AlreadyInitialized);
        }
        *values = Some(Self::read_all(backend));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.values.lock().is_some()
    }

    pub fn get(&self, variable: ProfileVariable) -> Result<i64> {
        let values = self.values.lock();
        let values = values.as_ref().ok_or(ProfilingError::NotInitialized)?;
        values
            .current
            .get(&variable)
            .copied()
            .ok_or_else(|| ProfilingError::UnknownVariable(variable.to_string()))
    }

    pub fn default_value(&self, variable: ProfileVariable) -> Result<i64> {
        let values = self.values.lock();
        values
            .as_ref()
            .ok_or(ProfilingError::NotInitialized)?
            .default_of(variable)
    }

    /// Applies `value` to the runtime and returns the value it replaced.
    pub fn set(
        &self,
        backend: &dyn ProfilingBackend,
        variable: ProfileVariable,
        value: i64,
    ) -> Result<i64> {
        let mut values = self.values.lock();
        let values = values.as_mut().ok_or(ProfilingError::NotInitialized)?;
        values.apply(backend, variable, value)
    }

    /// Restores the captured default and returns it.
    pub fn reset(&self, backend: &dyn ProfilingBackend, variable: ProfileVariable) -> Result<i64> {
        let mut values = self.values.lock();
        let values = values.as_mut().ok_or(ProfilingError::NotInitialized)?;
        let default = values.default_of(variable)?;
        values.apply(backend, variable, default)?;
        Ok(default)
    }
}
