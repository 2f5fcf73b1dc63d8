// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ProfilingError, Result};
use crate::pprof::{self, Profile};
use crate::profile_type::ProfileType;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// What [ProfileStore::put] did with the incoming profile.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    /// Nothing was cached for the type yet.
    Inserted,
    /// The profile was merged into the cached one.
    Merged,
    /// The cached profile was incompatible. The whole cache was dropped and
    /// the profile is now its only entry.
    Replaced,
}

/// Keeps at most one merged profile per [ProfileType].
#[derive(Default)]
pub struct ProfileStore {
    profiles: Mutex<HashMap<ProfileType, Profile>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, profile_type: ProfileType, profile: Profile) -> Result<PutOutcome> {
        let mut profiles = self.profiles.lock();
        let Some(cached) = profiles.remove(&profile_type) else {
            profiles.insert(profile_type, profile);
            debug!(%profile_type, "cached new profile");
            return Ok(PutOutcome::Inserted);
        };

        let pair = [cached, profile];
        match pprof::merge(&pair) {
            Ok(merged) => {
                profiles.insert(profile_type, merged);
                debug!(%profile_type, "merged profile into cache");
                Ok(PutOutcome::Merged)
            }
            Err(ProfilingError::IncompatibleProfile(reason)) => {
                warn!(
                    %profile_type,
                    dropped = profiles.len() + 1,
                    "clearing the profile cache: {reason}"
                );
                let [_, profile] = pair;
                profiles.clear();
                profiles.insert(profile_type, profile);
                Ok(PutOutcome::Replaced)
            }
            Err(e) => {
                let [cached, _] = pair;
                profiles.insert(profile_type, cached);
                Err(e)
            }
        }
    }

    pub fn get(&self, profile_type: ProfileType) -> Result<Profile> {
        self.profiles
            .lock()
            .get(&profile_type)
            .cloned()
            .ok_or(ProfilingError::NotFound(profile_type))
    }

    pub fn clear(&self) {
        self.profiles.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.lock().is_empty()
    }

    pub fn profile_types(&self) -> Vec<ProfileType> {
        let mut types: Vec<_> = self.profiles.lock().keys().copied().collect();
        types.sort();
        types
    }
}
