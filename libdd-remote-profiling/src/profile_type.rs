// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ProfilingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every profile type that can be requested. Each one is its own cache key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProfileType {
    Heap,
    Mutex,
    Block,
    ThreadCreate,
    Goroutine,
    Cpu,
    Trace,
}

/// Profile types captured as an instantaneous snapshot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LookupProfile {
    Heap,
    Mutex,
    Block,
    ThreadCreate,
    Goroutine,
}

/// Profile types collected over a time window.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DurationProfile {
    Cpu,
    Trace,
}

impl ProfileType {
    pub const ALL: [ProfileType; 7] = [
        ProfileType::Heap,
        ProfileType::Mutex,
        ProfileType::Block,
        ProfileType::ThreadCreate,
        ProfileType::Goroutine,
        ProfileType::Cpu,
        ProfileType::Trace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProfileType::Heap => "heap",
            ProfileType::Mutex => "mutex",
            ProfileType::Block => "block",
            ProfileType::ThreadCreate => "threadcreate",
            ProfileType::Goroutine => "goroutine",
            ProfileType::Cpu => "cpu",
            ProfileType::Trace => "trace",
        }
    }

    pub fn is_duration_bound(self) -> bool {
        DurationProfile::try_from(self).is_ok()
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProfileType {
    type Err = ProfilingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heap" | "memory" => Ok(ProfileType::Heap),
            "mutex" => Ok(ProfileType::Mutex),
            "block" => Ok(ProfileType::Block),
            "threadcreate" | "thread-create" => Ok(ProfileType::ThreadCreate),
            "goroutine" | "go-routine" => Ok(ProfileType::Goroutine),
            "cpu" => Ok(ProfileType::Cpu),
            "trace" => Ok(ProfileType::Trace),
            _ => Err(ProfilingError::UnknownProfileType(s.to_owned())),
        }
    }
}

impl From<LookupProfile> for ProfileType {
    fn from(profile: LookupProfile) -> Self {
        match profile {
            LookupProfile::Heap => ProfileType::Heap,
            LookupProfile::Mutex => ProfileType::Mutex,
            LookupProfile::Block => ProfileType::Block,
            LookupProfile::ThreadCreate => ProfileType::ThreadCreate,
            LookupProfile::Goroutine => ProfileType::Goroutine,
        }
    }
}

impl From<DurationProfile> for ProfileType {
    fn from(profile: DurationProfile) -> Self {
        match profile {
            DurationProfile::Cpu => ProfileType::Cpu,
            DurationProfile::Trace => ProfileType::Trace,
        }
    }
}

impl TryFrom<ProfileType> for LookupProfile {
    type Error = ProfilingError;

    fn try_from(profile: ProfileType) -> Result<Self, Self::Error> {
        match profile {
            ProfileType::Heap => Ok(LookupProfile::Heap),
            ProfileType::Mutex => Ok(LookupProfile::Mutex),
            ProfileType::Block => Ok(LookupProfile::Block),
            ProfileType::ThreadCreate => Ok(LookupProfile::ThreadCreate),
            ProfileType::Goroutine => Ok(LookupProfile::Goroutine),
            other => Err(ProfilingError::UnknownProfileType(format!(
                "{other} is not a snapshot profile"
            ))),
        }
    }
}

impl TryFrom<ProfileType> for DurationProfile {
    type Error = ProfilingError;

    fn try_from(profile: ProfileType) -> Result<Self, Self::Error> {
        match profile {
            ProfileType::Cpu => Ok(DurationProfile::Cpu),
            ProfileType::Trace => Ok(DurationProfile::Trace),
            other => Err(ProfilingError::UnknownProfileType(format!(
                "{other} is not a duration-bound profile"
            ))),
        }
    }
}

impl fmt::Display for LookupProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ProfileType::from(*self).fmt(f)
    }
}

impl fmt::Display for DurationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ProfileType::from(*self).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn names_and_aliases() {
        for profile in ProfileType::ALL {
            assert_eq!(profile, profile.name().parse().unwrap());
        }
        assert_eq!(ProfileType::Heap, "Memory".parse().unwrap());
        assert_eq!(ProfileType::ThreadCreate, "thread-create".parse().unwrap());
        assert_eq!(ProfileType::Goroutine, "GoRoutine".parse().unwrap());

        let err = "allocs".parse::<ProfileType>().unwrap_err();
        assert_eq!(ErrorCode::UnknownProfileType, err.code());
    }

    #[test]
    fn families_are_disjoint() {
        for profile in ProfileType::ALL {
            let lookup = LookupProfile::try_from(profile).is_ok();
            let duration = DurationProfile::try_from(profile).is_ok();
            assert!(lookup ^ duration, "{profile} must belong to exactly one family");
            assert_eq!(duration, profile.is_duration_bound());
        }
    }

    #[test]
    fn wrong_family_is_unknown_type() {
        let err = DurationProfile::try_from(ProfileType::Heap).unwrap_err();
        assert_eq!(ErrorCode::UnknownProfileType, err.code());
        let err = LookupProfile::try_from(ProfileType::Cpu).unwrap_err();
        assert_eq!(ErrorCode::UnknownProfileType, err.code());
    }
}
