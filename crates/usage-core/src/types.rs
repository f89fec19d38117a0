//! Core type definitions with validation.

use std::fmt;
use std::iter::Sum;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// Invalid causality policy value.
    #[error("invalid causality policy: {value}")]
    InvalidCausalityPolicy { value: String },

    /// Invalid roll-up policy value.
    #[error("invalid rollup policy: {value}")]
    InvalidRollupPolicy { value: String },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated instance identifier.
    InstanceId, "instance ID"
);

define_string_id!(
    /// A validated allocation source identifier.
    ///
    /// Instances start out charged to [`AllocationSourceId::unattributed`]
    /// until their first allocation change.
    AllocationSourceId, "allocation source ID"
);

define_string_id!(
    /// A validated username (the creator of an instance).
    Username, "username"
);

/// Bucket name for time accrued before an instance has an allocation source.
pub const UNATTRIBUTED: &str = "unattributed";

impl AllocationSourceId {
    /// The sentinel source new instances are charged to.
    pub fn unattributed() -> Self {
        Self(UNATTRIBUTED.to_string())
    }

    /// Returns true for the sentinel source.
    pub fn is_unattributed(&self) -> bool {
        self.0 == UNATTRIBUTED
    }
}

/// Accumulated active time, in whole microseconds.
///
/// `cpu_us` weights each interval by the core count the instance had during
/// that interval, so resizes are accounted for exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Usage {
    /// Wall-clock time spent active.
    pub active_us: i64,
    /// Active time multiplied by the instance's core count.
    pub cpu_us: i64,
}

impl Usage {
    pub const ZERO: Self = Self {
        active_us: 0,
        cpu_us: 0,
    };

    /// Usage for one active interval of `elapsed_us` on `size_cpu` cores.
    pub fn for_interval(elapsed_us: i64, size_cpu: u32) -> Self {
        Self {
            active_us: elapsed_us,
            cpu_us: elapsed_us.saturating_mul(i64::from(size_cpu)),
        }
    }

    pub const fn is_zero(self) -> bool {
        self.active_us == 0 && self.cpu_us == 0
    }

    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self {
            active_us: self.active_us.saturating_sub(other.active_us),
            cpu_us: self.cpu_us.saturating_sub(other.cpu_us),
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.active_us = self.active_us.saturating_add(rhs.active_us);
        self.cpu_us = self.cpu_us.saturating_add(rhs.cpu_us);
    }
}

impl Sum for Usage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |mut total, usage| {
            total += usage;
            total
        })
    }
}

impl<'a> Sum<&'a Self> for Usage {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// What to do with an allocation change older than the instance's last update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalityPolicy {
    /// Abort the run.
    #[default]
    Fail,
    /// Count the event in `causality_skipped` and drop it.
    ///
    /// This changes accounting results: the skipped switch never happens.
    CountAndSkip,
}

impl CausalityPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::CountAndSkip => "count_and_skip",
        }
    }
}

impl fmt::Display for CausalityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CausalityPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "count_and_skip" => Ok(Self::CountAndSkip),
            _ => Err(ValidationError::InvalidCausalityPolicy {
                value: s.to_string(),
            }),
        }
    }
}

/// How instance usage is rolled forward into user totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupPolicy {
    /// Add only what accrued since the last roll-forward of each
    /// (instance, allocation source) pair. User totals equal instance totals.
    #[default]
    Delta,
    /// Add the whole cumulative bucket of the pre-change allocation source on
    /// every status change out of an active state. Allocation changes and
    /// ticks roll nothing forward. Over-counts instances with more than one
    /// such change; kept for comparing against old reports.
    CumulativeLegacy,
}

impl RollupPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::CumulativeLegacy => "cumulative_legacy",
        }
    }
}

impl fmt::Display for RollupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RollupPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delta" => Ok(Self::Delta),
            "cumulative_legacy" => Ok(Self::CumulativeLegacy),
            _ => Err(ValidationError::InvalidRollupPolicy {
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_rejects_empty() {
        assert!(InstanceId::new("").is_err());
        assert!(InstanceId::new("1234").is_ok());
    }

    #[test]
    fn allocation_source_id_serde_rejects_empty() {
        let result: Result<AllocationSourceId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());

        let parsed: AllocationSourceId = serde_json::from_str("\"TG-ASC160018\"").unwrap();
        assert_eq!(parsed.as_str(), "TG-ASC160018");
    }

    #[test]
    fn unattributed_sentinel() {
        let id = AllocationSourceId::unattributed();
        assert!(id.is_unattributed());
        assert_eq!(id.to_string(), "unattributed");
        assert!(!AllocationSourceId::new("TG-BIO160058").unwrap().is_unattributed());
    }

    #[test]
    fn usage_for_interval_weights_cpu() {
        let usage = Usage::for_interval(3_600_000_000, 4);
        assert_eq!(usage.active_us, 3_600_000_000);
        assert_eq!(usage.cpu_us, 14_400_000_000);

        let idle_size = Usage::for_interval(1_000, 0);
        assert_eq!(idle_size.cpu_us, 0);
    }

    #[test]
    fn usage_sum_and_sub() {
        let parts = [Usage::for_interval(10, 2), Usage::for_interval(5, 1)];
        let total: Usage = parts.iter().sum();
        assert_eq!(
            total,
            Usage {
                active_us: 15,
                cpu_us: 25
            }
        );
        assert_eq!(total.saturating_sub(parts[0]), parts[1]);
        assert!(Usage::ZERO.is_zero());
    }

    #[test]
    fn policies_parse_and_display() {
        assert_eq!(
            "count_and_skip".parse::<CausalityPolicy>().unwrap(),
            CausalityPolicy::CountAndSkip
        );
        assert_eq!(CausalityPolicy::default().as_str(), "fail");
        assert!("skip".parse::<CausalityPolicy>().is_err());

        assert_eq!(
            "cumulative_legacy".parse::<RollupPolicy>().unwrap(),
            RollupPolicy::CumulativeLegacy
        );
        assert_eq!(RollupPolicy::default().to_string(), "delta");
        assert!("sum".parse::<RollupPolicy>().is_err());
    }

    #[test]
    fn policies_serde_snake_case() {
        let json = serde_json::to_string(&RollupPolicy::CumulativeLegacy).unwrap();
        assert_eq!(json, "\"cumulative_legacy\"");
        let parsed: CausalityPolicy = serde_json::from_str("\"count_and_skip\"").unwrap();
        assert_eq!(parsed, CausalityPolicy::CountAndSkip);
    }
}
