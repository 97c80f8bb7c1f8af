//! Resource limits applied to every sandboxed execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{Validate, ValidationResult};

/// Resource ceilings and isolation switches for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard memory ceiling in bytes.
    #[serde(default = "default_memory_cap")]
    pub memory_cap: u64,

    /// Whether the code may reach the network. Must be false for untrusted code.
    #[serde(default)]
    pub network_enabled: bool,

    /// Whether the code may gain privileges. Must be false.
    #[serde(default)]
    pub elevate_privileges: bool,

    /// Wall-clock budget after which the code is killed.
    #[serde(
        default = "default_wall_clock_timeout",
        rename = "wall_clock_timeout_ms",
        with = "millis"
    )]
    pub wall_clock_timeout: Duration,
}

fn default_memory_cap() -> u64 {
    128 * 1024 * 1024
}

fn default_wall_clock_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_cap: default_memory_cap(),
            network_enabled: false,
            elevate_privileges: false,
            wall_clock_timeout: default_wall_clock_timeout(),
        }
    }
}

impl ResourceLimits {
    /// Sets the memory ceiling.
    pub fn with_memory_cap(mut self, bytes: u64) -> Self {
        self.memory_cap = bytes;
        self
    }

    /// Sets the wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wall_clock_timeout = timeout;
        self
    }

    /// Memory ceiling in KiB, rounded up.
    pub fn memory_cap_kib(&self) -> u64 {
        self.memory_cap.div_ceil(1024)
    }
}

const MIN_MEMORY_CAP: u64 = 4 * 1024 * 1024;

impl Validate for ResourceLimits {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.network_enabled {
            result.add_error("network_enabled must be false for untrusted code");
        }

        if self.elevate_privileges {
            result.add_error("elevate_privileges must be false for untrusted code");
        }

        if self.memory_cap < MIN_MEMORY_CAP {
            result.add_error(format!(
                "memory_cap of {} bytes is below the {} byte minimum",
                self.memory_cap, MIN_MEMORY_CAP
            ));
        }

        if self.wall_clock_timeout.is_zero() {
            result.add_error("wall_clock_timeout must be greater than zero");
        } else if self.wall_clock_timeout > Duration::from_secs(600) {
            result.add_warning("wall_clock_timeout over 10 minutes may stall the pipeline");
        }

        result
    }
}

/// Serializes a `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_satisfy_policy() {
        let limits = ResourceLimits::default();

        assert_eq!(limits.memory_cap, 128 * 1024 * 1024);
        assert!(!limits.network_enabled);
        assert!(!limits.elevate_privileges);
        assert_eq!(limits.wall_clock_timeout, Duration::from_secs(30));
        assert!(limits.validate().is_valid());
    }

    #[test]
    fn network_and_privileges_are_policy_errors() {
        let limits = ResourceLimits {
            network_enabled: true,
            elevate_privileges: true,
            ..Default::default()
        };

        let result = limits.validate();
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("network_enabled"));
        assert!(result.errors[1].contains("elevate_privileges"));
    }

    #[test]
    fn tiny_memory_and_zero_timeout_are_rejected() {
        let limits = ResourceLimits::default()
            .with_memory_cap(1024)
            .with_timeout(Duration::ZERO);

        let result = limits.validate();
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn memory_cap_kib_rounds_up() {
        let limits = ResourceLimits::default().with_memory_cap(4 * 1024 * 1024 + 1);
        assert_eq!(limits.memory_cap_kib(), 4097);
    }

    #[test]
    fn timeout_round_trips_through_toml_as_millis() {
        let limits: ResourceLimits = toml::from_str("wall_clock_timeout_ms = 250").unwrap();
        assert_eq!(limits.wall_clock_timeout, Duration::from_millis(250));
        assert_eq!(limits.memory_cap, 128 * 1024 * 1024);

        let rendered = toml::to_string(&limits).unwrap();
        assert!(rendered.contains("wall_clock_timeout_ms = 250"));
    }
}
