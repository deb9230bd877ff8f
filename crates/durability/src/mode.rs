//! Durability modes for the commit log
//!
//! | Mode | fsync | Loss on crash |
//! |------|-------|---------------|
//! | Cache | Never | Everything since the last checkpoint |
//! | Always | Every commit | Nothing |
//! | Standard | Periodic | Up to interval/batch |

use crate::error::DurabilityError;
use std::str::FromStr;

/// When the commit log is forced to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// No log file I/O at all; checkpoints still persist snapshots
    Cache,

    /// fsync after every commit
    Always,

    /// fsync every `batch_size` commits or every `interval_ms`
    Standard {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
        /// Maximum commits between fsyncs
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// False for Cache mode
    pub fn requires_wal(&self) -> bool {
        !matches!(self, DurabilityMode::Cache)
    }

    /// True only for Always mode
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// `Standard { interval_ms: 100, batch_size: 1000 }`
    pub fn standard_default() -> Self {
        DurabilityMode::Standard {
            interval_ms: 100,
            batch_size: 1000,
        }
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::Cache => "Cache (no commit log, data since last checkpoint lost on crash)",
            DurabilityMode::Always => "Always sync (safest, slowest)",
            DurabilityMode::Standard { .. } => "Standard (balanced speed/safety)",
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        Self::standard_default()
    }
}

impl FromStr for DurabilityMode {
    type Err = DurabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::standard_default()),
            "always" => Ok(DurabilityMode::Always),
            "cache" => Ok(DurabilityMode::Cache),
            other => Err(DurabilityError::InvalidMode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!("always".parse::<DurabilityMode>().unwrap(), DurabilityMode::Always);
        assert_eq!("cache".parse::<DurabilityMode>().unwrap(), DurabilityMode::Cache);
        assert_eq!(
            "standard".parse::<DurabilityMode>().unwrap(),
            DurabilityMode::standard_default()
        );
        assert!("fast".parse::<DurabilityMode>().is_err());
    }

    #[test]
    fn test_mode_predicates() {
        assert!(!DurabilityMode::Cache.requires_wal());
        assert!(DurabilityMode::Always.requires_immediate_fsync());
        assert!(!DurabilityMode::default().requires_immediate_fsync());
        assert!(DurabilityMode::default().requires_wal());
    }
}
