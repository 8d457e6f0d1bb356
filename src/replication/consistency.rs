//! Consistency levels and their success thresholds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Read/write consistency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// Every replica must acknowledge.
    Strong,
    /// A majority of replicas must acknowledge.
    Quorum,
    /// The primary acknowledges; the other replicas are written in the background.
    Eventual,
}

impl ConsistencyLevel {
    /// Acknowledgements required from `replicas` replicas.
    pub fn required_acks(&self, replicas: usize) -> usize {
        match self {
            ConsistencyLevel::Strong => replicas,
            ConsistencyLevel::Quorum => quorum_size(replicas),
            ConsistencyLevel::Eventual => 1.min(replicas),
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyLevel::Strong => "strong",
            ConsistencyLevel::Quorum => "quorum",
            ConsistencyLevel::Eventual => "eventual",
        }
    }
}

/// Majority of `replicas`: `floor(n / 2) + 1`.
pub fn quorum_size(replicas: usize) -> usize {
    replicas / 2 + 1
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsistencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strong" => Ok(ConsistencyLevel::Strong),
            "quorum" => Ok(ConsistencyLevel::Quorum),
            "eventual" => Ok(ConsistencyLevel::Eventual),
            other => Err(Error::Config(format!(
                "unknown consistency level {:?}, expected strong, quorum or eventual",
                other
            ))),
        }
    }
}
