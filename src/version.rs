//! Schema version record and client compatibility check.
//!
//! The `#VERSION` record under the system partition pins the table's
//! schema version and the minimum client allowed to touch it. Clients
//! read it on startup; a mismatch is fatal before any traffic flows.

use crate::error::{LimiterError, Result};
use serde::{Deserialize, Serialize};

/// Table schema version written by this client generation (composite
/// bucket layout).
pub const SCHEMA_VERSION: u32 = 2;

/// The `#VERSION` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub schema_version: u32,
    /// Minimum client crate version allowed, semver.
    pub min_client_version: String,
    pub updated_by: Option<String>,
    /// ISO-8601 UTC timestamp of the last update.
    pub updated_at: String,
}

impl VersionRecord {
    /// The record a fresh provisioning run writes.
    pub fn current(updated_by: Option<&str>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            min_client_version: env!("CARGO_PKG_VERSION").to_string(),
            updated_by: updated_by.map(str::to_string),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Checks this stored record against the running client.
    pub fn check_compatibility(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(LimiterError::VersionMismatch(format!(
                "table schema version {} does not match client schema version {}",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        let client = parse_semver(env!("CARGO_PKG_VERSION"));
        let required = parse_semver(&self.min_client_version);
        if client < required {
            return Err(LimiterError::VersionMismatch(format!(
                "client version {} is below the table's minimum client version {}",
                env!("CARGO_PKG_VERSION"),
                self.min_client_version
            )));
        }
        Ok(())
    }
}

/// Lenient semver triple parse; missing or malformed parts read as 0.
fn parse_semver(v: &str) -> (u64, u64, u64) {
    let mut parts = v.split('.').map(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u64>()
            .unwrap_or(0)
    });
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
