//! Identifier validation.
//!
//! The `#` delimiter is structural in every partition and sort key, so it
//! is forbidden in all identifiers to prevent key-pattern injection.

use crate::error::{LimiterError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static ENTITY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-:@]{0,255}$").unwrap());

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.\-]{0,63}$").unwrap());

static NAMESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]{0,63}$").unwrap());

/// Validates an entity (or parent) identifier.
pub fn validate_entity_id(id: &str) -> Result<()> {
    if ENTITY_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(LimiterError::Validation(format!(
            "invalid entity id '{id}': must match [a-zA-Z0-9][a-zA-Z0-9_.\\-:@]{{0,255}}"
        )))
    }
}

/// Validates a resource name.
pub fn validate_resource(resource: &str) -> Result<()> {
    if NAME_RE.is_match(resource) {
        Ok(())
    } else {
        Err(LimiterError::Validation(format!(
            "invalid resource name '{resource}': must match [a-zA-Z][a-zA-Z0-9_.\\-]{{0,63}}"
        )))
    }
}

/// Validates a limit name.
pub fn validate_limit_name(limit: &str) -> Result<()> {
    if NAME_RE.is_match(limit) {
        Ok(())
    } else {
        Err(LimiterError::Validation(format!(
            "invalid limit name '{limit}': must match [a-zA-Z][a-zA-Z0-9_.\\-]{{0,63}}"
        )))
    }
}

/// Validates a tenant namespace identifier.
pub fn validate_namespace(ns: &str) -> Result<()> {
    if NAMESPACE_RE.is_match(ns) {
        Ok(())
    } else {
        Err(LimiterError::Validation(format!(
            "invalid namespace '{ns}': must match [a-zA-Z0-9][a-zA-Z0-9_.\\-]{{0,63}}"
        )))
    }
}
