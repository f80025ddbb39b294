//! Key grammar for the single logical table.
//!
//! Every record lives under a composite `(PK, SK)` primary key. The
//! partition key carries the tenant namespace prefix `{ns}/` (mandatory,
//! `default` included) and one of four record families:
//!
//! ```text
//! {ns}/ENTITY#{id}                        #META | #CONFIG#{resource} | #CONFIG#_default_
//! {ns}/BUCKET#{entity}#{resource}#{shard} #STATE
//! {ns}/RESOURCE#{resource}                #CONFIG
//! {ns}/SYSTEM#                            #CONFIG | #VERSION
//! {ns}/AUDIT#{subject}                    #AUDIT#{sortable-ts}
//! ```
//!
//! The grammar is bit-exact for compatibility with deployed data; change
//! nothing here without a schema-version bump.

use crate::error::Result;
use crate::validation;
use std::fmt;

/// Sort key of entity metadata records.
pub const SK_META: &str = "#META";
/// Sort key of bucket state records.
pub const SK_STATE: &str = "#STATE";
/// Sort key of resource- and system-level config records.
pub const SK_CONFIG: &str = "#CONFIG";
/// Sort key of the schema version record.
pub const SK_VERSION: &str = "#VERSION";
/// Pseudo-resource naming an entity-wide default config.
pub const DEFAULT_CONFIG_RESOURCE: &str = "_default_";
/// Audit subject for system-level mutations.
pub const AUDIT_SUBJECT_SYSTEM: &str = "$SYSTEM";

/// Partition-key suffix for write-sharding of hot parents. Everything
/// currently lands on shard 0.
pub const DEFAULT_SHARD: u32 = 0;

/// Attribute names that collide with store reserved words and must go
/// through expression-name aliasing in every update expression.
pub const RESERVED_ATTRIBUTES: &[&str] = &[
    "name",
    "resource",
    "action",
    "timestamp",
    "cascade",
    "ttl",
];

/// Tenant namespace applied as a prefix to every key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    /// Creates a validated namespace.
    pub fn new(ns: impl Into<String>) -> Result<Self> {
        let ns = ns.into();
        validation::validate_namespace(&ns)?;
        Ok(Self(ns))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `{ns}/ENTITY#{id}`
pub fn pk_entity(ns: &Namespace, entity_id: &str) -> String {
    format!("{ns}/ENTITY#{entity_id}")
}

/// `{ns}/BUCKET#{entity}#{resource}#{shard}`
pub fn pk_bucket(ns: &Namespace, entity_id: &str, resource: &str, shard: u32) -> String {
    format!("{ns}/BUCKET#{entity_id}#{resource}#{shard}")
}

/// `{ns}/RESOURCE#{resource}`
pub fn pk_resource(ns: &Namespace, resource: &str) -> String {
    format!("{ns}/RESOURCE#{resource}")
}

/// `{ns}/SYSTEM#`
pub fn pk_system(ns: &Namespace) -> String {
    format!("{ns}/SYSTEM#")
}

/// `{ns}/AUDIT#{subject}`
pub fn pk_audit(ns: &Namespace, subject: &str) -> String {
    format!("{ns}/AUDIT#{subject}")
}

/// `#CONFIG#{resource}`; pass [`DEFAULT_CONFIG_RESOURCE`] for the
/// entity-wide default.
pub fn sk_entity_config(resource: &str) -> String {
    format!("{SK_CONFIG}#{resource}")
}

/// `#AUDIT#{sortable-ts}`
pub fn sk_audit(sortable_ts: &str) -> String {
    format!("#AUDIT#{sortable_ts}")
}

/// `$RESOURCE:{name}`, the audit subject for resource-level mutations.
pub fn audit_subject_resource(resource: &str) -> String {
    format!("$RESOURCE:{resource}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::default()
    }

    #[test]
    fn test_default_namespace_is_prefixed() {
        assert_eq!(pk_entity(&ns(), "u1"), "default/ENTITY#u1");
    }

    #[test]
    fn test_bucket_key_grammar() {
        let ns = Namespace::new("acme").unwrap();
        assert_eq!(
            pk_bucket(&ns, "u1", "api", DEFAULT_SHARD),
            "acme/BUCKET#u1#api#0"
        );
    }

    #[test]
    fn test_config_sort_keys() {
        assert_eq!(sk_entity_config("api"), "#CONFIG#api");
        assert_eq!(
            sk_entity_config(DEFAULT_CONFIG_RESOURCE),
            "#CONFIG#_default_"
        );
    }

    #[test]
    fn test_system_and_audit_keys() {
        assert_eq!(pk_system(&ns()), "default/SYSTEM#");
        assert_eq!(
            pk_audit(&ns(), AUDIT_SUBJECT_SYSTEM),
            "default/AUDIT#$SYSTEM"
        );
        assert_eq!(audit_subject_resource("api"), "$RESOURCE:api");
        assert_eq!(
            sk_audit("2024-05-01T12:00:00.000Z#a1b2c3d4"),
            "#AUDIT#2024-05-01T12:00:00.000Z#a1b2c3d4"
        );
    }

    #[test]
    fn test_namespace_rejects_delimiters() {
        assert!(Namespace::new("a/b").is_err());
        assert!(Namespace::new("a#b").is_err());
    }
}
