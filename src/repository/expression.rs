//! Update- and condition-expression rendering for the DynamoDB backend.
//!
//! Every attribute name is routed through expression-name aliasing
//! (`#n0`, `#n1`, ...), not just the store's reserved words: limit names
//! may contain dots and dashes, which are path syntax inside expressions,
//! and a uniform alias table makes the rendering immune to both that and
//! the reserved-word list in [`crate::schema::RESERVED_ATTRIBUTES`].
//!
//! Rendering is pure string building over [`BucketWrite`] descriptors,
//! so the exact wire shapes are unit-testable without a store.

use crate::codec::{self, Attr, Item};
use crate::error::{LimiterError, Result};
use crate::limits::to_milli;
use crate::repository::BucketWrite;
use std::collections::HashMap;

/// Accumulates the alias and value tables while building expressions.
#[derive(Default)]
struct ExprBuilder {
    names: Vec<(String, String)>,
    values: Vec<(String, Attr)>,
}

impl ExprBuilder {
    /// Returns the `#n{i}` alias for an attribute name, allocating one
    /// on first use.
    fn name(&mut self, attr: &str) -> String {
        if let Some((alias, _)) = self.names.iter().find(|(_, a)| a == attr) {
            return alias.clone();
        }
        let alias = format!("#n{}", self.names.len());
        self.names.push((alias.clone(), attr.to_string()));
        alias
    }

    /// Allocates the next `:v{i}` placeholder for a value.
    fn value(&mut self, value: Attr) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.push((placeholder.clone(), value));
        placeholder
    }

    fn into_tables(self) -> (HashMap<String, String>, HashMap<String, Attr>) {
        (
            self.names.into_iter().collect(),
            self.values.into_iter().collect(),
        )
    }
}

/// A rendered `UpdateItem` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedUpdate {
    pub update_expression: String,
    pub condition_expression: Option<String>,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, Attr>,
}

/// A rendered `PutItem` call (bucket creation).
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPut {
    /// Record attributes, key attributes excluded.
    pub item: Item,
    pub condition_expression: String,
    pub names: HashMap<String, String>,
}

/// A [`BucketWrite`] in wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedWrite {
    Put(RenderedPut),
    Update(RenderedUpdate),
}

/// Renders one bucket write to its store call.
pub fn render_bucket_write(write: &BucketWrite) -> Result<RenderedWrite> {
    match write {
        BucketWrite::Create { state } => {
            let mut builder = ExprBuilder::default();
            let pk = builder.name(codec::ATTR_PK);
            let (names, _) = builder.into_tables();
            Ok(RenderedWrite::Put(RenderedPut {
                item: codec::encode_bucket_state(state),
                condition_expression: format!("attribute_not_exists({pk})"),
                names,
            }))
        }

        BucketWrite::Normal {
            expected_rf,
            new_rf,
            ttl,
            deltas,
        } => {
            let mut builder = ExprBuilder::default();
            let mut sets = Vec::new();
            let mut adds = Vec::new();

            let rf_name = builder.name(codec::ATTR_RF);
            let rf_value = builder.value(Attr::n_f64(*new_rf));
            sets.push(format!("{rf_name} = {rf_value}"));
            if let Some(ttl) = ttl {
                let ttl_name = builder.name(codec::ATTR_TTL);
                let ttl_value = builder.value(Attr::n_u64(*ttl));
                sets.push(format!("{ttl_name} = {ttl_value}"));
            }

            for (limit, delta) in deltas {
                if let Some(spec) = &delta.seed {
                    // Introduce the limit: static fields plus seeded state
                    // with the consumption already applied.
                    for (code, value) in [
                        (codec::CODE_CAPACITY, Attr::n_u64(spec.capacity)),
                        (codec::CODE_BURST, Attr::n_u64(spec.burst())),
                        (codec::CODE_REFILL_AMOUNT, Attr::n_u64(spec.refill_amount)),
                        (
                            codec::CODE_REFILL_PERIOD,
                            Attr::n_u64(spec.refill_period_secs()),
                        ),
                        (
                            codec::CODE_TOKENS,
                            Attr::n_i64(to_milli(spec.burst()) + delta.tokens_milli),
                        ),
                        (codec::CODE_TOTAL_CONSUMED, Attr::n_i64(delta.consumed_milli)),
                    ] {
                        let name = builder.name(&codec::bucket_attr(limit, code));
                        let value = builder.value(value);
                        sets.push(format!("{name} = {value}"));
                    }
                } else {
                    push_adds(&mut builder, &mut adds, limit, delta);
                }
            }

            let expected = builder.value(Attr::n_f64(*expected_rf));
            let condition = format!("{rf_name} = {expected}");

            let mut update_expression = format!("SET {}", sets.join(", "));
            if !adds.is_empty() {
                update_expression.push_str(&format!(" ADD {}", adds.join(", ")));
            }

            let (names, values) = builder.into_tables();
            Ok(RenderedWrite::Update(RenderedUpdate {
                update_expression,
                condition_expression: Some(condition),
                names,
                values,
            }))
        }

        BucketWrite::Consume { deltas } => {
            if deltas.is_empty() {
                return Err(LimiterError::storage(
                    "consumption-only write with no deltas",
                    false,
                ));
            }
            let mut builder = ExprBuilder::default();
            let mut adds = Vec::new();
            for (limit, delta) in deltas {
                push_adds(&mut builder, &mut adds, limit, delta);
            }

            let mut conditions = Vec::new();
            for (limit, delta) in deltas {
                let required = delta.required_milli();
                if required > 0 {
                    let alias = builder.name(&codec::bucket_attr(limit, codec::CODE_TOKENS));
                    let value = builder.value(Attr::n_i64(required));
                    conditions.push(format!("{alias} >= {value}"));
                }
            }

            let (names, values) = builder.into_tables();
            Ok(RenderedWrite::Update(RenderedUpdate {
                update_expression: format!("ADD {}", adds.join(", ")),
                condition_expression: if conditions.is_empty() {
                    None
                } else {
                    Some(conditions.join(" AND "))
                },
                names,
                values,
            }))
        }

        BucketWrite::Adjust { deltas } => {
            if deltas.is_empty() {
                return Err(LimiterError::storage("adjust write with no deltas", false));
            }
            let mut builder = ExprBuilder::default();
            let mut adds = Vec::new();
            for (limit, delta) in deltas {
                push_adds(&mut builder, &mut adds, limit, delta);
            }
            let (names, values) = builder.into_tables();
            Ok(RenderedWrite::Update(RenderedUpdate {
                update_expression: format!("ADD {}", adds.join(", ")),
                condition_expression: None,
                names,
                values,
            }))
        }
    }
}

/// Appends the `tk`/`tc` ADD terms for one limit.
fn push_adds(
    builder: &mut ExprBuilder,
    adds: &mut Vec<String>,
    limit: &str,
    delta: &crate::repository::LimitDelta,
) {
    if delta.tokens_milli != 0 {
        let name = builder.name(&codec::bucket_attr(limit, codec::CODE_TOKENS));
        let value = builder.value(Attr::n_i64(delta.tokens_milli));
        adds.push(format!("{name} {value}"));
    }
    if delta.consumed_milli != 0 {
        let name = builder.name(&codec::bucket_attr(limit, codec::CODE_TOTAL_CONSUMED));
        let value = builder.value(Attr::n_i64(delta.consumed_milli));
        adds.push(format!("{name} {value}"));
    }
}
