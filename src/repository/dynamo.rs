//! DynamoDB repository: the production backend.
//!
//! Single-table layout over composite `(PK, SK)` keys, exactly as the
//! key grammar in [`crate::schema`] spells. The four bucket write paths
//! map onto `PutItem`/`UpdateItem` with condition expressions rendered
//! by [`crate::repository::expression`]; acquire reads use
//! `BatchGetItem` (eventually consistent: the config cache already
//! accepts staleness and token state self-corrects through atomic
//! `ADD`), and cascade writes ride `TransactWriteItems`.
//!
//! Two global secondary indexes are assumed on the table:
//!
//! | Index          | Partition key | Use                               |
//! |----------------|---------------|-----------------------------------|
//! | `parent-index` | `parent_id`   | `get_children`                    |
//! | `entity-index` | `entity_id`   | bucket discovery on entity delete |
//!
//! Store errors are classified into {conditional check failed,
//! retryable transient, fatal}; transients go through the bounded
//! jittered backoff in [`crate::retry`].

use crate::audit::{AuditAction, AuditEvent};
use crate::bucket::{now_unix, BucketState};
use crate::cache::DEFAULT_CACHE_TTL;
use crate::codec::{self, Attr, Item};
use crate::config::{ConfigLevel, LimitConfig, Resolution};
use crate::entity::Entity;
use crate::error::{LimiterError, Result};
use crate::repository::expression::{render_bucket_write, RenderedWrite};
use crate::repository::{BucketKey, BucketWrite, RepoCaches, Repository};
use crate::retry::RetryPolicy;
use crate::schema::{self, Namespace};
use crate::version::VersionRecord;
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, KeysAndAttributes, Put, TransactWriteItem, Update, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable naming a custom store endpoint (DynamoDB Local
/// and compatible stores).
pub const ENV_ENDPOINT_URL: &str = "TOKENGATE_ENDPOINT_URL";

/// Default table name.
pub const DEFAULT_TABLE_NAME: &str = "tokengate";

/// GSI on `parent_id`, serving `get_children`.
pub const PARENT_INDEX: &str = "parent-index";
/// GSI on `entity_id`, serving cascade deletes.
pub const ENTITY_INDEX: &str = "entity-index";

/// `TransactWriteItems` hard cap.
pub const MAX_TRANSACT_ITEMS: usize = 100;
/// `BatchWriteItem` hard cap.
const BATCH_WRITE_CHUNK: usize = 25;
/// `BatchGetItem` hard cap.
const BATCH_GET_CHUNK: usize = 100;

/// Service error codes worth backing off and retrying.
const RETRYABLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
    "ServiceUnavailable",
    "LimitExceededException",
];

/// DynamoDB-backed implementation of the repository contract.
#[derive(Clone)]
pub struct DynamoRepository {
    client: Client,
    table_name: String,
    caches: std::sync::Arc<RepoCaches>,
    retry: RetryPolicy,
}

impl DynamoRepository {
    /// Wraps a pre-built client. The table must exist with the `(PK,
    /// SK)` string key schema, the two GSIs, and TTL enabled on the
    /// `ttl` attribute.
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            caches: std::sync::Arc::new(RepoCaches::new(DEFAULT_CACHE_TTL)),
            retry: RetryPolicy::default(),
        }
    }

    /// Builds a client from the standard credential/region chain.
    /// `TOKENGATE_ENDPOINT_URL` overrides the endpoint for local
    /// stores.
    pub async fn from_env(table_name: impl Into<String>) -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Ok(url) = std::env::var(ENV_ENDPOINT_URL) {
            builder = builder.endpoint_url(url);
        }
        Self::new(Client::from_conf(builder.build()), table_name)
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.caches = std::sync::Arc::new(RepoCaches::new(ttl));
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // -- raw item plumbing --------------------------------------------------

    async fn get_raw_item(&self, pk: &str, sk: &str) -> Result<Option<Item>> {
        let output = self
            .retry
            .run("get_item", || async {
                self.client
                    .get_item()
                    .table_name(&self.table_name)
                    .key(codec::ATTR_PK, AttributeValue::S(pk.to_string()))
                    .key(codec::ATTR_SK, AttributeValue::S(sk.to_string()))
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error(&e, "GetItem"))
            })
            .await?;
        Ok(output.item().map(item_from_avs))
    }

    async fn put_raw_item(&self, pk: String, sk: String, item: Item) -> Result<()> {
        self.retry
            .run("put_item", || async {
                let mut builder = self
                    .client
                    .put_item()
                    .table_name(&self.table_name)
                    .item(codec::ATTR_PK, AttributeValue::S(pk.clone()))
                    .item(codec::ATTR_SK, AttributeValue::S(sk.clone()));
                for (attr, value) in &item {
                    builder = builder.item(attr, to_av(value));
                }
                builder
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk_error(&e, "PutItem"))
            })
            .await
    }

    /// Batched exact-key reads, re-requesting unprocessed keys until the
    /// store has answered for every one.
    async fn batch_get_raw(&self, keys: Vec<(String, String)>) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for chunk in keys.chunks(BATCH_GET_CHUNK) {
            let mut pending: Vec<HashMap<String, AttributeValue>> = chunk
                .iter()
                .map(|(pk, sk)| {
                    HashMap::from([
                        (codec::ATTR_PK.to_string(), AttributeValue::S(pk.clone())),
                        (codec::ATTR_SK.to_string(), AttributeValue::S(sk.clone())),
                    ])
                })
                .collect();

            while !pending.is_empty() {
                let request = KeysAndAttributes::builder()
                    .set_keys(Some(pending.clone()))
                    .build()
                    .map_err(|e| LimiterError::storage(format!("BatchGetItem: {e}"), false))?;

                let output = self
                    .retry
                    .run("batch_get_item", || {
                        let request = request.clone();
                        async move {
                            self.client
                                .batch_get_item()
                                .request_items(&self.table_name, request)
                                .send()
                                .await
                                .map_err(|e| classify_sdk_error(&e, "BatchGetItem"))
                        }
                    })
                    .await?;

                if let Some(responses) = output.responses() {
                    if let Some(found) = responses.get(&self.table_name) {
                        items.extend(found.iter().map(|avs| item_from_avs(avs)));
                    }
                }

                pending = output
                    .unprocessed_keys()
                    .and_then(|u| u.get(&self.table_name))
                    .and_then(|ka| {
                        let keys = ka.keys();
                        if keys.is_empty() {
                            None
                        } else {
                            Some(keys.to_vec())
                        }
                    })
                    .unwrap_or_default();
            }
        }
        Ok(items)
    }

    /// Paginated `Query` over one partition of the main table.
    async fn query_partition(&self, pk: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .retry
                .run("query", || {
                    let start_key: Option<HashMap<String, AttributeValue>> = start_key.clone();
                    async move {
                        self.client
                            .query()
                            .table_name(&self.table_name)
                            .key_condition_expression("#pk = :pk")
                            .expression_attribute_names("#pk", codec::ATTR_PK)
                            .expression_attribute_values(
                                ":pk",
                                AttributeValue::S(pk.to_string()),
                            )
                            .set_exclusive_start_key(start_key)
                            .send()
                            .await
                            .map_err(|e| classify_sdk_error(&e, "Query"))
                    }
                })
                .await?;

            items.extend(output.items().iter().map(|avs| item_from_avs(avs)));

            match output.last_evaluated_key() {
                Some(last) if !last.is_empty() => start_key = Some(last.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Paginated `Query` over a GSI keyed by a single string attribute.
    async fn query_index(&self, index: &str, attr: &str, value: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .retry
                .run("query_index", || {
                    let start_key: Option<HashMap<String, AttributeValue>> = start_key.clone();
                    async move {
                        self.client
                            .query()
                            .table_name(&self.table_name)
                            .index_name(index)
                            .key_condition_expression("#k = :k")
                            .expression_attribute_names("#k", attr)
                            .expression_attribute_values(
                                ":k",
                                AttributeValue::S(value.to_string()),
                            )
                            .set_exclusive_start_key(start_key)
                            .send()
                            .await
                            .map_err(|e| classify_sdk_error(&e, "Query"))
                    }
                })
                .await?;

            items.extend(output.items().iter().map(|avs| item_from_avs(avs)));

            match output.last_evaluated_key() {
                Some(last) if !last.is_empty() => start_key = Some(last.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Deletes exact keys in 25-item `BatchWriteItem` chunks,
    /// re-submitting unprocessed requests.
    async fn batch_delete(&self, keys: Vec<(String, String)>) -> Result<u64> {
        let total = keys.len() as u64;
        for chunk in keys.chunks(BATCH_WRITE_CHUNK) {
            let mut pending: Vec<WriteRequest> = chunk
                .iter()
                .map(|(pk, sk)| {
                    let delete = DeleteRequest::builder()
                        .key(codec::ATTR_PK, AttributeValue::S(pk.clone()))
                        .key(codec::ATTR_SK, AttributeValue::S(sk.clone()))
                        .build()
                        .map_err(|e| {
                            LimiterError::storage(format!("BatchWriteItem: {e}"), false)
                        })?;
                    Ok(WriteRequest::builder().delete_request(delete).build())
                })
                .collect::<Result<_>>()?;

            while !pending.is_empty() {
                let output = self
                    .retry
                    .run("batch_write_item", || {
                        let pending = pending.clone();
                        async move {
                            self.client
                                .batch_write_item()
                                .request_items(&self.table_name, pending)
                                .send()
                                .await
                                .map_err(|e| classify_sdk_error(&e, "BatchWriteItem"))
                        }
                    })
                    .await?;

                pending = output
                    .unprocessed_items()
                    .and_then(|u| u.get(&self.table_name))
                    .cloned()
                    .unwrap_or_default();
            }
        }
        Ok(total)
    }

    fn fetch_level_key(&self, ns: &Namespace, level: ConfigLevel) -> (String, String) {
        level.key(ns)
    }

    async fn append_audit(&self, ns: &Namespace, event: &AuditEvent) -> Result<()> {
        let pk = schema::pk_audit(ns, &event.subject);
        let sk = schema::sk_audit(&event.sortable_ts());
        self.put_raw_item(pk, sk, codec::encode_audit(event)).await
    }
}

// ---------------------------------------------------------------------------
// Attribute conversions and error classification
// ---------------------------------------------------------------------------

fn to_av(attr: &Attr) -> AttributeValue {
    match attr {
        Attr::S(v) => AttributeValue::S(v.clone()),
        Attr::N(v) => AttributeValue::N(v.clone()),
        Attr::Bool(v) => AttributeValue::Bool(*v),
    }
}

fn from_av(av: &AttributeValue) -> Option<Attr> {
    if let Ok(v) = av.as_s() {
        Some(Attr::S(v.clone()))
    } else if let Ok(v) = av.as_n() {
        Some(Attr::N(v.clone()))
    } else if let Ok(v) = av.as_bool() {
        Some(Attr::Bool(*v))
    } else {
        None
    }
}

fn item_from_avs(avs: &HashMap<String, AttributeValue>) -> Item {
    avs.iter()
        .filter_map(|(name, av)| from_av(av).map(|attr| (name.clone(), attr)))
        .collect()
}

/// Classifies an SDK error into the internal error plane.
fn classify_sdk_error<E, R>(err: &SdkError<E, R>, op: &str) -> LimiterError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if let Some(code) = err.code() {
        if code == "ConditionalCheckFailedException" {
            return LimiterError::ConditionFailed;
        }
        return LimiterError::storage(
            format!("{op}: {code}: {}", err.message().unwrap_or("")),
            RETRYABLE_CODES.contains(&code),
        );
    }
    // No service code: construction failures are programming errors,
    // everything else is connection-level and worth a retry.
    let retryable = !matches!(err, SdkError::ConstructionFailure(_));
    LimiterError::storage(format!("{op}: {err}"), retryable)
}

#[async_trait]
impl Repository for DynamoRepository {
    async fn ping(&self) -> Result<()> {
        self.client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_sdk_error(&e, "DescribeTable"))
    }

    async fn get_version(&self, ns: &Namespace) -> Result<Option<VersionRecord>> {
        match self
            .get_raw_item(&schema::pk_system(ns), schema::SK_VERSION)
            .await?
        {
            Some(item) => Ok(Some(codec::decode_version(&item)?)),
            None => Ok(None),
        }
    }

    async fn put_version(
        &self,
        ns: &Namespace,
        record: &VersionRecord,
        principal: Option<&str>,
    ) -> Result<()> {
        self.put_raw_item(
            schema::pk_system(ns),
            schema::SK_VERSION.to_string(),
            codec::encode_version(record),
        )
        .await?;
        self.append_audit(
            ns,
            &AuditEvent::new(
                schema::AUDIT_SUBJECT_SYSTEM,
                AuditAction::PutVersion,
                principal,
                serde_json::json!({ "schema_version": record.schema_version }),
                now_unix() as u64,
            ),
        )
        .await
    }

    async fn get_entity(&self, ns: &Namespace, entity_id: &str) -> Result<Option<Entity>> {
        self.caches
            .entity(ns, entity_id, || async {
                match self
                    .get_raw_item(&schema::pk_entity(ns, entity_id), schema::SK_META)
                    .await?
                {
                    Some(item) => Ok(Some(codec::decode_entity(&item)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn create_entity(
        &self,
        ns: &Namespace,
        entity: &Entity,
        principal: Option<&str>,
    ) -> Result<()> {
        let pk = schema::pk_entity(ns, &entity.entity_id);
        let item = codec::encode_entity(entity);

        let result = self
            .retry
            .run("create_entity", || async {
                let mut builder = self
                    .client
                    .put_item()
                    .table_name(&self.table_name)
                    .item(codec::ATTR_PK, AttributeValue::S(pk.clone()))
                    .item(
                        codec::ATTR_SK,
                        AttributeValue::S(schema::SK_META.to_string()),
                    )
                    .condition_expression("attribute_not_exists(#pk)")
                    .expression_attribute_names("#pk", codec::ATTR_PK);
                for (attr, value) in &item {
                    builder = builder.item(attr, to_av(value));
                }
                builder
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk_error(&e, "PutItem"))
            })
            .await;

        match result {
            Ok(()) => {}
            Err(err) if err.is_condition_failed() => {
                return Err(LimiterError::EntityExists(entity.entity_id.clone()))
            }
            Err(err) => return Err(err),
        }

        self.caches.invalidate_entity(ns, &entity.entity_id);
        self.append_audit(
            ns,
            &AuditEvent::new(
                &entity.entity_id,
                AuditAction::CreateEntity,
                principal,
                serde_json::json!({
                    "parent_id": entity.parent_id,
                    "cascade": entity.cascade,
                }),
                now_unix() as u64,
            ),
        )
        .await
    }

    async fn delete_entity(
        &self,
        ns: &Namespace,
        entity_id: &str,
        principal: Option<&str>,
    ) -> Result<u64> {
        let entity_pk = schema::pk_entity(ns, entity_id);
        if self
            .get_raw_item(&entity_pk, schema::SK_META)
            .await?
            .is_none()
        {
            return Err(LimiterError::EntityNotFound(entity_id.to_string()));
        }

        // Metadata and configs live under the entity partition; buckets
        // are discovered through the entity GSI and filtered to this
        // namespace.
        let mut keys: Vec<(String, String)> = Vec::new();
        for item in self.query_partition(&entity_pk).await? {
            if let Some(sk) = item.get(codec::ATTR_SK).and_then(Attr::as_s) {
                keys.push((entity_pk.clone(), sk.to_string()));
            }
        }

        let bucket_prefix = format!("{ns}/BUCKET#{entity_id}#");
        for item in self
            .query_index(ENTITY_INDEX, codec::ATTR_ENTITY_ID, entity_id)
            .await?
        {
            let (Some(pk), Some(sk)) = (
                item.get(codec::ATTR_PK).and_then(Attr::as_s),
                item.get(codec::ATTR_SK).and_then(Attr::as_s),
            ) else {
                continue;
            };
            if pk.starts_with(&bucket_prefix) {
                keys.push((pk.to_string(), sk.to_string()));
            }
        }

        let deleted = self.batch_delete(keys).await?;
        self.caches.invalidate(Some(entity_id), None);
        self.append_audit(
            ns,
            &AuditEvent::new(
                entity_id,
                AuditAction::DeleteEntity,
                principal,
                serde_json::json!({ "records_deleted": deleted }),
                now_unix() as u64,
            ),
        )
        .await?;
        Ok(deleted)
    }

    async fn get_children(&self, ns: &Namespace, parent_id: &str) -> Result<Vec<Entity>> {
        let ns_prefix = format!("{ns}/");
        let mut children = Vec::new();
        for item in self
            .query_index(PARENT_INDEX, codec::ATTR_PARENT_ID, parent_id)
            .await?
        {
            let (Some(pk), Some(sk)) = (
                item.get(codec::ATTR_PK).and_then(Attr::as_s),
                item.get(codec::ATTR_SK).and_then(Attr::as_s),
            ) else {
                continue;
            };
            if sk == schema::SK_META && pk.starts_with(&ns_prefix) {
                children.push(codec::decode_entity(&item)?);
            }
        }
        Ok(children)
    }

    async fn resolve_limits(
        &self,
        ns: &Namespace,
        entity_id: &str,
        resource: &str,
    ) -> Result<Resolution> {
        self.caches
            .resolution(ns, entity_id, resource, || async {
                let level_keys = [
                    self.fetch_level_key(
                        ns,
                        ConfigLevel::EntityResource {
                            entity_id: entity_id.to_string(),
                            resource: resource.to_string(),
                        },
                    ),
                    self.fetch_level_key(
                        ns,
                        ConfigLevel::EntityDefault {
                            entity_id: entity_id.to_string(),
                        },
                    ),
                    self.fetch_level_key(
                        ns,
                        ConfigLevel::Resource {
                            resource: resource.to_string(),
                        },
                    ),
                    self.fetch_level_key(ns, ConfigLevel::System),
                ];
                let found = self.batch_get_raw(level_keys.to_vec()).await?;

                let mut by_key: HashMap<(String, String), LimitConfig> = HashMap::new();
                for item in &found {
                    let (Some(pk), Some(sk)) = (
                        item.get(codec::ATTR_PK).and_then(Attr::as_s),
                        item.get(codec::ATTR_SK).and_then(Attr::as_s),
                    ) else {
                        continue;
                    };
                    by_key.insert((pk.to_string(), sk.to_string()), codec::decode_config(item)?);
                }

                let mut levels = level_keys
                    .into_iter()
                    .map(|key| by_key.remove(&key));
                Ok(crate::config::resolve_from_levels(
                    levels.next().flatten(),
                    levels.next().flatten(),
                    levels.next().flatten(),
                    levels.next().flatten(),
                ))
            })
            .await
    }

    fn invalidate_config_cache(&self, entity_id: Option<&str>, resource: Option<&str>) {
        self.caches.invalidate(entity_id, resource);
    }

    async fn get_config(&self, ns: &Namespace, level: &ConfigLevel) -> Result<Option<LimitConfig>> {
        let (pk, sk) = level.key(ns);
        match self.get_raw_item(&pk, &sk).await? {
            Some(item) => Ok(Some(codec::decode_config(&item)?)),
            None => Ok(None),
        }
    }

    async fn put_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        config: &LimitConfig,
        principal: Option<&str>,
    ) -> Result<()> {
        let (pk, sk) = level.key(ns);
        let mut item = codec::encode_config(config);
        if let ConfigLevel::EntityResource { entity_id, .. }
        | ConfigLevel::EntityDefault { entity_id } = level
        {
            item.insert(codec::ATTR_ENTITY_ID.to_string(), Attr::s(entity_id));
        }
        self.put_raw_item(pk, sk, item).await?;
        match level {
            ConfigLevel::EntityResource {
                entity_id,
                resource,
            } => self.caches.invalidate(Some(entity_id), Some(resource)),
            ConfigLevel::EntityDefault { entity_id } => {
                self.caches.invalidate(Some(entity_id), None)
            }
            ConfigLevel::Resource { resource } => self.caches.invalidate(None, Some(resource)),
            ConfigLevel::System => self.caches.invalidate(None, None),
        }
        self.append_audit(
            ns,
            &AuditEvent::new(
                level.audit_subject(),
                AuditAction::PutConfig,
                principal,
                serde_json::json!({ "limits": config.limits.keys().collect::<Vec<_>>() }),
                now_unix() as u64,
            ),
        )
        .await
    }

    async fn delete_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        principal: Option<&str>,
    ) -> Result<()> {
        let (pk, sk) = level.key(ns);
        self.retry
            .run("delete_config", || async {
                self.client
                    .delete_item()
                    .table_name(&self.table_name)
                    .key(codec::ATTR_PK, AttributeValue::S(pk.clone()))
                    .key(codec::ATTR_SK, AttributeValue::S(sk.clone()))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk_error(&e, "DeleteItem"))
            })
            .await?;
        match level {
            ConfigLevel::EntityResource {
                entity_id,
                resource,
            } => self.caches.invalidate(Some(entity_id), Some(resource)),
            ConfigLevel::EntityDefault { entity_id } => {
                self.caches.invalidate(Some(entity_id), None)
            }
            ConfigLevel::Resource { resource } => self.caches.invalidate(None, Some(resource)),
            ConfigLevel::System => self.caches.invalidate(None, None),
        }
        self.append_audit(
            ns,
            &AuditEvent::new(
                level.audit_subject(),
                AuditAction::DeleteConfig,
                principal,
                serde_json::Value::Null,
                now_unix() as u64,
            ),
        )
        .await
    }

    async fn read_buckets(
        &self,
        ns: &Namespace,
        keys: &[BucketKey],
    ) -> Result<HashMap<BucketKey, BucketState>> {
        let raw_keys: Vec<(String, String)> = keys
            .iter()
            .map(|key| (key.pk(ns), schema::SK_STATE.to_string()))
            .collect();
        let items = self.batch_get_raw(raw_keys).await?;

        let mut by_pk: HashMap<String, &Item> = HashMap::new();
        for item in &items {
            if let Some(pk) = item.get(codec::ATTR_PK).and_then(Attr::as_s) {
                by_pk.insert(pk.to_string(), item);
            }
        }

        let mut found = HashMap::new();
        for key in keys {
            if let Some(item) = by_pk.get(&key.pk(ns)) {
                found.insert(key.clone(), codec::decode_bucket_state(item)?);
            }
        }
        Ok(found)
    }

    async fn write_bucket(
        &self,
        ns: &Namespace,
        key: &BucketKey,
        write: BucketWrite,
    ) -> Result<()> {
        let pk = key.pk(ns);
        let rendered = render_bucket_write(&write)?;

        self.retry
            .run("write_bucket", || {
                let rendered = rendered.clone();
                let pk = pk.clone();
                async move {
                    match rendered {
                        RenderedWrite::Put(put) => {
                            let mut builder = self
                                .client
                                .put_item()
                                .table_name(&self.table_name)
                                .item(codec::ATTR_PK, AttributeValue::S(pk))
                                .item(
                                    codec::ATTR_SK,
                                    AttributeValue::S(schema::SK_STATE.to_string()),
                                )
                                .item(
                                    codec::ATTR_ENTITY_ID,
                                    AttributeValue::S(key.entity_id.clone()),
                                )
                                .condition_expression(put.condition_expression);
                            for (alias, name) in put.names {
                                builder = builder.expression_attribute_names(alias, name);
                            }
                            for (attr, value) in &put.item {
                                builder = builder.item(attr, to_av(value));
                            }
                            builder
                                .send()
                                .await
                                .map(|_| ())
                                .map_err(|e| classify_sdk_error(&e, "PutItem"))
                        }
                        RenderedWrite::Update(update) => {
                            let mut builder = self
                                .client
                                .update_item()
                                .table_name(&self.table_name)
                                .key(codec::ATTR_PK, AttributeValue::S(pk))
                                .key(
                                    codec::ATTR_SK,
                                    AttributeValue::S(schema::SK_STATE.to_string()),
                                )
                                .update_expression(update.update_expression)
                                .set_condition_expression(update.condition_expression);
                            for (alias, name) in update.names {
                                builder = builder.expression_attribute_names(alias, name);
                            }
                            for (placeholder, value) in &update.values {
                                builder = builder
                                    .expression_attribute_values(placeholder, to_av(value));
                            }
                            builder
                                .send()
                                .await
                                .map(|_| ())
                                .map_err(|e| classify_sdk_error(&e, "UpdateItem"))
                        }
                    }
                }
            })
            .await
    }

    async fn transact_buckets(
        &self,
        ns: &Namespace,
        writes: Vec<(BucketKey, BucketWrite)>,
    ) -> Result<()> {
        if writes.len() > MAX_TRANSACT_ITEMS {
            return Err(LimiterError::storage(
                format!(
                    "transaction of {} items exceeds the {MAX_TRANSACT_ITEMS}-item cap",
                    writes.len()
                ),
                false,
            ));
        }

        let mut actions = Vec::with_capacity(writes.len());
        for (key, write) in &writes {
            let pk = key.pk(ns);
            match render_bucket_write(write)? {
                RenderedWrite::Put(put) => {
                    let mut builder = Put::builder()
                        .table_name(&self.table_name)
                        .item(codec::ATTR_PK, AttributeValue::S(pk))
                        .item(
                            codec::ATTR_SK,
                            AttributeValue::S(schema::SK_STATE.to_string()),
                        )
                        .item(
                            codec::ATTR_ENTITY_ID,
                            AttributeValue::S(key.entity_id.clone()),
                        )
                        .condition_expression(put.condition_expression);
                    for (alias, name) in put.names {
                        builder = builder.expression_attribute_names(alias, name);
                    }
                    for (attr, value) in &put.item {
                        builder = builder.item(attr, to_av(value));
                    }
                    let action = builder.build().map_err(|e| {
                        LimiterError::storage(format!("TransactWriteItems: {e}"), false)
                    })?;
                    actions.push(TransactWriteItem::builder().put(action).build());
                }
                RenderedWrite::Update(update) => {
                    let mut builder = Update::builder()
                        .table_name(&self.table_name)
                        .key(codec::ATTR_PK, AttributeValue::S(pk))
                        .key(
                            codec::ATTR_SK,
                            AttributeValue::S(schema::SK_STATE.to_string()),
                        )
                        .update_expression(update.update_expression)
                        .set_condition_expression(update.condition_expression);
                    for (alias, name) in update.names {
                        builder = builder.expression_attribute_names(alias, name);
                    }
                    for (placeholder, value) in &update.values {
                        builder = builder.expression_attribute_values(placeholder, to_av(value));
                    }
                    let action = builder.build().map_err(|e| {
                        LimiterError::storage(format!("TransactWriteItems: {e}"), false)
                    })?;
                    actions.push(TransactWriteItem::builder().update(action).build());
                }
            }
        }

        self.retry
            .run("transact_write_items", || {
                let actions = actions.clone();
                async move {
                    match self
                        .client
                        .transact_write_items()
                        .set_transact_items(Some(actions))
                        .send()
                        .await
                    {
                        Ok(_) => Ok(()),
                        Err(err) => {
                            if let Some(TransactWriteItemsError::TransactionCanceledException(
                                cancelled,
                            )) = err.as_service_error()
                            {
                                let condition_failed = cancelled
                                    .cancellation_reasons()
                                    .iter()
                                    .any(|reason| {
                                        reason.code() == Some("ConditionalCheckFailed")
                                    });
                                if condition_failed {
                                    return Err(LimiterError::ConditionFailed);
                                }
                                return Err(LimiterError::storage(
                                    format!("TransactWriteItems cancelled: {err}"),
                                    true,
                                ));
                            }
                            Err(classify_sdk_error(&err, "TransactWriteItems"))
                        }
                    }
                }
            })
            .await
    }

    async fn put_audit(&self, ns: &Namespace, event: &AuditEvent) -> Result<()> {
        self.append_audit(ns, event).await
    }
}
