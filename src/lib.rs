//! # Tokengate: distributed token-bucket rate limiting
//!
//! Tokengate is a rate-limiting core backed by a single shared
//! key-value table with conditional updates, atomic numeric deltas, and
//! multi-item transactions (DynamoDB in production, an in-memory
//! equivalent for tests). Many processes and regions call
//! [`acquire`](engine::RateLimiter::acquire) against the same table;
//! consumption stays accurate under contention because refill claims
//! are serialized by a shared optimistic lock and consumptions are
//! summed with atomic `ADD`s rather than overwritten.
//!
//! ## Core pieces
//!
//! - **[`engine::RateLimiter`]** orchestrates resolve → read →
//!   decide → write and hands out leases.
//! - **[`lease::Lease`]**, a scoped consumption: adjust while open,
//!   commit on success, compensating rollback on failure.
//! - **[`repository::Repository`]**, the storage capability set;
//!   [`repository::dynamo::DynamoRepository`] for production,
//!   [`repository::memory::MemoryRepository`] for tests.
//! - **[`config`]**, the 4-level limit hierarchy (entity-specific >
//!   entity default > resource > system) with a process-local TTL
//!   cache.
//! - **[`bucket`]**, the millitoken math: lazy refill, burst clamping,
//!   retry-after.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tokengate::config::{ConfigLevel, LimitConfig};
//! use tokengate::engine::RateLimiter;
//! use tokengate::limits::{ConsumeMap, LimitSpec};
//! use tokengate::repository::dynamo::DynamoRepository;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = DynamoRepository::from_env("tokengate").await;
//!     let limiter = RateLimiter::new(repo);
//!     limiter.verify_compatibility().await?;
//!
//!     // Global default: 100 requests per minute.
//!     let mut limits = tokengate::limits::LimitSet::new();
//!     limits.insert("rpm".to_string(), LimitSpec::per_minute(100));
//!     limiter
//!         .put_config(ConfigLevel::System, LimitConfig { limits, ..Default::default() }, None)
//!         .await?;
//!
//!     let lease = limiter
//!         .acquire("u1", "api", ConsumeMap::from([("rpm".to_string(), 1)]))
//!         .await?;
//!     // ... serve the request ...
//!     lease.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod bucket;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod lease;
pub mod limits;
pub mod repository;
pub mod retry;
pub mod schema;
pub mod validation;
pub mod version;

// Re-export commonly used types
pub use config::{ConfigLevel, ConfigSource, LimitConfig, OnUnavailable, Resolution};
pub use engine::{AcquireRequest, EngineOptions, RateLimiter};
pub use entity::Entity;
pub use error::{LimiterError, LimitViolation};
pub use lease::Lease;
pub use limits::{AdjustMap, ConsumeMap, LimitSet, LimitSpec};
pub use repository::{BucketKey, Repository};
pub use schema::Namespace;

/// Result type alias for tokengate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// Version of the tokengate library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
