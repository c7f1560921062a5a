//! The coordination-store seam.
//!
//! Every piece of cross-request state — the service registry, round-robin
//! cursors, circuit state, rate-limit windows, cached responses, auth
//! tickets — lives behind the [`Store`] trait so that multiple gateway
//! replicas observe the same view. [`RedisStore`] is the production
//! backend; [`MemoryStore`] is an embedded substitute for single-replica
//! deployments and tests. The key schema is the contract between gateway
//! instances and the management plane, so both backends treat keys as
//! opaque strings in the same shapes.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// A write operation applied atomically as part of a [`Store::batch`].
///
/// Batches back registry mutations that must be observed all-or-nothing
/// by concurrent readers (a pipelined MULTI/EXEC in Redis, a single lock
/// acquisition in memory).
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Add a member to a set, creating the set if absent.
    SetAdd { key: String, member: String },
    /// Remove a member from a set.
    SetRemove { key: String, member: String },
    /// Write hash fields, creating the hash if absent.
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Write a string value only if the key does not already exist.
    SetIfAbsent { key: String, value: String },
    /// Delete a key of any type.
    Delete { key: String },
}

/// Atomic single-key primitives over the shared coordination store.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers in the same or other processes; `increment` in particular is
/// the fairness primitive for round-robin selection and rate limiting.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads a string value, `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a string value, with an optional time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Deletes the given keys; missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Returns whether the key currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomically increments an integer key, creating it at zero first,
    /// and returns the post-increment value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Sets or refreshes the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Returns all members of a set; empty if the key is absent.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Returns the cardinality of a set; zero if the key is absent.
    async fn set_size(&self, key: &str) -> Result<u64>;

    /// Reads all fields of a hash; empty if the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Writes the given fields of a hash, creating it if absent.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Lists keys matching a glob-style pattern (only trailing-`*`
    /// patterns are used by the gateway).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    /// Applies all operations atomically.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;
}
