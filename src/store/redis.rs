//! Redis-backed [`Store`] over a shared connection pool.
//!
//! Connections come from a [`deadpool_redis`] pool sized for the gateway's
//! concurrency; acquisition is fair FIFO and shared by all request
//! handlers. Every operation is wrapped in the configured per-op timeout
//! so a stalled store surfaces as a `Storage` error instead of hanging a
//! request task.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;

use super::{BatchOp, Store};
use crate::{GatewayError, Result};

pub struct RedisStore {
    pool: Pool,
    op_timeout: Duration,
}

impl RedisStore {
    /// Builds the pool and verifies connectivity with a `PING` bounded by
    /// `connect_timeout`.
    pub async fn connect(
        url: &str,
        pool_size: usize,
        connect_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self> {
        let mut cfg = deadpool_redis::Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| GatewayError::Storage(format!("failed to create redis pool: {e}")))?;

        let store = Self { pool, op_timeout };

        let mut conn = tokio::time::timeout(connect_timeout, store.pool.get())
            .await
            .map_err(|_| {
                GatewayError::Storage(format!(
                    "redis connection timed out after {connect_timeout:?}"
                ))
            })?
            .map_err(|e| GatewayError::Storage(format!("failed to connect to redis: {e}")))?;
        store
            .bounded(redis::cmd("PING").query_async::<String>(&mut conn))
            .await?;

        Ok(store)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        tokio::time::timeout(self.op_timeout, self.pool.get())
            .await
            .map_err(|_| GatewayError::Storage("redis pool acquisition timed out".into()))?
            .map_err(|e| GatewayError::Storage(format!("failed to get redis connection: {e}")))
    }

    /// Bounds a pending command by the op timeout and maps its error.
    async fn bounded<T>(&self, fut: impl Future<Output = redis::RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| GatewayError::Storage(e.to_string())),
            Err(_) => Err(GatewayError::Storage(format!(
                "redis operation timed out after {:?}",
                self.op_timeout
            ))),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        self.bounded(conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                self.bounded(conn.set_ex(key, value, ttl.as_secs().max(1)))
                    .await
            }
            None => self.bounded(conn.set(key, value)).await,
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        self.bounded(conn.del::<_, ()>(keys)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        self.bounded(conn.exists(key)).await
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        self.bounded(conn.incr(key, 1i64)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        self.bounded(conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64))
            .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        self.bounded(conn.smembers(key)).await
    }

    async fn set_size(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        self.bounded(conn.scard(key)).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        self.bounded(conn.hgetall(key)).await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn().await?;
        self.bounded(conn.hset_multiple::<_, _, _, ()>(key, fields))
            .await
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        self.bounded(conn.keys(pattern)).await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                BatchOp::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                BatchOp::SetRemove { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                BatchOp::HashSet { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                BatchOp::SetIfAbsent { key, value } => {
                    pipe.set_nx(key, value).ignore();
                }
                BatchOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
            }
        }

        let mut conn = self.conn().await?;
        self.bounded(pipe.query_async::<()>(&mut conn)).await
    }
}
