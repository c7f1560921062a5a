//! Embedded in-process [`Store`].
//!
//! Holds the same key shapes as the Redis backend behind a single mutex,
//! with real time-to-live expiry checked lazily on access. Suitable for
//! single-replica deployments where no registry sharing is needed, and
//! used throughout the test suite. Coordination state kept here is lost
//! on process exit and invisible to other gateway instances.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{BatchOp, Store};
use crate::{GatewayError, Result};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the entry if its TTL has lapsed, mirroring Redis expiry.
    fn purge(entries: &mut HashMap<String, Entry>, key: &str) {
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
    }

    fn wrong_type(key: &str) -> GatewayError {
        GatewayError::Storage(format!("wrong value type at key {key}"))
    }

    fn apply(entries: &mut HashMap<String, Entry>, op: BatchOp) -> Result<()> {
        match op {
            BatchOp::SetAdd { key, member } => {
                Self::purge(entries, &key);
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(|| Entry::live(Value::Set(BTreeSet::new()), None));
                match &mut entry.value {
                    Value::Set(members) => {
                        members.insert(member);
                        Ok(())
                    }
                    _ => Err(Self::wrong_type(&key)),
                }
            }
            BatchOp::SetRemove { key, member } => {
                Self::purge(entries, &key);
                if let Some(entry) = entries.get_mut(&key) {
                    match &mut entry.value {
                        Value::Set(members) => {
                            members.remove(&member);
                        }
                        _ => return Err(Self::wrong_type(&key)),
                    }
                }
                Ok(())
            }
            BatchOp::HashSet { key, fields } => {
                Self::purge(entries, &key);
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(|| Entry::live(Value::Hash(HashMap::new()), None));
                match &mut entry.value {
                    Value::Hash(map) => {
                        map.extend(fields);
                        Ok(())
                    }
                    _ => Err(Self::wrong_type(&key)),
                }
            }
            BatchOp::SetIfAbsent { key, value } => {
                Self::purge(entries, &key);
                entries
                    .entry(key)
                    .or_insert_with(|| Entry::live(Value::Text(value), None));
                Ok(())
            }
            BatchOp::Delete { key } => {
                entries.remove(&key);
                Ok(())
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        match entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Text(s) => Ok(Some(s.clone())),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.lock();
        entries.insert(key.to_owned(), Entry::live(Value::Text(value.to_owned()), ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        Ok(entries.contains_key(key))
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::live(Value::Text("0".into()), None));
        match &mut entry.value {
            Value::Text(s) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| GatewayError::Storage(format!("non-integer value at key {key}")))?;
                let next = current + 1;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn set_size(&self, key: &str) -> Result<u64> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        match entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::Set(members) => Ok(members.len() as u64),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.clone()),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::live(Value::Hash(HashMap::new()), None));
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in fields {
                    map.insert((*field).to_owned(), value.clone());
                }
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut entries = self.lock();
        entries.retain(|_, entry| !entry.expired());
        let keys = match pattern.strip_suffix('*') {
            Some(prefix) => entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            None => entries
                .keys()
                .filter(|k| k.as_str() == pattern)
                .cloned()
                .collect(),
        };
        Ok(keys)
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut entries = self.lock();
        for op in ops {
            Self::apply(&mut entries, op)?;
        }
        Ok(())
    }
}
