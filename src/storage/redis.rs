// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the write-behind buffer, ranking cache, page snapshots
//! and sync locks.
//!
//! Structures used:
//! ```text
//! dirty_counts:{guild}        HASH   field "{user}:{channel}:{date}" → pending increments
//! leaderboard:{guild}         ZSET   user → lifetime total
//! leaderboard:page-gen:{guild} STRING snapshot generation (INCR)
//! leaderboard:page:{guild}:…  STRING JSON page snapshot (EX)
//! sync-lock:{guild}           STRING JSON lease (NX EX)
//! ```
//!
//! Idempotent commands go through [`retry`]. `HINCRBY`, `ZINCRBY`, `INCR` and
//! the take-all transaction are sent once: replaying them after a lost reply would
//! double count or drop data.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, Script};

use super::traits::{CacheStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Members per ZADD when rewriting a large sorted set.
const WRITE_CHUNK: usize = 1000;
const SCAN_COUNT: usize = 500;

const DELETE_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "tally:" → "tally:leaderboard:42")
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use tally_engine::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::with_prefix("redis://localhost", Some("tally:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// SCAN for every full (prefixed) key beginning with `raw_prefix`.
    async fn scan_raw(&self, raw_prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}*", escape_glob(raw_prefix));
        let conn = self.connection.clone();

        retry("redis_scan", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let pattern = pattern.clone();
            async move {
                let mut keys = Vec::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await?;
                    keys.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                keys.sort();
                keys.dedup();
                Ok(keys)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}

/// Escape Redis glob metacharacters so a prefix matches literally.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        // not retried: not idempotent
        conn.hincr(self.prefixed_key(key), field, delta)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_hgetall", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let all: HashMap<String, i64> = conn.hgetall(&key).await?;
                Ok(all.into_iter().collect())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hash_take_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);

        // MULTI; HGETALL; DEL; EXEC
        let (all,): (HashMap<String, i64>,) = pipe()
            .atomic()
            .hgetall(&key)
            .del(&key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(all.into_iter().collect())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let raw = self.scan_raw(&self.prefixed_key(prefix)).await?;
        Ok(raw.iter().map(|k| self.strip_prefix(k).to_string()).collect())
    }

    async fn zset_incr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StorageError> {
        let mut conn = self.connection.clone();
        // not retried: not idempotent
        conn.zincr(self.prefixed_key(key), member, delta)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn zset_rev_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<(String, f64)>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_zrevrange", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let rows: Vec<(String, f64)> = conn
                    .zrevrange_withscores(&key, start as isize, stop as isize)
                    .await?;
                Ok(rows)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let member = member.to_string();

        retry("redis_zscore", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let member = member.clone();
            async move {
                let score: Option<f64> = conn.zscore(&key, &member).await?;
                Ok(score)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn zset_count_above(&self, key: &str, score: f64) -> Result<u64, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let exclusive_min = format!("({score}");

        retry("redis_zcount", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let min = exclusive_min.clone();
            async move {
                let n: u64 = cmd("ZCOUNT").arg(&key).arg(&min).arg("+inf").query_async(&mut conn).await?;
                Ok(n)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn zset_card(&self, key: &str) -> Result<u64, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_zcard", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let n: u64 = conn.zcard(&key).await?;
                Ok(n)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn zset_replace(&self, key: &str, entries: &[(String, f64)]) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        // DEL + ZADDs inside MULTI: replaying the whole transaction is idempotent
        retry("redis_zset_replace", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.atomic().del(&key).ignore();
                for chunk in entries.chunks(WRITE_CHUNK) {
                    let zadd = pipeline.cmd("ZADD").arg(&key);
                    for (member, score) in chunk {
                        zadd.arg(*score).arg(member);
                    }
                    zadd.ignore();
                }
                let _: () = pipeline.query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let value: Option<String> = conn.get(&key).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let value = value.to_string();

        retry("redis_set_ex", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let value = value.clone();
            async move {
                let _: () = conn.set_ex(&key, &value, ttl_secs).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        // not retried: a lost "OK" followed by a replay would report our own lock as busy
        let reply: Option<String> = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let expected = expected.to_string();
        let script = Script::new(DELETE_IF_EQ);

        retry("redis_delete_if_eq", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let expected = expected.clone();
            let script = &script;
            async move {
                let deleted: i64 = script.key(&key).arg(&expected).invoke_async(&mut conn).await?;
                Ok(deleted > 0)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        let value: i64 = conn
            .incr(self.prefixed_key(key), 1i64)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("dirty_counts:"), "dirty_counts:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
        assert_eq!(escape_glob("back\\slash"), "back\\\\slash");
    }
}
