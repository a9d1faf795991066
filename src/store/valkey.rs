use super::Store;
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

/// Valkey/Redis-backed store. TTLs are enforced natively by the server.
#[derive(Clone)]
pub struct ValkeyStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl ValkeyStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Valkey at {}", url);
        Ok(Self {
            conn,
            key_prefix: "nowplaying".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

/// Whole seconds for `EX`, never zero (Valkey rejects `EX 0`).
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Store for ValkeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let pattern = format!("{}*", self.key(prefix));
        let mut conn = self.conn.clone();
        // SCAN instead of KEYS so a large keyspace does not block the server
        let mut cursor: u64 = 0;
        let mut removed: usize = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                removed += redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<usize>(&mut conn)
                    .await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let full_key = self.key(key);
        let mut conn = self.conn.clone();
        let value = redis::cmd("INCRBY")
            .arg(&full_key)
            .arg(by)
            .query_async::<i64>(&mut conn)
            .await?;
        // First increment created the key: start its expiry window now
        if value == by
            && let Some(ttl) = ttl
        {
            redis::cmd("EXPIRE")
                .arg(&full_key)
                .arg(ttl_secs(ttl))
                .query_async::<i32>(&mut conn)
                .await?;
        }
        Ok(value)
    }
}
