use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::Result;

/// 变量存储 trait
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn clear(&self) -> Result<()>;
}

/// 内存存储实现
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.inner.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        self.inner.write().clear();
        Ok(())
    }
}

#[cfg(feature = "redis-store")]
pub mod redis {
    use super::*;
    use crate::error::TaskFlowError;
    use redis::AsyncCommands;

    /// Redis 存储，所有键都带有任务级前缀
    pub struct RedisStore {
        client: redis::Client,
        prefix: String,
    }

    impl RedisStore {
        pub fn new(client: redis::Client, namespace: &str) -> Self {
            Self {
                client,
                prefix: format!("taskflow:{}:", namespace),
            }
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| TaskFlowError::Context(e.to_string()))
        }

        fn key(&self, key: &str) -> String {
            format!("{}{}", self.prefix, key)
        }

        async fn raw_keys(&self) -> Result<Vec<String>> {
            let mut conn = self.connection().await?;
            let keys: Vec<String> = conn
                .keys(format!("{}*", self.prefix))
                .await
                .map_err(|e| TaskFlowError::Context(e.to_string()))?;
            Ok(keys)
        }
    }

    #[async_trait]
    impl VariableStore for RedisStore {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            let mut conn = self.connection().await?;
            let value: Option<String> = conn
                .get(self.key(key))
                .await
                .map_err(|e| TaskFlowError::Context(e.to_string()))?;
            match value {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        }

        async fn set(&self, key: &str, value: Value) -> Result<()> {
            let mut conn = self.connection().await?;
            let raw = serde_json::to_string(&value)?;
            conn.set::<_, _, ()>(self.key(key), raw)
                .await
                .map_err(|e| TaskFlowError::Context(e.to_string()))?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let mut conn = self.connection().await?;
            conn.del::<_, ()>(self.key(key))
                .await
                .map_err(|e| TaskFlowError::Context(e.to_string()))?;
            Ok(())
        }

        async fn keys(&self) -> Result<Vec<String>> {
            let mut keys: Vec<String> = self
                .raw_keys()
                .await?
                .into_iter()
                .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
                .collect();
            keys.sort();
            Ok(keys)
        }

        async fn clear(&self) -> Result<()> {
            let keys = self.raw_keys().await?;
            if keys.is_empty() {
                return Ok(());
            }
            let mut conn = self.connection().await?;
            conn.del::<_, ()>(keys)
                .await
                .map_err(|e| TaskFlowError::Context(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_roundtrip_and_clear() {
        let store = MemoryStore::new();
        store.set("b", json!(2)).await.unwrap();
        store.set("a", json!({"x": 1})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.keys().await.unwrap(), vec!["a", "b"]);
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
