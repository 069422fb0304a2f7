use crate::error::BackendError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait FastStore: Send + Sync {
    async fn hget_first(&self, keys: &[String], field: &str) -> Result<Option<String>, BackendError>;

    async fn hset_expire(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BackendError>;

    async fn hdel(&self, keys: &[String], field: &str) -> Result<(), BackendError>;
}

const HGET_FIRST_LUA: &str = r#"
for _, key in ipairs(KEYS) do
    local value = redis.call("HGET", key, ARGV[1])
    if value then
        return value
    end
end
return false
"#;

#[derive(Clone)]
pub struct RedisFastStore {
    manager: ConnectionManager,
    hget_first: redis::Script,
}

impl RedisFastStore {
    pub async fn connect(redis_url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            hget_first: redis::Script::new(HGET_FIRST_LUA),
        })
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        let ms = ttl.as_millis() as u64;
        if ms == 0 {
            1
        } else {
            ms
        }
    }
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn hget_first(&self, keys: &[String], field: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.manager.clone();
        let mut invocation = self.hget_first.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(field);
        let value: Option<String> = invocation.invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn hset_expire(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(Self::ttl_ms(ttl))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hdel(&self, keys: &[String], field: &str) -> Result<(), BackendError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.cmd("HDEL").arg(key).arg(field).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

struct MemoryBucket {
    fields: HashMap<String, String>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryFastStore {
    buckets: Mutex<HashMap<String, MemoryBucket>>,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_buckets(&self) -> usize {
        let mut buckets = self.lock();
        Self::purge(&mut buckets);
        buckets.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn purge(buckets: &mut HashMap<String, MemoryBucket>) {
        let now = Instant::now();
        buckets.retain(|_, bucket| bucket.expires_at > now);
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn hget_first(&self, keys: &[String], field: &str) -> Result<Option<String>, BackendError> {
        let mut buckets = self.lock();
        Self::purge(&mut buckets);
        Ok(keys
            .iter()
            .find_map(|key| buckets.get(key).and_then(|b| b.fields.get(field)).cloned()))
    }

    async fn hset_expire(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let mut buckets = self.lock();
        Self::purge(&mut buckets);
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| MemoryBucket {
            fields: HashMap::new(),
            expires_at: Instant::now(),
        });
        bucket.fields.insert(field.to_string(), value.to_string());
        bucket.expires_at = Instant::now() + ttl;
        Ok(())
    }

    async fn hdel(&self, keys: &[String], field: &str) -> Result<(), BackendError> {
        let mut buckets = self.lock();
        for key in keys {
            if let Some(bucket) = buckets.get_mut(key) {
                bucket.fields.remove(field);
            }
        }
        Ok(())
    }
}
