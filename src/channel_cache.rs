use crate::config::CacheConfig;
use crate::db::{with_deadline, Store};
use crate::error::{BackendError, Entity};
use crate::types::{Channel, ChannelAddress, ChannelType, ChannelUuid};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

struct CacheEntry {
    channel: Arc<Channel>,
    expires_at: Instant,
}

struct LoadLock {
    expires_at: Instant,
    released: Arc<Notify>,
}

struct Table<K> {
    entries: Mutex<HashMap<K, CacheEntry>>,
    locks: Mutex<HashMap<K, LoadLock>>,
}

impl<K: Eq + Hash + Clone> Table<K> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<K, LoadLock>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self, key: &K) -> Option<(Arc<Channel>, Instant)> {
        self.entries()
            .get(key)
            .map(|entry| (entry.channel.clone(), entry.expires_at))
    }

    fn put(&self, key: &K, channel: Arc<Channel>, expires_at: Instant) {
        self.entries()
            .insert(key.clone(), CacheEntry { channel, expires_at });
    }

    fn evict(&self, key: &K) {
        self.entries().remove(key);
    }

    fn try_lock(&self, key: &K, ttl: Duration) -> Result<LoadGuard<'_, K>, Arc<Notify>> {
        let now = Instant::now();
        let mut locks = self.locks();
        if let Some(lock) = locks.get(key) {
            if lock.expires_at > now {
                return Err(lock.released.clone());
            }
        }
        let released = Arc::new(Notify::new());
        locks.insert(
            key.clone(),
            LoadLock {
                expires_at: now + ttl,
                released: released.clone(),
            },
        );
        Ok(LoadGuard {
            table: self,
            key: key.clone(),
            released,
        })
    }
}

// Releases the load lock on drop, including when the loading task is cancelled.
struct LoadGuard<'a, K: Eq + Hash + Clone> {
    table: &'a Table<K>,
    key: K,
    released: Arc<Notify>,
}

impl<K: Eq + Hash + Clone> Drop for LoadGuard<'_, K> {
    fn drop(&mut self) {
        {
            let mut locks = self.table.locks();
            // an expired lock may already have been taken over by another loader
            if locks
                .get(&self.key)
                .is_some_and(|lock| Arc::ptr_eq(&lock.released, &self.released))
            {
                locks.remove(&self.key);
            }
        }
        self.released.notify_waiters();
    }
}

pub struct ChannelCache {
    store: Arc<dyn Store>,
    config: CacheConfig,
    store_timeout: Duration,
    by_uuid: Table<ChannelUuid>,
    by_address: Table<ChannelAddress>,
}

impl ChannelCache {
    pub fn new(store: Arc<dyn Store>, config: CacheConfig, store_timeout: Duration) -> Self {
        Self {
            store,
            config,
            store_timeout,
            by_uuid: Table::new(),
            by_address: Table::new(),
        }
    }

    pub async fn get_by_uuid(
        &self,
        channel_type: &ChannelType,
        uuid: ChannelUuid,
    ) -> Result<Arc<Channel>, BackendError> {
        let store = self.store.clone();
        let channel = self
            .get(&self.by_uuid, &uuid, || {
                let store = store.clone();
                async move { store.fetch_channel_by_uuid(uuid).await }
            })
            .await?
            .ok_or_else(|| channel_not_found(channel_type, &uuid.to_string()))?;
        check_type(channel, channel_type)
    }

    pub async fn get_by_address(
        &self,
        channel_type: &ChannelType,
        address: &ChannelAddress,
    ) -> Result<Arc<Channel>, BackendError> {
        if address.is_nil() {
            let channel = with_deadline(
                self.store_timeout,
                self.store.fetch_channel_by_address(address),
            )
            .await?
            .ok_or_else(|| channel_not_found(channel_type, "<no address>"))?;
            return check_type(Arc::new(channel), channel_type);
        }

        let store = self.store.clone();
        let channel = self
            .get(&self.by_address, address, || {
                let store = store.clone();
                let address = address.clone();
                async move { store.fetch_channel_by_address(&address).await }
            })
            .await?
            .ok_or_else(|| channel_not_found(channel_type, address.as_str()))?;
        check_type(channel, channel_type)
    }

    pub fn invalidate(&self, channel: &Channel) {
        self.by_uuid.evict(&channel.uuid);
        if !channel.address.is_nil() {
            self.by_address.evict(&channel.address);
        }
    }

    pub fn len(&self) -> usize {
        self.by_uuid.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // `Ok(None)` means the store definitively has no such channel.
    async fn get<K, F, Fut>(
        &self,
        table: &Table<K>,
        key: &K,
        fetch: F,
    ) -> Result<Option<Arc<Channel>>, BackendError>
    where
        K: Eq + Hash + Clone + std::fmt::Debug,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<Channel>, BackendError>>,
    {
        let lock_ttl = self.config.load_lock_ttl();
        let give_up_at = Instant::now() + lock_ttl;

        loop {
            if let Some((channel, expires_at)) = table.cached(key) {
                if expires_at > Instant::now() {
                    return Ok(Some(channel));
                }
                return self.refresh(table, key, channel, &fetch).await;
            }

            match table.try_lock(key, lock_ttl) {
                Ok(guard) => return self.load(table, key, &fetch, guard).await,
                Err(released) => {
                    if Instant::now() >= give_up_at {
                        return Err(BackendError::Unavailable(format!(
                            "timed out waiting for channel {key:?} to load"
                        )));
                    }
                    // woken early when the loader finishes, otherwise poll
                    let _ = tokio::time::timeout(self.config.poll_interval(), released.notified())
                        .await;
                }
            }
        }
    }

    async fn load<K, F, Fut>(
        &self,
        table: &Table<K>,
        key: &K,
        fetch: &F,
        guard: LoadGuard<'_, K>,
    ) -> Result<Option<Arc<Channel>>, BackendError>
    where
        K: Eq + Hash + Clone + std::fmt::Debug,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<Channel>, BackendError>>,
    {
        let fetched = with_deadline(self.store_timeout, fetch()).await;
        let result = match fetched {
            Ok(Some(channel)) => {
                let channel = Arc::new(channel);
                table.put(key, channel.clone(), Instant::now() + self.config.ttl());
                debug!("loaded channel {key:?} into cache");
                Ok(Some(channel))
            }
            Ok(None) => {
                table.evict(key);
                Ok(None)
            }
            Err(err) => Err(err),
        };
        // waiters are released only once the cache holds the outcome
        drop(guard);
        result
    }

    async fn refresh<K, F, Fut>(
        &self,
        table: &Table<K>,
        key: &K,
        stale: Arc<Channel>,
        fetch: &F,
    ) -> Result<Option<Arc<Channel>>, BackendError>
    where
        K: Eq + Hash + Clone + std::fmt::Debug,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<Channel>, BackendError>>,
    {
        let Ok(guard) = table.try_lock(key, self.config.load_lock_ttl()) else {
            // someone else is already reloading this key
            return Ok(Some(stale));
        };

        match self.load(table, key, fetch, guard).await {
            Ok(loaded) => Ok(loaded),
            Err(err) => {
                warn!("serving stale channel {key:?} after failed reload: {err}");
                Ok(Some(stale))
            }
        }
    }
}

fn check_type(channel: Arc<Channel>, expected: &ChannelType) -> Result<Arc<Channel>, BackendError> {
    if &channel.channel_type != expected {
        return Err(BackendError::WrongType {
            uuid: channel.uuid.to_string(),
            expected: expected.to_string(),
            actual: channel.channel_type.to_string(),
        });
    }
    Ok(channel)
}

pub fn channel_not_found(channel_type: &ChannelType, key: &str) -> BackendError {
    BackendError::not_found(Entity::Channel, format!("{channel_type}/{key}"))
}
