pub mod channel_cache;
pub mod config;
pub mod contacts;
pub mod db;
pub mod dedup;
pub mod error;
pub mod fast_store;
pub mod spool;
pub mod types;
pub mod urns;

pub use config::Config;
pub use error::BackendError;

use self::channel_cache::ChannelCache;
use self::config::{resolve_database_url, resolve_spool_dir};
use self::contacts::{ContactResolver, UrnDescriber};
use self::db::{with_deadline, SqlStore, Store};
use self::dedup::DedupEngine;
use self::error::Entity;
use self::fast_store::{FastStore, MemoryFastStore, RedisFastStore};
use self::spool::{write_to_spool, Spool, SpoolFlusher};
use self::types::{
    Channel, ChannelAddress, ChannelEvent, ChannelEventRow, ChannelType, ChannelUuid, Contact,
    ContactLastSeen, IncomingMsg, MsgRow, MsgUuid, WriteOutcome,
};
use self::urns::Urn;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MSGS_CATEGORY: &str = "msgs";
pub const CONTACT_LAST_SEEN_CATEGORY: &str = "contact_last_seen";
pub const CHANNEL_EVENTS_CATEGORY: &str = "channel_events";

pub struct Backend {
    store: Arc<dyn Store>,
    channels: ChannelCache,
    contacts: ContactResolver,
    dedup: DedupEngine,
    spool_dir: PathBuf,
    store_timeout: Duration,
}

pub async fn create_backend(config: Config) -> anyhow::Result<Backend> {
    let db_url = resolve_database_url(&config);
    let (pool, db_kind) = db::connect(&db_url, config.database.max_connections).await?;
    db::init_db(&pool, db_kind).await?;

    let fast_store: Arc<dyn FastStore> = match config.redis.url.as_deref() {
        Some(url) => Arc::new(RedisFastStore::connect(url).await?),
        None => {
            warn!("no redis url configured, dedup windows are local to this process");
            Arc::new(MemoryFastStore::new())
        }
    };

    let store: Arc<dyn Store> = Arc::new(SqlStore::new(pool, db_kind));
    info!("backend ready on {db_kind:?} store");
    Ok(Backend::new(store, fast_store, &config))
}

impl Backend {
    pub fn new(store: Arc<dyn Store>, fast_store: Arc<dyn FastStore>, config: &Config) -> Self {
        let store_timeout = config.store.timeout();
        Self {
            channels: ChannelCache::new(store.clone(), config.cache.clone(), store_timeout),
            contacts: ContactResolver::new(store.clone(), config.contacts.clone(), store_timeout),
            dedup: DedupEngine::new(fast_store, config.dedup.clone()),
            spool_dir: resolve_spool_dir(config),
            store,
            store_timeout,
        }
    }

    pub fn register_describer(&mut self, channel_type: ChannelType, describer: Arc<dyn UrnDescriber>) {
        self.contacts.register_describer(channel_type, describer);
    }

    pub fn channels(&self) -> &ChannelCache {
        &self.channels
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    pub async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: ChannelUuid,
    ) -> Result<Arc<Channel>, BackendError> {
        self.channels.get_by_uuid(channel_type, uuid).await
    }

    pub async fn get_channel_by_address(
        &self,
        channel_type: &ChannelType,
        address: &ChannelAddress,
    ) -> Result<Arc<Channel>, BackendError> {
        self.channels.get_by_address(channel_type, address).await
    }

    pub async fn resolve_contact(
        &self,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
        name: Option<&str>,
    ) -> Result<Contact, BackendError> {
        self.contacts.resolve(channel, urn, auth_token, name).await
    }

    pub async fn check_duplicate_incoming(&self, msg: &IncomingMsg) -> Result<Option<MsgUuid>, BackendError> {
        self.dedup.check_incoming(msg).await
    }

    pub async fn mark_seen(&self, msg: &IncomingMsg) -> Result<(), BackendError> {
        self.dedup.mark_seen(msg).await
    }

    pub async fn clear_seen(&self, channel_uuid: &ChannelUuid, urn_identity: &str) -> Result<(), BackendError> {
        self.dedup.clear_seen(channel_uuid, urn_identity).await
    }

    pub async fn check_external_id_seen(&self, msg: &IncomingMsg) -> Result<Option<MsgUuid>, BackendError> {
        match msg.external_id.as_deref() {
            Some(external_id) => self.dedup.check_external_id(&msg.channel_uuid, external_id).await,
            None => Ok(None),
        }
    }

    pub async fn write_external_id_seen(&self, msg: &IncomingMsg) -> Result<(), BackendError> {
        match msg.external_id.as_deref() {
            Some(external_id) => {
                self.dedup
                    .write_external_id_seen(&msg.channel_uuid, external_id, msg.uuid)
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn write_msg(&self, msg: &mut IncomingMsg) -> Result<WriteOutcome, BackendError> {
        match self.dedup.check_incoming(msg).await {
            Ok(Some(original)) => {
                msg.uuid = original;
                return Ok(WriteOutcome::Duplicate(original));
            }
            Ok(None) => {}
            Err(err) => warn!("dedup check failed for {}, treating as new: {err}", msg.uuid),
        }

        let outcome = match self.persist_msg(msg).await {
            Ok(()) => WriteOutcome::Persisted,
            Err(BackendError::Unavailable(reason)) => {
                let path = write_to_spool(&self.spool_dir, MSGS_CATEGORY, &*msg).await?;
                warn!("store unavailable ({reason}), spooled msg {} to {}", msg.uuid, path.display());
                WriteOutcome::Spooled
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.dedup.mark_seen(msg).await {
            warn!("failed to mark msg {} as seen: {err}", msg.uuid);
        }
        Ok(outcome)
    }

    async fn persist_msg(&self, msg: &IncomingMsg) -> Result<(), BackendError> {
        let channel = self.channels.get_by_uuid(&msg.channel_type, msg.channel_uuid).await?;
        let contact = self
            .contacts
            .resolve(&channel, &msg.urn, msg.urn_auth.as_deref(), msg.contact_name.as_deref())
            .await?;

        let row = MsgRow {
            uuid: msg.uuid,
            org_id: channel.org_id,
            channel_id: channel.id,
            contact_id: contact.id,
            contact_urn_id: contact.urn_id,
            text: msg.text.clone(),
            attachments: msg.attachments.clone(),
            external_id: msg.external_id.clone(),
            created_on: msg.received_on,
        };
        match with_deadline(self.store_timeout, self.store.insert_msg(&row)).await {
            Ok(()) => Ok(()),
            Err(BackendError::Conflict(_)) => {
                debug!("msg {} was already written", msg.uuid);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn write_contact_last_seen(&self, seen: &ContactLastSeen) -> Result<WriteOutcome, BackendError> {
        match self.persist_last_seen(seen).await {
            Ok(()) => Ok(WriteOutcome::Persisted),
            Err(BackendError::Unavailable(reason)) => {
                write_to_spool(&self.spool_dir, CONTACT_LAST_SEEN_CATEGORY, seen).await?;
                warn!("store unavailable ({reason}), spooled last seen of {}", seen.contact_uuid);
                Ok(WriteOutcome::Spooled)
            }
            Err(err) => Err(err),
        }
    }

    async fn persist_last_seen(&self, seen: &ContactLastSeen) -> Result<(), BackendError> {
        let updated = with_deadline(
            self.store_timeout,
            self.store
                .update_contact_last_seen(seen.contact_uuid, seen.last_seen_on),
        )
        .await?;
        if !updated {
            // contact deleted since; nothing left to update
            debug!("skipping last seen of missing contact {}", seen.contact_uuid);
        }
        Ok(())
    }

    pub async fn write_channel_event(&self, event: &ChannelEvent) -> Result<WriteOutcome, BackendError> {
        match self.persist_channel_event(event).await {
            Ok(()) => Ok(WriteOutcome::Persisted),
            Err(BackendError::Unavailable(reason)) => {
                write_to_spool(&self.spool_dir, CHANNEL_EVENTS_CATEGORY, event).await?;
                warn!("store unavailable ({reason}), spooled channel event {}", event.uuid);
                Ok(WriteOutcome::Spooled)
            }
            Err(err) => Err(err),
        }
    }

    async fn persist_channel_event(&self, event: &ChannelEvent) -> Result<(), BackendError> {
        let channel = self
            .channels
            .get_by_uuid(&event.channel_type, event.channel_uuid)
            .await?;
        let contact = self
            .contacts
            .resolve(&channel, &event.urn, None, event.contact_name.as_deref())
            .await?;
        let row = ChannelEventRow {
            uuid: event.uuid,
            org_id: channel.org_id,
            channel_id: channel.id,
            contact_id: contact.id,
            contact_urn_id: contact.urn_id,
            event_type: event.event_type.clone(),
            extra: event.extra.clone(),
            occurred_on: event.occurred_on,
        };
        match with_deadline(self.store_timeout, self.store.insert_channel_event(&row)).await {
            Ok(()) | Err(BackendError::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_msg_by_external_id(
        &self,
        channel: &Channel,
        external_id: &str,
    ) -> Result<MsgUuid, BackendError> {
        let deleted = with_deadline(
            self.store_timeout,
            self.store.delete_msg_by_external_id(channel.id, external_id),
        )
        .await?
        .ok_or_else(|| {
            BackendError::not_found(Entity::Msg, format!("{}/{external_id}", channel.uuid))
        })?;

        if let Some(identity) = deleted.urn_identity.as_deref() {
            if let Err(err) = self.dedup.clear_seen(&channel.uuid, identity).await {
                warn!("failed to clear seen fingerprint of deleted msg {}: {err}", deleted.uuid);
            }
        }
        Ok(deleted.uuid)
    }

    pub fn spool(self: &Arc<Self>) -> Spool {
        let mut spool = Spool::new(self.spool_dir.clone());
        spool.register(MSGS_CATEGORY, Arc::new(MsgReplayer(self.clone())));
        spool.register(CONTACT_LAST_SEEN_CATEGORY, Arc::new(LastSeenReplayer(self.clone())));
        spool.register(CHANNEL_EVENTS_CATEGORY, Arc::new(ChannelEventReplayer(self.clone())));
        spool
    }

    pub fn start_spool_worker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let spool = Arc::new(self.spool());
        tokio::spawn(spool.run(interval))
    }
}

// Only an undecodable file may be quarantined, so a `Malformed` raised while
// persisting keeps the file for the next pass.
fn replay_result(result: Result<(), BackendError>, filename: &str) -> Result<(), BackendError> {
    match result {
        Err(err @ (BackendError::NotFound { .. } | BackendError::WrongType { .. })) => {
            warn!("dropping spooled {filename}: {err}");
            Ok(())
        }
        Err(BackendError::Malformed(reason)) => Err(BackendError::Internal(reason)),
        other => other,
    }
}

struct MsgReplayer(Arc<Backend>);

#[async_trait]
impl SpoolFlusher for MsgReplayer {
    async fn flush(&self, filename: &str, contents: &[u8]) -> Result<(), BackendError> {
        let msg: IncomingMsg = serde_json::from_slice(contents)?;
        let result = self.0.persist_msg(&msg).await;
        if result.is_ok() {
            if let Err(err) = self.0.dedup.mark_seen(&msg).await {
                warn!("failed to mark replayed msg {} as seen: {err}", msg.uuid);
            }
        }
        replay_result(result, filename)
    }
}

struct LastSeenReplayer(Arc<Backend>);

#[async_trait]
impl SpoolFlusher for LastSeenReplayer {
    async fn flush(&self, filename: &str, contents: &[u8]) -> Result<(), BackendError> {
        let seen: ContactLastSeen = serde_json::from_slice(contents)?;
        replay_result(self.0.persist_last_seen(&seen).await, filename)
    }
}

struct ChannelEventReplayer(Arc<Backend>);

#[async_trait]
impl SpoolFlusher for ChannelEventReplayer {
    async fn flush(&self, filename: &str, contents: &[u8]) -> Result<(), BackendError> {
        let event: ChannelEvent = serde_json::from_slice(contents)?;
        let result = self.0.persist_channel_event(&event).await;
        replay_result(result, filename)
    }
}
