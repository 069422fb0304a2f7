use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msg_gateway::config::Config;
use msg_gateway::db::{self, DeletedMsg, SqlStore, Store, UrnClaim};
use msg_gateway::error::{BackendError, Entity};
use msg_gateway::fast_store::MemoryFastStore;
use msg_gateway::types::{
    Channel, ChannelAddress, ChannelEvent, ChannelEventRow, ChannelId, ChannelType, ChannelUuid,
    ConfigMap, Contact, ContactLastSeen, ContactUrnId, IncomingMsg, MsgRow, NewContact, OrgId,
    WriteOutcome,
};
use msg_gateway::urns::Urn;
use msg_gateway::{Backend, CHANNEL_EVENTS_CATEGORY, CONTACT_LAST_SEEN_CATEGORY, MSGS_CATEGORY};
use serde_json::json;
use sqlx::AnyPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// SQL store that can be switched off to simulate an outage.
struct FlakyStore {
    inner: SqlStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn fetch_channel_by_uuid(&self, uuid: ChannelUuid) -> Result<Option<Channel>, BackendError> {
        self.check()?;
        self.inner.fetch_channel_by_uuid(uuid).await
    }

    async fn fetch_channel_by_address(
        &self,
        address: &ChannelAddress,
    ) -> Result<Option<Channel>, BackendError> {
        self.check()?;
        self.inner.fetch_channel_by_address(address).await
    }

    async fn lookup_contact_by_identity(
        &self,
        org_id: OrgId,
        identity: &str,
    ) -> Result<Option<Contact>, BackendError> {
        self.check()?;
        self.inner.lookup_contact_by_identity(org_id, identity).await
    }

    async fn lookup_contact_by_pattern(
        &self,
        org_id: OrgId,
        pattern: &str,
    ) -> Result<Option<Contact>, BackendError> {
        self.check()?;
        self.inner.lookup_contact_by_pattern(org_id, pattern).await
    }

    async fn update_urn_identity(&self, urn_id: ContactUrnId, urn: &Urn) -> Result<(), BackendError> {
        self.check()?;
        self.inner.update_urn_identity(urn_id, urn).await
    }

    async fn attach_urn(
        &self,
        contact: &Contact,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
    ) -> Result<Option<ContactUrnId>, BackendError> {
        self.check()?;
        self.inner.attach_urn(contact, channel, urn, auth_token).await
    }

    async fn insert_contact_with_urn(
        &self,
        contact: &NewContact,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
    ) -> Result<UrnClaim, BackendError> {
        self.check()?;
        self.inner
            .insert_contact_with_urn(contact, channel, urn, auth_token)
            .await
    }

    async fn insert_msg(&self, msg: &MsgRow) -> Result<(), BackendError> {
        self.check()?;
        self.inner.insert_msg(msg).await
    }

    async fn update_contact_last_seen(
        &self,
        contact_uuid: Uuid,
        last_seen_on: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.update_contact_last_seen(contact_uuid, last_seen_on).await
    }

    async fn insert_channel_event(&self, event: &ChannelEventRow) -> Result<(), BackendError> {
        self.check()?;
        self.inner.insert_channel_event(event).await
    }

    async fn delete_msg_by_external_id(
        &self,
        channel_id: ChannelId,
        external_id: &str,
    ) -> Result<Option<DeletedMsg>, BackendError> {
        self.check()?;
        self.inner.delete_msg_by_external_id(channel_id, external_id).await
    }
}

struct Harness {
    _temp_dir: TempDir,
    config: Config,
    pool: AnyPool,
    store: Arc<FlakyStore>,
    fast_store: Arc<MemoryFastStore>,
    backend: Arc<Backend>,
    channel: Channel,
}

impl Harness {
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.spool.dir = temp_dir.path().join("spool").to_string_lossy().into_owned();

        let url = format!("sqlite://{}?mode=rwc", temp_dir.path().join("state.sqlite").display());
        let (pool, kind) = db::connect(&url, 4).await.unwrap();
        db::init_db(&pool, kind).await.unwrap();

        let org_id = db::insert_org(&pool, kind, "Acme", false, &ConfigMap::default())
            .await
            .unwrap();
        let mut channel = Channel {
            id: 0,
            uuid: ChannelUuid(Uuid::new_v4()),
            org_id,
            channel_type: ChannelType::new("TG"),
            name: Some("Acme bot".to_string()),
            schemes: vec!["telegram".to_string()],
            address: ChannelAddress::new("acme_bot"),
            country: None,
            role: "SR".to_string(),
            config: ConfigMap::default(),
            org_config: ConfigMap::default(),
            org_is_anon: false,
        };
        channel.id = db::insert_channel(&pool, kind, &channel).await.unwrap();

        let store = Arc::new(FlakyStore {
            inner: SqlStore::new(pool.clone(), kind),
            down: AtomicBool::new(false),
        });
        let fast_store = Arc::new(MemoryFastStore::new());
        let backend = Arc::new(Backend::new(store.clone(), fast_store.clone(), &config));

        Self {
            _temp_dir: temp_dir,
            config,
            pool,
            store,
            fast_store,
            backend,
            channel,
        }
    }

    /// A fresh backend over the same store and spool, as after a restart.
    fn restarted(&self) -> Arc<Backend> {
        Arc::new(Backend::new(self.store.clone(), self.fast_store.clone(), &self.config))
    }

    fn msg(&self, text: &str, external_id: Option<&str>) -> IncomingMsg {
        IncomingMsg::new(&self.channel, Urn::parse("telegram:4242#sam").unwrap(), text, external_id)
            .with_contact_name("Sam")
    }

    async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_get_channel_by_uuid_and_address() {
    let h = Harness::new().await;
    let tg = ChannelType::new("TG");

    let by_uuid = h.backend.get_channel(&tg, h.channel.uuid).await.unwrap();
    assert_eq!(by_uuid.id, h.channel.id);
    let by_address = h
        .backend
        .get_channel_by_address(&tg, &ChannelAddress::new("acme_bot"))
        .await
        .unwrap();
    assert_eq!(by_address.uuid, h.channel.uuid);
    assert_eq!(h.backend.channels().len(), 1);

    let err = h
        .backend
        .get_channel(&ChannelType::new("WAC"), h.channel.uuid)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::WrongType { .. }));
}

#[tokio::test]
async fn test_write_msg_persists_then_dedups() {
    let h = Harness::new().await;

    let mut first = h.msg("hello", Some("tg-1"));
    assert_eq!(h.backend.write_msg(&mut first).await.unwrap(), WriteOutcome::Persisted);
    assert_eq!(h.count("msgs").await, 1);
    assert_eq!(h.count("contacts").await, 1);

    let mut retry = h.msg("hello", Some("tg-1"));
    let outcome = h.backend.write_msg(&mut retry).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Duplicate(first.uuid));
    assert_eq!(retry.uuid, first.uuid);
    assert_eq!(h.count("msgs").await, 1);

    let mut different = h.msg("something else", Some("tg-2"));
    assert_eq!(h.backend.write_msg(&mut different).await.unwrap(), WriteOutcome::Persisted);
    assert_eq!(h.count("msgs").await, 2);
    assert_eq!(h.count("contacts").await, 1);
}

#[tokio::test]
async fn test_resolve_contact_through_backend() {
    let h = Harness::new().await;
    let urn = Urn::parse("telegram:4242").unwrap();

    let contact = h
        .backend
        .resolve_contact(&h.channel, &urn, None, Some("Sam"))
        .await
        .unwrap();
    assert_eq!(contact.name.as_deref(), Some("Sam"));

    let again = h.backend.resolve_contact(&h.channel, &urn, None, None).await.unwrap();
    assert_eq!(again.id, contact.id);
}

#[tokio::test]
async fn test_external_id_seen_round_trip() {
    let h = Harness::new().await;
    let msg = h.msg("hello", Some("wamid.77"));

    assert_eq!(h.backend.check_external_id_seen(&msg).await.unwrap(), None);
    h.backend.write_external_id_seen(&msg).await.unwrap();
    assert_eq!(h.backend.check_external_id_seen(&msg).await.unwrap(), Some(msg.uuid));

    let no_id = h.msg("hello", None);
    assert_eq!(h.backend.check_external_id_seen(&no_id).await.unwrap(), None);
}

#[tokio::test]
async fn test_explicit_dedup_operations() {
    let h = Harness::new().await;
    let msg = h.msg("ping", None);

    h.backend.mark_seen(&msg).await.unwrap();
    let retry = h.msg("ping", None);
    assert_eq!(h.backend.check_duplicate_incoming(&retry).await.unwrap(), Some(msg.uuid));

    h.backend
        .clear_seen(&h.channel.uuid, &msg.urn.identity())
        .await
        .unwrap();
    assert_eq!(h.backend.check_duplicate_incoming(&retry).await.unwrap(), None);
}

#[tokio::test]
async fn test_outage_spools_and_replay_persists() {
    let h = Harness::new().await;

    h.store.set_down(true);
    let mut msg = h.msg("written during outage", Some("tg-9"));
    assert_eq!(h.backend.write_msg(&mut msg).await.unwrap(), WriteOutcome::Spooled);
    assert_eq!(h.count("msgs").await, 0);

    let spool = h.backend.spool();
    assert_eq!(spool.pending(MSGS_CATEGORY).await.len(), 1);

    // the spooled copy is acknowledged, so a redelivery is a duplicate
    let mut redelivered = h.msg("written during outage", Some("tg-9"));
    assert_eq!(
        h.backend.write_msg(&mut redelivered).await.unwrap(),
        WriteOutcome::Duplicate(msg.uuid)
    );

    // still down: the file stays put
    assert_eq!(spool.flush_once().await.retained, 1);

    h.store.set_down(false);
    let stats = spool.flush_once().await;
    assert_eq!(stats.flushed, 1);
    assert!(spool.pending(MSGS_CATEGORY).await.is_empty());

    let uuid: String = sqlx::query_scalar("SELECT uuid FROM msgs")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(uuid, msg.uuid.to_string());
}

#[tokio::test]
async fn test_replaying_twice_writes_once() {
    let h = Harness::new().await;

    h.store.set_down(true);
    let mut msg = h.msg("hello", None);
    h.backend.write_msg(&mut msg).await.unwrap();
    h.store.set_down(false);

    // a copy of the file left behind by a crash between write and delete
    let spool = h.backend.spool();
    let pending = spool.pending(MSGS_CATEGORY).await;
    let copy = pending[0].with_file_name(format!("9999999999999_{}.json", msg.uuid));
    std::fs::copy(&pending[0], &copy).unwrap();

    let stats = spool.flush_once().await;
    assert_eq!(stats.flushed, 2);
    assert_eq!(h.count("msgs").await, 1);
}

#[tokio::test]
async fn test_spooled_msg_for_removed_channel_is_dropped() {
    let h = Harness::new().await;

    h.store.set_down(true);
    let mut msg = h.msg("hello", None);
    h.backend.write_msg(&mut msg).await.unwrap();
    h.store.set_down(false);

    db::deactivate_channel(&h.pool, db::DbKind::Sqlite, h.channel.uuid)
        .await
        .unwrap();
    let backend = h.restarted();
    let spool = backend.spool();

    let stats = spool.flush_once().await;
    assert_eq!(stats.flushed, 1);
    assert!(spool.pending(MSGS_CATEGORY).await.is_empty());
    assert!(spool.quarantined(MSGS_CATEGORY).await.is_empty());
    assert_eq!(h.count("msgs").await, 0);
}

#[tokio::test]
async fn test_corrupt_spool_file_is_quarantined() {
    let h = Harness::new().await;
    let dir = h.backend.spool_dir().join(MSGS_CATEGORY);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("1700000000000_bad.json"), b"{\"uuid\": 12").unwrap();

    let spool = h.backend.spool();
    let stats = spool.flush_once().await;

    assert_eq!(stats.quarantined, 1);
    assert_eq!(spool.quarantined(MSGS_CATEGORY).await.len(), 1);
}

#[tokio::test]
async fn test_replay_failure_after_decoding_keeps_file() {
    let h = Harness::new().await;

    h.store.set_down(true);
    let mut msg = h.msg("hello", None);
    h.backend.write_msg(&mut msg).await.unwrap();
    h.store.set_down(false);

    // a stored contact row whose uuid cannot be parsed
    let contact_id: i64 = sqlx::query_scalar(
        "INSERT INTO contacts (uuid, org_id, status, created_on, modified_on, is_active) VALUES ('not-a-uuid', ?, 'A', 1, 1, 1) RETURNING id",
    )
    .bind(h.channel.org_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, priority) VALUES (?, ?, 'telegram:4242', 'telegram', '4242', 1000)",
    )
    .bind(h.channel.org_id)
    .bind(contact_id)
    .execute(&h.pool)
    .await
    .unwrap();

    let spool = h.backend.spool();
    let stats = spool.flush_once().await;
    assert_eq!(stats.retained, 1);
    assert_eq!(stats.quarantined, 0);
    assert_eq!(spool.pending(MSGS_CATEGORY).await.len(), 1);
    assert!(spool.quarantined(MSGS_CATEGORY).await.is_empty());
}

#[tokio::test]
async fn test_contact_last_seen_spool_and_replay() {
    let h = Harness::new().await;
    let contact = h
        .backend
        .resolve_contact(&h.channel, &Urn::parse("telegram:4242").unwrap(), None, None)
        .await
        .unwrap();
    let seen = ContactLastSeen {
        contact_uuid: contact.uuid,
        last_seen_on: Utc::now(),
    };

    h.store.set_down(true);
    assert_eq!(
        h.backend.write_contact_last_seen(&seen).await.unwrap(),
        WriteOutcome::Spooled
    );
    h.store.set_down(false);

    let spool = h.backend.spool();
    assert_eq!(spool.pending(CONTACT_LAST_SEEN_CATEGORY).await.len(), 1);
    assert_eq!(spool.flush_once().await.flushed, 1);

    let last_seen: String = sqlx::query_scalar("SELECT CAST(last_seen_on AS TEXT) FROM contacts")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(last_seen, seen.last_seen_on.timestamp_millis().to_string());
}

#[tokio::test]
async fn test_last_seen_of_missing_contact_is_skipped() {
    let h = Harness::new().await;
    let seen = ContactLastSeen {
        contact_uuid: Uuid::new_v4(),
        last_seen_on: Utc::now(),
    };
    assert_eq!(
        h.backend.write_contact_last_seen(&seen).await.unwrap(),
        WriteOutcome::Persisted
    );
}

#[tokio::test]
async fn test_channel_event_write_and_replay() {
    let h = Harness::new().await;
    let mut extra = serde_json::Map::new();
    extra.insert("ctwa_clid".to_string(), json!("ARAkLk"));
    let event = ChannelEvent {
        uuid: Uuid::new_v4(),
        channel_uuid: h.channel.uuid,
        channel_type: h.channel.channel_type.clone(),
        event_type: "referral".to_string(),
        urn: Urn::parse("telegram:4242").unwrap(),
        extra,
        occurred_on: Utc::now(),
        contact_name: None,
    };

    assert_eq!(h.backend.write_channel_event(&event).await.unwrap(), WriteOutcome::Persisted);
    assert_eq!(h.count("channel_events").await, 1);

    h.store.set_down(true);
    let later = ChannelEvent {
        uuid: Uuid::new_v4(),
        ..event.clone()
    };
    assert_eq!(h.backend.write_channel_event(&later).await.unwrap(), WriteOutcome::Spooled);
    h.store.set_down(false);

    let spool = h.backend.spool();
    assert_eq!(spool.pending(CHANNEL_EVENTS_CATEGORY).await.len(), 1);
    assert_eq!(spool.flush_once().await.flushed, 1);
    assert_eq!(h.count("channel_events").await, 2);
    assert_eq!(h.count("contacts").await, 1);
}

#[tokio::test]
async fn test_delete_msg_by_external_id_clears_fingerprint() {
    let h = Harness::new().await;
    let mut msg = h.msg("oops", Some("tg-del"));
    h.backend.write_msg(&mut msg).await.unwrap();

    let deleted = h
        .backend
        .delete_msg_by_external_id(&h.channel, "tg-del")
        .await
        .unwrap();
    assert_eq!(deleted, msg.uuid);

    // the same text is accepted again as a new message
    let mut resent = h.msg("oops", Some("tg-del"));
    assert_eq!(h.backend.write_msg(&mut resent).await.unwrap(), WriteOutcome::Persisted);
    assert_ne!(resent.uuid, msg.uuid);

    let err = h
        .backend
        .delete_msg_by_external_id(&h.channel, "tg-unknown")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BackendError::NotFound {
            entity: Entity::Msg,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unknown_channel_is_not_spooled() {
    let h = Harness::new().await;
    let mut msg = h.msg("hello", None);
    msg.channel_uuid = ChannelUuid(Uuid::new_v4());

    let err = h.backend.write_msg(&mut msg).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(h.backend.spool().pending(MSGS_CATEGORY).await.is_empty());
}
