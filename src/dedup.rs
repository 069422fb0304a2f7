use crate::config::DedupConfig;
use crate::error::BackendError;
use crate::fast_store::FastStore;
use crate::types::{ChannelUuid, IncomingMsg, MsgUuid};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const MSG_WINDOW_SECS: i64 = 2;
pub const MSG_BUCKET_TTL: Duration = Duration::from_secs(5);
pub const EXTERNAL_ID_BUCKET_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

#[derive(Clone)]
pub struct DedupEngine {
    store: Arc<dyn FastStore>,
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn FastStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn msg_bucket_keys(&self, now: DateTime<Utc>) -> [String; 2] {
        let secs = now.timestamp();
        let current = secs - secs.rem_euclid(MSG_WINDOW_SECS);
        [
            format!("{}:{}", self.config.msgs_key, current),
            format!("{}:{}", self.config.msgs_key, current - MSG_WINDOW_SECS),
        ]
    }

    pub fn external_id_bucket_keys(&self, now: DateTime<Utc>) -> [String; 2] {
        let today = now.date_naive();
        let yesterday = (now - ChronoDuration::days(1)).date_naive();
        [
            format!("{}:{}", self.config.external_ids_key, today.format("%Y-%m-%d")),
            format!("{}:{}", self.config.external_ids_key, yesterday.format("%Y-%m-%d")),
        ]
    }

    pub async fn check_incoming(&self, msg: &IncomingMsg) -> Result<Option<MsgUuid>, BackendError> {
        self.check_incoming_at(Utc::now(), msg).await
    }

    pub async fn check_incoming_at(
        &self,
        now: DateTime<Utc>,
        msg: &IncomingMsg,
    ) -> Result<Option<MsgUuid>, BackendError> {
        let keys = self.msg_bucket_keys(now);
        let fingerprint = msg_fingerprint(&msg.channel_uuid, &msg.urn.identity());
        let Some(value) = self.store.hget_first(&keys, &fingerprint).await? else {
            return Ok(None);
        };

        let Some(seen) = SeenValue::parse(&value) else {
            debug!("ignoring unreadable dedup value for {fingerprint}");
            return Ok(None);
        };

        if seen.matches(msg) {
            debug!(msg_uuid = %seen.uuid, "duplicate incoming message for {fingerprint}");
            return Ok(Some(seen.uuid));
        }
        Ok(None)
    }

    pub async fn mark_seen(&self, msg: &IncomingMsg) -> Result<(), BackendError> {
        self.mark_seen_at(Utc::now(), msg).await
    }

    pub async fn mark_seen_at(&self, now: DateTime<Utc>, msg: &IncomingMsg) -> Result<(), BackendError> {
        let [current, _] = self.msg_bucket_keys(now);
        let fingerprint = msg_fingerprint(&msg.channel_uuid, &msg.urn.identity());
        let value = SeenValue::format(msg);
        self.store
            .hset_expire(&current, &fingerprint, &value, MSG_BUCKET_TTL)
            .await
    }

    pub async fn clear_seen(&self, channel_uuid: &ChannelUuid, urn_identity: &str) -> Result<(), BackendError> {
        self.clear_seen_at(Utc::now(), channel_uuid, urn_identity).await
    }

    pub async fn clear_seen_at(
        &self,
        now: DateTime<Utc>,
        channel_uuid: &ChannelUuid,
        urn_identity: &str,
    ) -> Result<(), BackendError> {
        let keys = self.msg_bucket_keys(now);
        self.store
            .hdel(&keys, &msg_fingerprint(channel_uuid, urn_identity))
            .await
    }

    pub async fn check_external_id(
        &self,
        channel_uuid: &ChannelUuid,
        external_id: &str,
    ) -> Result<Option<MsgUuid>, BackendError> {
        self.check_external_id_at(Utc::now(), channel_uuid, external_id)
            .await
    }

    pub async fn check_external_id_at(
        &self,
        now: DateTime<Utc>,
        channel_uuid: &ChannelUuid,
        external_id: &str,
    ) -> Result<Option<MsgUuid>, BackendError> {
        let keys = self.external_id_bucket_keys(now);
        let value = self
            .store
            .hget_first(&keys, &external_id_fingerprint(channel_uuid, external_id))
            .await?;
        Ok(value.and_then(|v| Uuid::parse_str(&v).ok()).map(MsgUuid))
    }

    pub async fn write_external_id_seen(
        &self,
        channel_uuid: &ChannelUuid,
        external_id: &str,
        msg_uuid: MsgUuid,
    ) -> Result<(), BackendError> {
        self.write_external_id_seen_at(Utc::now(), channel_uuid, external_id, msg_uuid)
            .await
    }

    pub async fn write_external_id_seen_at(
        &self,
        now: DateTime<Utc>,
        channel_uuid: &ChannelUuid,
        external_id: &str,
        msg_uuid: MsgUuid,
    ) -> Result<(), BackendError> {
        let [current, _] = self.external_id_bucket_keys(now);
        self.store
            .hset_expire(
                &current,
                &external_id_fingerprint(channel_uuid, external_id),
                &msg_uuid.to_string(),
                EXTERNAL_ID_BUCKET_TTL,
            )
            .await
    }
}

pub fn msg_fingerprint(channel_uuid: &ChannelUuid, urn_identity: &str) -> String {
    format!("{channel_uuid}|{urn_identity}")
}

pub fn external_id_fingerprint(channel_uuid: &ChannelUuid, external_id: &str) -> String {
    format!("{channel_uuid}|{external_id}")
}

// Stored as `uuid|external_id|text`; text goes last so it may contain `|`.
#[derive(Debug, PartialEq)]
struct SeenValue<'a> {
    uuid: MsgUuid,
    external_id: &'a str,
    text: &'a str,
}

impl<'a> SeenValue<'a> {
    fn format(msg: &IncomingMsg) -> String {
        format!(
            "{}|{}|{}",
            msg.uuid,
            msg.external_id.as_deref().unwrap_or(""),
            msg.text
        )
    }

    fn parse(value: &'a str) -> Option<Self> {
        let mut parts = value.splitn(3, '|');
        let uuid = Uuid::parse_str(parts.next()?).ok()?;
        let external_id = parts.next()?;
        let text = parts.next()?;
        Some(Self {
            uuid: MsgUuid(uuid),
            external_id,
            text,
        })
    }

    fn matches(&self, msg: &IncomingMsg) -> bool {
        if self.text == msg.text {
            return true;
        }
        // media messages may carry a fresh text rendering; trust the provider's id
        match (msg.external_id.as_deref(), msg.attachments.is_empty()) {
            (Some(external_id), false) => !self.external_id.is_empty() && self.external_id == external_id,
            _ => false,
        }
    }
}
