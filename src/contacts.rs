use crate::config::ContactsConfig;
use crate::db::{with_deadline, Store, UrnClaim};
use crate::error::BackendError;
use crate::types::{Channel, ChannelType, Contact, NewContact};
use crate::urns::Urn;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait UrnDescriber: Send + Sync {
    async fn describe_urn(&self, channel: &Channel, urn: &Urn) -> anyhow::Result<HashMap<String, String>>;
}

enum Attempt {
    Resolved(Contact),
    Restart(String),
}

pub struct ContactResolver {
    store: Arc<dyn Store>,
    config: ContactsConfig,
    store_timeout: Duration,
    describers: HashMap<ChannelType, Arc<dyn UrnDescriber>>,
}

impl ContactResolver {
    pub fn new(store: Arc<dyn Store>, config: ContactsConfig, store_timeout: Duration) -> Self {
        Self {
            store,
            config,
            store_timeout,
            describers: HashMap::new(),
        }
    }

    pub fn register_describer(&mut self, channel_type: ChannelType, describer: Arc<dyn UrnDescriber>) {
        self.describers.insert(channel_type, describer);
    }

    pub async fn resolve(
        &self,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Contact, BackendError> {
        let max_attempts = self.config.max_resolve_attempts.max(1);
        let mut name = None;

        for attempt in 1..=max_attempts {
            let reason = match self
                .attempt(channel, urn, auth_token, display_name, &mut name)
                .await
            {
                Ok(Attempt::Resolved(contact)) => return Ok(contact),
                Ok(Attempt::Restart(reason)) => reason,
                Err(BackendError::Conflict(reason)) => reason,
                Err(err) => return Err(err),
            };
            debug!(attempt, "restarting resolution of {}: {reason}", urn.identity());
        }

        Err(BackendError::Conflict(format!(
            "ownership of {} still contended after {max_attempts} attempts",
            urn.identity()
        )))
    }

    async fn attempt(
        &self,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
        display_name: Option<&str>,
        name: &mut Option<Option<String>>,
    ) -> Result<Attempt, BackendError> {
        if let Some((contact, matched)) = self.lookup(channel, urn).await? {
            let attached = with_deadline(
                self.store_timeout,
                self.store.attach_urn(&contact, channel, &matched, auth_token),
            )
            .await?;
            return Ok(match attached {
                Some(urn_id) => Attempt::Resolved(Contact {
                    urn_id: Some(urn_id),
                    ..contact
                }),
                None => Attempt::Restart(format!("{} moved to another contact", matched.identity())),
            });
        }

        if name.is_none() {
            *name = Some(self.contact_name(channel, urn, display_name).await);
        }
        let contact = NewContact {
            uuid: Uuid::new_v4(),
            org_id: channel.org_id,
            name: name.clone().flatten(),
            created_on: Utc::now(),
        };

        let claim = with_deadline(
            self.store_timeout,
            self.store
                .insert_contact_with_urn(&contact, channel, urn, auth_token),
        )
        .await?;

        Ok(match claim {
            UrnClaim::Created(contact) => {
                debug!(contact_uuid = %contact.uuid, "created contact for {}", urn.identity());
                Attempt::Resolved(contact)
            }
            UrnClaim::OwnedByOther(owner) => {
                Attempt::Restart(format!("{} already owned by contact {owner}", urn.identity()))
            }
        })
    }

    async fn lookup(&self, channel: &Channel, urn: &Urn) -> Result<Option<(Contact, Urn)>, BackendError> {
        let org_id = channel.org_id;

        let found = with_deadline(
            self.store_timeout,
            self.store.lookup_contact_by_identity(org_id, &urn.identity()),
        )
        .await?;
        if let Some(contact) = found {
            return Ok(Some((contact, urn.clone())));
        }

        if let Some(pattern) = urn.identity_pattern() {
            let found = with_deadline(
                self.store_timeout,
                self.store.lookup_contact_by_pattern(org_id, &pattern),
            )
            .await?;
            if let Some(contact) = found {
                if let Some(urn_id) = contact.urn_id {
                    with_deadline(self.store_timeout, self.store.update_urn_identity(urn_id, urn)).await?;
                }
                return Ok(Some((contact, urn.clone())));
            }
        }

        if let Some(alternate) = urn.alternate() {
            let found = with_deadline(
                self.store_timeout,
                self.store.lookup_contact_by_identity(org_id, &alternate.identity()),
            )
            .await?;
            if let Some(contact) = found {
                debug!("matched {} through alternate form {}", urn.identity(), alternate.identity());
                return Ok(Some((contact, alternate)));
            }
        }

        Ok(None)
    }

    async fn contact_name(&self, channel: &Channel, urn: &Urn, display_name: Option<&str>) -> Option<String> {
        if channel.org_is_anon {
            return None;
        }
        let name = match display_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => Some(name.to_string()),
            None => self.describe(channel, urn).await,
        };
        name.map(|n| truncate_chars(&n, self.config.max_name_length))
    }

    async fn describe(&self, channel: &Channel, urn: &Urn) -> Option<String> {
        let describer = self.describers.get(&channel.channel_type)?;
        let timeout = Duration::from_millis(self.config.describe_timeout_ms);
        match tokio::time::timeout(timeout, describer.describe_urn(channel, urn)).await {
            Ok(Ok(attrs)) => attrs
                .get("name")
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            Ok(Err(err)) => {
                warn!("describing {} on channel {} failed: {err:#}", urn.identity(), channel.uuid);
                None
            }
            Err(_) => {
                warn!("describing {} on channel {} timed out", urn.identity(), channel.uuid);
                None
            }
        }
    }
}

pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
