use crate::error::BackendError;
use crate::types::{
    Channel, ChannelAddress, ChannelEventRow, ChannelId, ChannelType, ChannelUuid, ConfigMap,
    Contact, ContactId, ContactStatus, ContactUrnId, MsgRow, MsgUuid, NewContact, OrgId,
};
use crate::urns::Urn;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_URN_PRIORITY: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::time::timeout(deadline, fut).await?
}

#[derive(Debug, Clone, PartialEq)]
pub enum UrnClaim {
    Created(Contact),
    // The URN turned out to belong to another contact; nothing was committed.
    OwnedByOther(ContactId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletedMsg {
    pub uuid: MsgUuid,
    pub urn_identity: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_channel_by_uuid(&self, uuid: ChannelUuid) -> Result<Option<Channel>, BackendError>;

    async fn fetch_channel_by_address(
        &self,
        address: &ChannelAddress,
    ) -> Result<Option<Channel>, BackendError>;

    async fn lookup_contact_by_identity(
        &self,
        org_id: OrgId,
        identity: &str,
    ) -> Result<Option<Contact>, BackendError>;

    // Oldest-modified contact owning a URN whose identity matches `pattern`.
    // The returned contact's `urn_id` is the matched URN.
    async fn lookup_contact_by_pattern(
        &self,
        org_id: OrgId,
        pattern: &str,
    ) -> Result<Option<Contact>, BackendError>;

    async fn update_urn_identity(&self, urn_id: ContactUrnId, urn: &Urn) -> Result<(), BackendError>;

    async fn attach_urn(
        &self,
        contact: &Contact,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
    ) -> Result<Option<ContactUrnId>, BackendError>;

    // Inserts the contact and its URN in one transaction. A concurrent insert of
    // the same URN surfaces as `BackendError::Conflict`.
    async fn insert_contact_with_urn(
        &self,
        contact: &NewContact,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
    ) -> Result<UrnClaim, BackendError>;

    async fn insert_msg(&self, msg: &MsgRow) -> Result<(), BackendError>;

    async fn update_contact_last_seen(
        &self,
        contact_uuid: Uuid,
        last_seen_on: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    async fn insert_channel_event(&self, event: &ChannelEventRow) -> Result<(), BackendError>;

    async fn delete_msg_by_external_id(
        &self,
        channel_id: ChannelId,
        external_id: &str,
    ) -> Result<Option<DeletedMsg>, BackendError>;
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn id_column(kind: DbKind) -> &'static str {
    match kind {
        DbKind::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        DbKind::Postgres => "BIGSERIAL PRIMARY KEY",
    }
}

pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<(AnyPool, DbKind)> {
    sqlx::any::install_default_drivers();
    let kind = db_kind_from_url(url);
    let pool = AnyPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await?;
    Ok((pool, kind))
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> anyhow::Result<()> {
    let id = id_column(kind);
    let stmts = vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS orgs (
            id {id},
            name TEXT NOT NULL,
            is_anon BIGINT NOT NULL DEFAULT 0,
            config TEXT
        )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS channels (
            id {id},
            uuid TEXT NOT NULL UNIQUE,
            org_id BIGINT NOT NULL,
            channel_type TEXT NOT NULL,
            name TEXT,
            schemes TEXT NOT NULL,
            address TEXT,
            country TEXT,
            role TEXT NOT NULL,
            config TEXT,
            is_active BIGINT NOT NULL DEFAULT 1
        )"#
        ),
        "CREATE INDEX IF NOT EXISTS idx_channels_address ON channels(address)".to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS contacts (
            id {id},
            uuid TEXT NOT NULL UNIQUE,
            org_id BIGINT NOT NULL,
            name TEXT,
            status TEXT NOT NULL,
            created_on BIGINT NOT NULL,
            modified_on BIGINT NOT NULL,
            last_seen_on BIGINT,
            is_active BIGINT NOT NULL DEFAULT 1
        )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS contact_urns (
            id {id},
            org_id BIGINT NOT NULL,
            contact_id BIGINT,
            identity TEXT NOT NULL,
            scheme TEXT NOT NULL,
            path TEXT NOT NULL,
            display TEXT,
            channel_id BIGINT,
            auth_token TEXT,
            priority BIGINT NOT NULL,
            UNIQUE (org_id, identity)
        )"#
        ),
        "CREATE INDEX IF NOT EXISTS idx_contact_urns_contact ON contact_urns(contact_id)"
            .to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS msgs (
            id {id},
            uuid TEXT NOT NULL UNIQUE,
            org_id BIGINT NOT NULL,
            channel_id BIGINT NOT NULL,
            contact_id BIGINT NOT NULL,
            contact_urn_id BIGINT,
            direction TEXT NOT NULL,
            status TEXT NOT NULL,
            visibility TEXT NOT NULL,
            text TEXT NOT NULL,
            attachments TEXT,
            external_id TEXT,
            created_on BIGINT NOT NULL,
            modified_on BIGINT NOT NULL
        )"#
        ),
        "CREATE INDEX IF NOT EXISTS idx_msgs_external ON msgs(channel_id, external_id)"
            .to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS channel_events (
            id {id},
            uuid TEXT NOT NULL UNIQUE,
            org_id BIGINT NOT NULL,
            channel_id BIGINT NOT NULL,
            contact_id BIGINT NOT NULL,
            contact_urn_id BIGINT,
            event_type TEXT NOT NULL,
            extra TEXT,
            occurred_on BIGINT NOT NULL,
            created_on BIGINT NOT NULL
        )"#
        ),
    ];

    for stmt in stmts {
        sqlx::query(&stmt).execute(pool).await?;
    }

    Ok(())
}

pub async fn insert_org(
    pool: &AnyPool,
    kind: DbKind,
    name: &str,
    is_anon: bool,
    config: &ConfigMap,
) -> anyhow::Result<OrgId> {
    let sql = rewrite_sql(
        "INSERT INTO orgs (name, is_anon, config) VALUES (?, ?, ?) RETURNING id",
        kind,
    );
    let id = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(name)
        .bind(is_anon as i64)
        .bind(serde_json::to_string(config)?)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

pub async fn insert_channel(pool: &AnyPool, kind: DbKind, channel: &Channel) -> anyhow::Result<ChannelId> {
    let sql = rewrite_sql(
        r#"INSERT INTO channels (uuid, org_id, channel_type, name, schemes, address, country, role, config, is_active)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1) RETURNING id"#,
        kind,
    );
    let id = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(channel.uuid.to_string())
        .bind(channel.org_id)
        .bind(channel.channel_type.as_str())
        .bind(channel.name.as_deref())
        .bind(serde_json::to_string(&channel.schemes)?)
        .bind(channel.address.as_str())
        .bind(channel.country.as_deref())
        .bind(&channel.role)
        .bind(serde_json::to_string(&channel.config)?)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

pub async fn deactivate_channel(pool: &AnyPool, kind: DbKind, uuid: ChannelUuid) -> anyhow::Result<()> {
    let sql = rewrite_sql("UPDATE channels SET is_active = 0 WHERE uuid = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(uuid.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

// On sqlite the any driver rejects NULL for Option<T> and can narrow large
// integers, so nullable columns are read as '' and millisecond timestamps as text.
const CHANNEL_COLUMNS: &str = r#"c.id, c.uuid, c.org_id, c.channel_type, COALESCE(c.name, '') AS name,
    c.schemes, COALESCE(c.address, '') AS address, COALESCE(c.country, '') AS country, c.role,
    COALESCE(c.config, '') AS config, COALESCE(o.config, '') AS org_config, o.is_anon"#;

const CONTACT_COLUMNS: &str = r#"c.id, c.uuid, c.org_id, COALESCE(c.name, '') AS name, c.status,
    CAST(c.created_on AS TEXT) AS created_on, CAST(c.modified_on AS TEXT) AS modified_on,
    COALESCE(CAST(c.last_seen_on AS TEXT), '') AS last_seen_on, u.id AS urn_id"#;

fn parse_uuid(raw: &str, entity: &str) -> Result<Uuid, BackendError> {
    Uuid::parse_str(raw).map_err(|err| BackendError::Malformed(format!("{entity} uuid {raw:?}: {err}")))
}

fn optional_text(row: &AnyRow, column: &str) -> Result<Option<String>, BackendError> {
    let value: String = row.try_get(column)?;
    Ok(Some(value).filter(|v| !v.is_empty()))
}

fn ms_column(row: &AnyRow, column: &str) -> Result<Option<i64>, BackendError> {
    optional_text(row, column)?
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|err| BackendError::Internal(format!("column {column} holds {raw:?}: {err}")))
        })
        .transpose()
}

fn required_ms(row: &AnyRow, column: &str) -> Result<i64, BackendError> {
    ms_column(row, column)?.ok_or_else(|| BackendError::Internal(format!("column {column} is empty")))
}

fn channel_from_row(row: &AnyRow) -> Result<Channel, BackendError> {
    let uuid: String = row.try_get("uuid")?;
    let schemes: String = row.try_get("schemes")?;
    let config = optional_text(row, "config")?;
    let org_config = optional_text(row, "org_config")?;
    let address = optional_text(row, "address")?;
    let is_anon: i64 = row.try_get("is_anon")?;
    let channel_type: String = row.try_get("channel_type")?;

    Ok(Channel {
        id: row.try_get("id")?,
        uuid: ChannelUuid(parse_uuid(&uuid, "channel")?),
        org_id: row.try_get("org_id")?,
        channel_type: ChannelType::new(&channel_type),
        name: optional_text(row, "name")?,
        schemes: serde_json::from_str(&schemes).unwrap_or_default(),
        address: address.map(|a| ChannelAddress::new(&a)).unwrap_or(ChannelAddress::NIL),
        country: optional_text(row, "country")?,
        role: row.try_get("role")?,
        config: config
            .and_then(|v| serde_json::from_str(&v).ok())
            .map(ConfigMap::from_value)
            .unwrap_or_default(),
        org_config: org_config
            .and_then(|v| serde_json::from_str(&v).ok())
            .map(ConfigMap::from_value)
            .unwrap_or_default(),
        org_is_anon: is_anon != 0,
    })
}

fn contact_from_row(row: &AnyRow) -> Result<Contact, BackendError> {
    let uuid: String = row.try_get("uuid")?;
    let status: String = row.try_get("status")?;
    let created_on = required_ms(row, "created_on")?;
    let modified_on = required_ms(row, "modified_on")?;
    let last_seen_on = ms_column(row, "last_seen_on")?;

    Ok(Contact {
        id: row.try_get("id")?,
        uuid: parse_uuid(&uuid, "contact")?,
        org_id: row.try_get("org_id")?,
        name: optional_text(row, "name")?,
        status: ContactStatus::from_code(&status),
        created_on: ms_to_datetime(created_on),
        modified_on: ms_to_datetime(modified_on),
        last_seen_on: last_seen_on.map(ms_to_datetime),
        urn_id: Some(row.try_get::<i64, _>("urn_id")?),
    })
}

#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlStore {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    async fn fetch_channel_where(&self, clause: &str, value: String) -> Result<Option<Channel>, BackendError> {
        let sql = format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels c JOIN orgs o ON o.id = c.org_id WHERE {clause} AND c.is_active = 1 LIMIT 1"
        );
        let sql = rewrite_sql(&sql, self.kind);
        let row = sqlx::query(sql.as_ref())
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(channel_from_row).transpose()
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn fetch_channel_by_uuid(&self, uuid: ChannelUuid) -> Result<Option<Channel>, BackendError> {
        self.fetch_channel_where("c.uuid = ?", uuid.to_string()).await
    }

    async fn fetch_channel_by_address(
        &self,
        address: &ChannelAddress,
    ) -> Result<Option<Channel>, BackendError> {
        if address.is_nil() {
            return Ok(None);
        }
        self.fetch_channel_where("c.address = ?", address.as_str().to_string())
            .await
    }

    async fn lookup_contact_by_identity(
        &self,
        org_id: OrgId,
        identity: &str,
    ) -> Result<Option<Contact>, BackendError> {
        let sql = format!(
            r#"SELECT {CONTACT_COLUMNS}
               FROM contact_urns u JOIN contacts c ON c.id = u.contact_id
               WHERE u.org_id = ? AND u.identity = ? AND c.is_active = 1
               LIMIT 1"#
        );
        let sql = rewrite_sql(&sql, self.kind);
        let row = sqlx::query(sql.as_ref())
            .bind(org_id)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn lookup_contact_by_pattern(
        &self,
        org_id: OrgId,
        pattern: &str,
    ) -> Result<Option<Contact>, BackendError> {
        let sql = format!(
            r#"SELECT {CONTACT_COLUMNS}
               FROM contact_urns u JOIN contacts c ON c.id = u.contact_id
               WHERE u.org_id = ? AND u.identity LIKE ? ESCAPE '\' AND c.is_active = 1
               ORDER BY c.modified_on ASC, c.id ASC
               LIMIT 1"#
        );
        let sql = rewrite_sql(&sql, self.kind);
        let row = sqlx::query(sql.as_ref())
            .bind(org_id)
            .bind(pattern)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn update_urn_identity(&self, urn_id: ContactUrnId, urn: &Urn) -> Result<(), BackendError> {
        let sql = rewrite_sql(
            "UPDATE contact_urns SET identity = ?, path = ?, display = ? WHERE id = ?",
            self.kind,
        );
        sqlx::query(sql.as_ref())
            .bind(urn.identity())
            .bind(urn.path())
            .bind(urn.display())
            .bind(urn_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn attach_urn(
        &self,
        contact: &Contact,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
    ) -> Result<Option<ContactUrnId>, BackendError> {
        // ownership only moves through resolution restarts, never here
        let sql = rewrite_sql(
            r#"INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, display, channel_id, auth_token, priority)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (org_id, identity) DO UPDATE SET
                   contact_id = excluded.contact_id,
                   channel_id = excluded.channel_id,
                   display = COALESCE(excluded.display, contact_urns.display),
                   auth_token = COALESCE(excluded.auth_token, contact_urns.auth_token),
                   priority = excluded.priority
               WHERE contact_urns.contact_id = excluded.contact_id OR contact_urns.contact_id IS NULL
               RETURNING id"#,
            self.kind,
        );
        let urn_id = sqlx::query_scalar::<_, i64>(sql.as_ref())
            .bind(contact.org_id)
            .bind(contact.id)
            .bind(urn.identity())
            .bind(urn.scheme())
            .bind(urn.path())
            .bind(urn.display())
            .bind(channel.id)
            .bind(auth_token)
            .bind(DEFAULT_URN_PRIORITY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(urn_id)
    }

    async fn insert_contact_with_urn(
        &self,
        contact: &NewContact,
        channel: &Channel,
        urn: &Urn,
        auth_token: Option<&str>,
    ) -> Result<UrnClaim, BackendError> {
        let now = datetime_to_ms(contact.created_on);
        let mut tx = self.pool.begin().await?;

        let sql = rewrite_sql(
            r#"INSERT INTO contacts (uuid, org_id, name, status, created_on, modified_on, last_seen_on, is_active)
               VALUES (?, ?, ?, ?, ?, ?, NULL, 1) RETURNING id"#,
            self.kind,
        );
        let contact_id = sqlx::query_scalar::<_, i64>(sql.as_ref())
            .bind(contact.uuid.to_string())
            .bind(contact.org_id)
            .bind(contact.name.as_deref())
            .bind(ContactStatus::Active.code())
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        let sql = rewrite_sql(
            "SELECT id, COALESCE(contact_id, 0) AS contact_id FROM contact_urns WHERE org_id = ? AND identity = ?",
            self.kind,
        );
        let existing = sqlx::query(sql.as_ref())
            .bind(contact.org_id)
            .bind(urn.identity())
            .fetch_optional(&mut *tx)
            .await?;

        let urn_id = match existing {
            Some(row) => {
                let urn_id: i64 = row.try_get("id")?;
                let owner: i64 = row.try_get("contact_id")?;
                if owner != 0 && owner != contact_id {
                    tx.rollback().await?;
                    return Ok(UrnClaim::OwnedByOther(owner));
                }
                let sql = rewrite_sql(
                    r#"UPDATE contact_urns SET contact_id = ?, channel_id = ?, auth_token = COALESCE(?, auth_token), priority = ?
                       WHERE id = ?"#,
                    self.kind,
                );
                sqlx::query(sql.as_ref())
                    .bind(contact_id)
                    .bind(channel.id)
                    .bind(auth_token)
                    .bind(DEFAULT_URN_PRIORITY)
                    .bind(urn_id)
                    .execute(&mut *tx)
                    .await?;
                urn_id
            }
            None => {
                let sql = rewrite_sql(
                    r#"INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, display, channel_id, auth_token, priority)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id"#,
                    self.kind,
                );
                // a unique violation here rolls back when `tx` drops
                sqlx::query_scalar::<_, i64>(sql.as_ref())
                    .bind(contact.org_id)
                    .bind(contact_id)
                    .bind(urn.identity())
                    .bind(urn.scheme())
                    .bind(urn.path())
                    .bind(urn.display())
                    .bind(channel.id)
                    .bind(auth_token)
                    .bind(DEFAULT_URN_PRIORITY)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };

        tx.commit().await?;

        Ok(UrnClaim::Created(Contact {
            id: contact_id,
            uuid: contact.uuid,
            org_id: contact.org_id,
            name: contact.name.clone(),
            status: ContactStatus::Active,
            created_on: contact.created_on,
            modified_on: contact.created_on,
            last_seen_on: None,
            urn_id: Some(urn_id),
        }))
    }

    async fn insert_msg(&self, msg: &MsgRow) -> Result<(), BackendError> {
        let sql = rewrite_sql(
            r#"INSERT INTO msgs (
                uuid, org_id, channel_id, contact_id, contact_urn_id, direction, status, visibility,
                text, attachments, external_id, created_on, modified_on
            ) VALUES (?, ?, ?, ?, ?, 'I', 'P', 'V', ?, ?, ?, ?, ?)"#,
            self.kind,
        );
        let created = datetime_to_ms(msg.created_on);
        sqlx::query(sql.as_ref())
            .bind(msg.uuid.to_string())
            .bind(msg.org_id)
            .bind(msg.channel_id)
            .bind(msg.contact_id)
            .bind(msg.contact_urn_id)
            .bind(&msg.text)
            .bind(serde_json::to_string(&msg.attachments)?)
            .bind(msg.external_id.as_deref())
            .bind(created)
            .bind(created)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_contact_last_seen(
        &self,
        contact_uuid: Uuid,
        last_seen_on: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let sql = rewrite_sql(
            "UPDATE contacts SET last_seen_on = ?, modified_on = ? WHERE uuid = ? AND is_active = 1",
            self.kind,
        );
        let result = sqlx::query(sql.as_ref())
            .bind(datetime_to_ms(last_seen_on))
            .bind(datetime_to_ms(Utc::now()))
            .bind(contact_uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_channel_event(&self, event: &ChannelEventRow) -> Result<(), BackendError> {
        let sql = rewrite_sql(
            r#"INSERT INTO channel_events (
                uuid, org_id, channel_id, contact_id, contact_urn_id, event_type, extra, occurred_on, created_on
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            self.kind,
        );
        sqlx::query(sql.as_ref())
            .bind(event.uuid.to_string())
            .bind(event.org_id)
            .bind(event.channel_id)
            .bind(event.contact_id)
            .bind(event.contact_urn_id)
            .bind(&event.event_type)
            .bind(serde_json::to_string(&event.extra)?)
            .bind(datetime_to_ms(event.occurred_on))
            .bind(datetime_to_ms(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_msg_by_external_id(
        &self,
        channel_id: ChannelId,
        external_id: &str,
    ) -> Result<Option<DeletedMsg>, BackendError> {
        let sql = rewrite_sql(
            r#"SELECT m.id, m.uuid, COALESCE(u.identity, '') AS identity
               FROM msgs m LEFT JOIN contact_urns u ON u.id = m.contact_urn_id
               WHERE m.channel_id = ? AND m.external_id = ? AND m.visibility <> 'X'
               ORDER BY m.id DESC
               LIMIT 1"#,
            self.kind,
        );
        let Some(row) = sqlx::query(sql.as_ref())
            .bind(channel_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let uuid: String = row.try_get("uuid")?;
        let urn_identity = optional_text(&row, "identity")?;

        let sql = rewrite_sql(
            "UPDATE msgs SET visibility = 'X', text = '', attachments = NULL, modified_on = ? WHERE id = ?",
            self.kind,
        );
        sqlx::query(sql.as_ref())
            .bind(datetime_to_ms(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(Some(DeletedMsg {
            uuid: MsgUuid(parse_uuid(&uuid, "msg")?),
            urn_identity,
        }))
    }
}
