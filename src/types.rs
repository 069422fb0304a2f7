use crate::urns::Urn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub type OrgId = i64;
pub type ChannelId = i64;
pub type ContactId = i64;
pub type ContactUrnId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelUuid(pub Uuid);

impl ChannelUuid {
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(ChannelUuid)
    }
}

impl fmt::Display for ChannelUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgUuid(pub Uuid);

impl MsgUuid {
    pub fn new() -> Self {
        MsgUuid(Uuid::new_v4())
    }
}

impl Default for MsgUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MsgUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(pub String);

impl ChannelType {
    pub fn new(tag: &str) -> Self {
        ChannelType(tag.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelAddress(pub String);

impl ChannelAddress {
    // Many channels share "no address", so it never identifies one.
    pub const NIL: ChannelAddress = ChannelAddress(String::new());

    pub fn new(address: &str) -> Self {
        ChannelAddress(address.trim().to_string())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap(pub Map<String, Value>);

impl ConfigMap {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => ConfigMap(map),
            _ => ConfigMap::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    pub fn bool(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn int(&self, key: &str, default: i64) -> i64 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub uuid: ChannelUuid,
    pub org_id: OrgId,
    pub channel_type: ChannelType,
    pub name: Option<String>,
    pub schemes: Vec<String>,
    pub address: ChannelAddress,
    pub country: Option<String>,
    pub role: String,
    pub config: ConfigMap,
    pub org_config: ConfigMap,
    pub org_is_anon: bool,
}

impl Channel {
    pub fn has_role(&self, role: char) -> bool {
        self.role.contains(role)
    }

    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactStatus {
    Active,
    Blocked,
    Stopped,
    Archived,
}

impl ContactStatus {
    pub fn code(&self) -> &'static str {
        match self {
            ContactStatus::Active => "A",
            ContactStatus::Blocked => "B",
            ContactStatus::Stopped => "S",
            ContactStatus::Archived => "V",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "B" => ContactStatus::Blocked,
            "S" => ContactStatus::Stopped,
            "V" => ContactStatus::Archived,
            _ => ContactStatus::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: Option<String>,
    pub status: ContactStatus,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub last_seen_on: Option<DateTime<Utc>>,
    pub urn_id: Option<ContactUrnId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewContact {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: Option<String>,
    pub created_on: DateTime<Utc>,
}

pub trait RowIdentity {
    fn row_id(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMsg {
    pub uuid: MsgUuid,
    pub channel_uuid: ChannelUuid,
    pub channel_type: ChannelType,
    pub urn: Urn,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub external_id: Option<String>,
    pub received_on: DateTime<Utc>,
    pub contact_name: Option<String>,
    pub urn_auth: Option<String>,
}

impl IncomingMsg {
    pub fn new(channel: &Channel, urn: Urn, text: &str, external_id: Option<&str>) -> Self {
        Self {
            uuid: MsgUuid::new(),
            channel_uuid: channel.uuid,
            channel_type: channel.channel_type.clone(),
            urn,
            text: text.to_string(),
            attachments: Vec::new(),
            external_id: external_id.map(|s| s.to_string()),
            received_on: Utc::now(),
            contact_name: None,
            urn_auth: None,
        }
    }

    pub fn with_attachment(mut self, url: &str, content_type: Option<&str>) -> Self {
        self.attachments.push(Attachment {
            url: url.to_string(),
            content_type: content_type.map(|s| s.to_string()),
        });
        self
    }

    pub fn with_contact_name(mut self, name: &str) -> Self {
        self.contact_name = Some(name.to_string());
        self
    }
}

impl RowIdentity for IncomingMsg {
    fn row_id(&self) -> String {
        self.uuid.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgRow {
    pub uuid: MsgUuid,
    pub org_id: OrgId,
    pub channel_id: ChannelId,
    pub contact_id: ContactId,
    pub contact_urn_id: Option<ContactUrnId>,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub external_id: Option<String>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactLastSeen {
    pub contact_uuid: Uuid,
    pub last_seen_on: DateTime<Utc>,
}

impl RowIdentity for ContactLastSeen {
    fn row_id(&self) -> String {
        self.contact_uuid.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub uuid: Uuid,
    pub channel_uuid: ChannelUuid,
    pub channel_type: ChannelType,
    pub event_type: String,
    pub urn: Urn,
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub occurred_on: DateTime<Utc>,
    pub contact_name: Option<String>,
}

impl RowIdentity for ChannelEvent {
    fn row_id(&self) -> String {
        self.uuid.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEventRow {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub channel_id: ChannelId,
    pub contact_id: ContactId,
    pub contact_urn_id: Option<ContactUrnId>,
    pub event_type: String,
    pub extra: Map<String, Value>,
    pub occurred_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted,
    Duplicate(MsgUuid),
    Spooled,
}
