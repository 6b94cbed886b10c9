//! Persistent data model: pairing sessions, clients, activity log
//!
//! Rows are owned by the store; the auth and server crates operate on these
//! types without touching SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a paired client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Generate a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of companion device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Phone-class device
    Phone,
    /// Tablet-class device
    Tablet,
    /// Wall-mounted or desktop panel
    Panel,
    /// Web browser
    Browser,
    /// Unknown/other device
    #[default]
    Unknown,
}

impl std::str::FromStr for DeviceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "phone" | "mobile" => Ok(Self::Phone),
            "tablet" => Ok(Self::Tablet),
            "panel" | "desktop" => Ok(Self::Panel),
            "browser" | "web" => Ok(Self::Browser),
            _ => Ok(Self::Unknown),
        }
    }
}

impl DeviceType {
    /// Stable string form used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Panel => "panel",
            DeviceType::Browser => "browser",
            DeviceType::Unknown => "unknown",
        }
    }
}

/// An ephemeral pairing session tracking one PIN's validity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSession {
    pub id: Uuid,
    /// The 6-digit PIN, leading zeros preserved
    pub pin: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set exactly once, on successful pairing completion
    pub used: bool,
}

impl PairingSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A paired client device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    /// Human-readable name (e.g., "Kitchen Tablet")
    pub name: String,
    pub device_type: DeviceType,
    /// Client-supplied public key; globally unique across all clients
    pub public_key: String,
    /// Server-issued trust token, 64 lowercase hex chars
    pub certificate: String,
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Transitions only active -> inactive; never reactivated automatically
    pub is_active: bool,
    pub metadata: Value,
}

/// Fields required to insert a new client
#[derive(Debug, Clone)]
pub struct NewClient {
    pub id: ClientId,
    pub name: String,
    pub device_type: DeviceType,
    pub public_key: String,
    pub certificate: String,
    pub paired_at: DateTime<Utc>,
    pub metadata: Value,
}

/// Partial update applied to a client row; None fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct ClientPatch {
    pub name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
    pub metadata: Option<Value>,
}

impl ClientPatch {
    pub fn last_seen(now: DateTime<Utc>) -> Self {
        Self {
            last_seen: Some(now),
            ..Self::default()
        }
    }

    pub fn deactivate() -> Self {
        Self {
            is_active: Some(false),
            ..Self::default()
        }
    }
}

/// Summary of a client for API responses; never includes the certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: ClientId,
    pub name: String,
    pub device_type: DeviceType,
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
}

impl From<&Client> for ClientSummary {
    fn from(client: &Client) -> Self {
        Self {
            id: client.id,
            name: client.name.clone(),
            device_type: client.device_type,
            paired_at: client.paired_at,
            last_seen: client.last_seen,
            is_active: client.is_active,
        }
    }
}

/// One row of the append-only audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: i64,
    pub client_id: Option<ClientId>,
    pub action: String,
    pub details: Option<String>,
    pub ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}
