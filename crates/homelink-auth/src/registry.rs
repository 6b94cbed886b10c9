//! Client identity registry and pairing protocol handler
//!
//! Binds public keys to client identities, issues and verifies trust tokens,
//! and handles revocation. The "certificate" here is an opaque hash-derived
//! shared secret bound to the pairing event; it proves possession of the
//! token itself, not of the private key behind the submitted public key.

use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Utc};
use homelink_store::{Client, ClientId, ClientPatch, DeviceType, NewClient, Store};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// Request to complete pairing with a previously issued PIN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    /// The 6-digit PIN shown by the coordinator
    pub pin: String,
    /// Human-readable device name
    pub device_name: String,
    /// Device type hint ("phone", "tablet", "panel", "browser")
    pub device_type: String,
    /// Client-generated public key; one identity per key, ever
    pub public_key: String,
    /// Optional client metadata (app version, platform details)
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Registry of paired clients: identity binding, trust-token verification,
/// revocation, and activity tracking.
pub struct ClientRegistry {
    store: Arc<Store>,
}

impl ClientRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Complete a pairing handshake: validate the PIN, bind the public key to
    /// a new client identity, and issue its certificate.
    ///
    /// The certificate is returned exactly once, inside the new [`Client`];
    /// it is never re-sent afterward. Expired, unknown, and concurrently
    /// consumed PINs all fail with the same generic authentication error.
    pub async fn complete_pairing(
        &self,
        request: PairingRequest,
        ip: Option<&str>,
    ) -> AuthResult<Client> {
        validate_request(&request)?;

        let now = Utc::now();
        let session = self
            .store
            .get_pairing_session(&request.pin)
            .await?
            .ok_or_else(AuthError::invalid_pin)?;
        if session.is_expired(now) {
            warn!("Pairing attempt with expired PIN");
            return Err(AuthError::invalid_pin());
        }

        if self
            .store
            .get_client_by_public_key(&request.public_key)
            .await?
            .is_some()
        {
            warn!("Pairing attempt with already-bound public key");
            return Err(AuthError::Conflict("public key already paired".to_string()));
        }

        let device_type: DeviceType = request.device_type.parse().unwrap_or_default();
        let certificate = derive_certificate(&request.public_key, now);

        let client = self
            .store
            .create_client(NewClient {
                id: ClientId::new(),
                name: request.device_name,
                device_type,
                public_key: request.public_key,
                certificate,
                paired_at: now,
                metadata: request.metadata.unwrap_or_else(|| Value::Object(Default::default())),
            })
            .await
            .map_err(|e| match e {
                homelink_store::StoreError::Duplicate(_) => {
                    AuthError::Conflict("public key already paired".to_string())
                }
                other => AuthError::Store(other),
            })?;

        // The single atomic consumption of the PIN. Zero rows means another
        // completion (or expiry) won the race; roll back the insert so no
        // partial state survives.
        let rows = self
            .store
            .mark_pairing_session_used(&request.pin, now)
            .await?;
        if rows != 1 {
            warn!("PIN consumed concurrently, rolling back client {}", client.id);
            let _ = self.store.delete_client(&client.id).await;
            return Err(AuthError::invalid_pin());
        }

        self.store
            .log_activity(
                Some(client.id),
                "pairing_completed",
                Some(&format!("{} ({})", client.name, client.device_type.as_str())),
                ip,
            )
            .await?;
        info!("Client {} paired ({})", client.id, client.device_type.as_str());

        Ok(client)
    }

    /// Verify a client's trust token.
    ///
    /// Unknown and revoked clients fail verification; token comparison is
    /// constant-time over equal-length buffers, and a length mismatch is a
    /// non-match without any positional leak.
    pub async fn verify_certificate(
        &self,
        client_id: &ClientId,
        certificate: &str,
    ) -> AuthResult<bool> {
        let client = match self.store.get_client(client_id).await? {
            Some(client) => client,
            None => return Ok(false),
        };
        if !client.is_active {
            return Ok(false);
        }
        Ok(bool::from(
            client
                .certificate
                .as_bytes()
                .ct_eq(certificate.as_bytes()),
        ))
    }

    /// Disable a client's ability to authenticate.
    ///
    /// Idempotent: revoking an already-inactive client succeeds without
    /// logging a second event. Clients are never reactivated.
    pub async fn revoke(&self, client_id: &ClientId, ip: Option<&str>) -> AuthResult<()> {
        let client = self
            .store
            .get_client(client_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("unknown client: {}", client_id)))?;
        if !client.is_active {
            return Ok(());
        }
        self.store
            .update_client(client_id, &ClientPatch::deactivate())
            .await?;
        self.store
            .log_activity(Some(*client_id), "client_revoked", Some(&client.name), ip)
            .await?;
        info!("Client {} revoked", client_id);
        Ok(())
    }

    /// Hard-delete a client record (administrative action)
    pub async fn remove(&self, client_id: &ClientId, ip: Option<&str>) -> AuthResult<()> {
        let client = self
            .store
            .get_client(client_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("unknown client: {}", client_id)))?;
        self.store.delete_client(client_id).await?;
        self.store
            .log_activity(Some(*client_id), "client_deleted", Some(&client.name), ip)
            .await?;
        Ok(())
    }

    /// Record client liveness. Does not check is_active; enforcement happens
    /// at the authentication boundary.
    pub async fn update_activity(&self, client_id: &ClientId) -> AuthResult<()> {
        let updated = self
            .store
            .update_client(client_id, &ClientPatch::last_seen(Utc::now()))
            .await?;
        if !updated {
            return Err(AuthError::NotFound(format!("unknown client: {}", client_id)));
        }
        Ok(())
    }

    /// All paired clients, newest first
    pub async fn list(&self) -> AuthResult<Vec<Client>> {
        Ok(self.store.list_clients().await?)
    }

    /// Fetch a single client
    pub async fn get(&self, client_id: &ClientId) -> AuthResult<Option<Client>> {
        Ok(self.store.get_client(client_id).await?)
    }
}

fn validate_request(request: &PairingRequest) -> AuthResult<()> {
    if request.pin.len() != 6 || !request.pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthError::Validation(
            "pin must be exactly 6 digits".to_string(),
        ));
    }
    if request.device_name.trim().is_empty() {
        return Err(AuthError::Validation("device_name is required".to_string()));
    }
    if request.public_key.trim().is_empty() {
        return Err(AuthError::Validation("public_key is required".to_string()));
    }
    Ok(())
}

/// Derive the opaque trust token bound to this pairing event:
/// hex(sha256(public_key || issue_time_millis || 32 random bytes)).
fn derive_certificate(public_key: &str, issued_at: DateTime<Utc>) -> String {
    let nonce: [u8; 32] = rand::thread_rng().gen();
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_bytes());
    hasher.update(issued_at.timestamp_millis().to_be_bytes());
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}
