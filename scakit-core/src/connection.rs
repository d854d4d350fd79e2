//! Enrolled provider connections and their resolved key material.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use scakit_secure_store::{PrivateKeyHandle, SharedSecret};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Protocol generation a connection was enrolled under. Connections keep
/// whichever generation they joined with; the codec and signer are selected
/// per connection, never globally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    /// RSA-wrapped-AES payloads, raw RSA-SHA256 request signatures.
    #[default]
    V1,
    /// DH-derived shared-secret AES payloads, detached-JWS signatures.
    V2,
}

/// Lifecycle status of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Enrollment started but the access token has not been issued yet.
    #[default]
    Inactive,
    /// Fully enrolled, may issue signed requests.
    Active,
    /// Revoked locally or by the provider; pending deletion.
    Revoked,
}

/// One enrolled relationship with a provider.
///
/// A connection with a non-empty access token owns exactly one private key
/// under alias = `guid` in the secure key store; deleting the connection
/// must delete that key entry in the same operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Local identifier; doubles as the key alias.
    pub guid: String,
    /// Server-side identifier.
    pub id: String,
    /// Base URL of the provider API.
    pub connect_url: String,
    /// Opaque bearer credential issued at enrollment.
    pub access_token: String,
    /// Protocol generation.
    pub api_version: ApiVersion,
    /// Record status.
    pub status: ConnectionStatus,
    /// Provider's DH public key, base64 (V2 only).
    pub provider_dh_public_key: Option<String>,
    /// Alias of the app's DH key pair in the key store (V2 only).
    pub dh_key_alias: Option<String>,
}

impl Connection {
    /// Creates an inactive connection with a fresh guid for `connect_url`.
    #[must_use]
    pub fn new<S: Into<String>>(connect_url: S, api_version: ApiVersion) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            id: String::new(),
            connect_url: connect_url.into(),
            access_token: String::new(),
            api_version,
            status: ConnectionStatus::Inactive,
            provider_dh_public_key: None,
            dh_key_alias: None,
        }
    }
}

/// Ephemeral pairing of a connection with its resolved key material.
///
/// Built on demand immediately before a signed call and dropped with the
/// operation's scope, so a revoked connection never signs with a stale key.
pub struct RichConnection {
    /// The connection record.
    pub connection: Connection,
    /// Signing/unwrapping capability; the private key never leaves the
    /// key store.
    pub private_key: Arc<dyn PrivateKeyHandle>,
    /// DH-derived symmetric key, present for V2 connections only. Held in
    /// memory for this pairing's lifetime and zeroized on drop.
    pub shared_secret: Option<SharedSecret>,
}

impl std::fmt::Debug for RichConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RichConnection")
            .field("connection", &self.connection.guid)
            .field("shared_secret", &"[REDACTED]")
            .finish()
    }
}

/// Abstract persisted-record store for connections. The engine requires no
/// schema beyond the [`Connection`] fields.
pub trait ConnectionRepository: Send + Sync {
    /// Looks up a connection by its local identifier.
    fn by_guid(&self, guid: &str) -> Option<Connection>;

    /// Returns every active connection.
    fn all_active(&self) -> Vec<Connection>;

    /// Persists `connection`, replacing any record with the same guid.
    fn save(&self, connection: Connection);

    /// Removes the record for `guid`. Returns `true` if a record existed.
    fn delete(&self, guid: &str) -> bool;

    /// Replaces the access token of the record for `guid` and marks it
    /// active.
    fn update_access_token(&self, guid: &str, access_token: &str);
}

/// In-memory [`ConnectionRepository`], used on targets without persistence
/// and as a test double.
#[derive(Default)]
pub struct MemoryConnectionRepository {
    records: RwLock<HashMap<String, Connection>>,
}

impl MemoryConnectionRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Connection>> {
        self.records.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Connection>> {
        self.records.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ConnectionRepository for MemoryConnectionRepository {
    fn by_guid(&self, guid: &str) -> Option<Connection> {
        self.read().get(guid).cloned()
    }

    fn all_active(&self) -> Vec<Connection> {
        self.read()
            .values()
            .filter(|connection| connection.status == ConnectionStatus::Active)
            .cloned()
            .collect()
    }

    fn save(&self, connection: Connection) {
        self.write().insert(connection.guid.clone(), connection);
    }

    fn delete(&self, guid: &str) -> bool {
        self.write().remove(guid).is_some()
    }

    fn update_access_token(&self, guid: &str, access_token: &str) {
        if let Some(record) = self.write().get_mut(guid) {
            access_token.clone_into(&mut record.access_token);
            record.status = ConnectionStatus::Active;
        }
    }
}
