//! Per-connection key lifecycle.
//!
//! The key manager is the only component that touches the secure key store.
//! It creates keys at enrollment, resolves a [`RichConnection`] immediately
//! before a signed call, and deletes keys synchronously with the connection
//! record so no orphan window exists in either direction.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use scakit_secure_store::{DhKeyHandle, SecureKeyStore, SharedSecret};
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;

use crate::{
    connection::{ApiVersion, Connection, ConnectionRepository, RichConnection},
    error::ScaError,
};

/// HKDF info label binding derived keys to this protocol.
const KDF_LABEL: &[u8] = b"scakit:connection-key";

/// Public key material produced at enrollment and sent to the provider.
#[derive(Debug, Clone)]
pub struct EnrollmentKeys {
    /// SPKI PEM of the connection's signing key.
    pub public_key_pem: String,
    /// Base64 of the app's DH public key (V2 only).
    pub dh_public_key: Option<String>,
}

/// Creates, resolves and deletes connection key material.
pub struct KeyManager {
    store: Arc<dyn SecureKeyStore>,
    repository: Arc<dyn ConnectionRepository>,
}

impl KeyManager {
    /// Creates a manager over the given store and repository.
    pub fn new(store: Arc<dyn SecureKeyStore>, repository: Arc<dyn ConnectionRepository>) -> Self {
        Self { store, repository }
    }

    /// Generates the key material for a new connection under alias = guid
    /// and returns the public halves for the enrollment handshake. For V2
    /// connections an additional DH key pair is created and its alias
    /// recorded on the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ScaError::Crypto`] if key generation fails.
    pub fn enroll(&self, connection: &mut Connection) -> Result<EnrollmentKeys, ScaError> {
        let signing = self.store.create_or_replace_key_pair(&connection.guid)?;
        let public_key_pem = signing.public_key_pem()?;

        let dh_public_key = if connection.api_version == ApiVersion::V2 {
            let alias = format!("{}:dh", connection.guid);
            let dh = self.store.create_or_replace_dh_key_pair(&alias)?;
            connection.dh_key_alias = Some(alias);
            Some(STANDARD.encode(dh.public_key()))
        } else {
            None
        };

        Ok(EnrollmentKeys {
            public_key_pem,
            dh_public_key,
        })
    }

    /// Resolves `connection` into a [`RichConnection`] for a single signed
    /// operation. V2 connections get their shared secret derived here; the
    /// result must not be cached beyond the operation's scope.
    ///
    /// # Errors
    ///
    /// Returns [`ScaError::KeyUnavailable`] if the signing or DH key entry
    /// is missing; the caller must treat this as non-retryable for the
    /// connection until re-enrollment.
    pub fn resolve(&self, connection: &Connection) -> Result<RichConnection, ScaError> {
        let private_key = self
            .store
            .private_key(&connection.guid)
            .ok_or_else(|| ScaError::key_unavailable(&connection.guid))?;

        let shared_secret = if connection.api_version == ApiVersion::V2 {
            let alias = connection
                .dh_key_alias
                .as_deref()
                .ok_or_else(|| ScaError::key_unavailable(&connection.guid))?;
            let dh = self
                .store
                .dh_key(alias)
                .ok_or_else(|| ScaError::key_unavailable(alias))?;
            let provider_public = connection
                .provider_dh_public_key
                .as_deref()
                .ok_or_else(|| ScaError::Crypto("provider dh public key missing".to_owned()))?;
            Some(derive_shared_secret(dh.as_ref(), provider_public)?)
        } else {
            None
        };

        Ok(RichConnection {
            connection: connection.clone(),
            private_key,
            shared_secret,
        })
    }

    /// Deletes the record and the key entries of `connection` in one call.
    /// Returns `true` if the record existed.
    pub fn purge(&self, connection: &Connection) -> bool {
        let existed = self.repository.delete(&connection.guid);
        self.store.delete_key(&connection.guid);
        if let Some(alias) = connection.dh_key_alias.as_deref() {
            self.store.delete_key(alias);
        }
        existed
    }

    /// Removes every connection record and every key entry. Used by the
    /// lockout wipe; partial failures are logged and never abort the purge.
    pub fn wipe(&self) {
        for connection in self.repository.all_active() {
            if !self.repository.delete(&connection.guid) {
                tracing::warn!(guid = %connection.guid, "wipe: record already gone");
            }
        }
        self.store.delete_all();
        tracing::info!("wipe: local connections and keys removed");
    }
}

/// Derives the per-connection symmetric key from an X25519 agreement with
/// the provider's public key, via HKDF-SHA256. Both sides bind the two
/// public keys into the derivation.
///
/// # Errors
///
/// Returns [`ScaError::Crypto`] if the provider key is malformed or the
/// agreement is rejected.
pub fn derive_shared_secret(
    dh: &dyn DhKeyHandle,
    provider_public_b64: &str,
) -> Result<SharedSecret, ScaError> {
    let decoded = STANDARD
        .decode(provider_public_b64)
        .map_err(|_| ScaError::Crypto("provider dh public key is not valid base64".to_owned()))?;
    let provider_public: [u8; 32] = decoded
        .try_into()
        .map_err(|_| ScaError::Crypto("provider dh public key must be 32 bytes".to_owned()))?;

    let raw = dh.agree(&provider_public)?;

    let mut info = Vec::with_capacity(KDF_LABEL.len() + 64);
    info.extend_from_slice(KDF_LABEL);
    info.extend_from_slice(&dh.public_key());
    info.extend_from_slice(&provider_public);

    let kdf = Hkdf::<Sha256>::new(None, raw.expose_secret());
    let mut key = [0u8; 32];
    kdf.expand(&info, &mut key)
        .map_err(|_| ScaError::Crypto("hkdf expansion failed".to_owned()))?;

    Ok(SecretBox::new(Box::new(key)))
}

#[cfg(test)]
mod tests {
    use scakit_secure_store::SoftwareKeyStore;

    use crate::connection::MemoryConnectionRepository;

    use super::*;

    fn manager() -> (Arc<SoftwareKeyStore>, Arc<MemoryConnectionRepository>, KeyManager) {
        let store = Arc::new(SoftwareKeyStore::new());
        let repository = Arc::new(MemoryConnectionRepository::new());
        let manager = KeyManager::new(
            Arc::clone(&store) as Arc<dyn SecureKeyStore>,
            Arc::clone(&repository) as Arc<dyn ConnectionRepository>,
        );
        (store, repository, manager)
    }

    #[test]
    fn enroll_v1_creates_signing_key_only() {
        let (store, _repository, manager) = manager();
        let mut connection = Connection::new("https://bank.example.com", ApiVersion::V1);

        let keys = manager.enroll(&mut connection).unwrap();
        assert!(keys.public_key_pem.contains("BEGIN PUBLIC KEY"));
        assert!(keys.dh_public_key.is_none());
        assert!(store.private_key(&connection.guid).is_some());
        assert!(connection.dh_key_alias.is_none());
    }

    #[test]
    fn enroll_v2_creates_dh_key_pair() {
        let (store, _repository, manager) = manager();
        let mut connection = Connection::new("https://bank.example.com", ApiVersion::V2);

        let keys = manager.enroll(&mut connection).unwrap();
        assert!(keys.dh_public_key.is_some());
        let alias = connection.dh_key_alias.as_deref().unwrap();
        assert!(store.dh_key(alias).is_some());
    }

    #[test]
    fn resolve_fails_loudly_when_key_missing() {
        let (_store, _repository, manager) = manager();
        let connection = Connection::new("https://bank.example.com", ApiVersion::V1);

        assert!(matches!(
            manager.resolve(&connection),
            Err(ScaError::KeyUnavailable { .. })
        ));
    }

    #[test]
    fn resolve_v2_derives_shared_secret() {
        let (store, _repository, manager) = manager();
        let mut connection = Connection::new("https://bank.example.com", ApiVersion::V2);
        manager.enroll(&mut connection).unwrap();

        // Provider side of the handshake.
        let provider = store.create_or_replace_dh_key_pair("provider").unwrap();
        connection.provider_dh_public_key = Some(STANDARD.encode(provider.public_key()));

        let rich = manager.resolve(&connection).unwrap();
        let secret = rich.shared_secret.as_ref().unwrap();

        // The provider derives the same key from its own handle.
        let app_dh = store.dh_key(connection.dh_key_alias.as_deref().unwrap()).unwrap();
        let raw = provider.agree(&app_dh.public_key()).unwrap();
        let mut info = Vec::new();
        info.extend_from_slice(KDF_LABEL);
        info.extend_from_slice(&app_dh.public_key());
        info.extend_from_slice(&provider.public_key());
        let kdf = Hkdf::<Sha256>::new(None, raw.expose_secret());
        let mut expected = [0u8; 32];
        kdf.expand(&info, &mut expected).unwrap();

        assert_eq!(secret.expose_secret(), &expected);
    }

    #[test]
    fn purge_removes_record_and_keys_together() {
        let (store, repository, manager) = manager();
        let mut connection = Connection::new("https://bank.example.com", ApiVersion::V2);
        manager.enroll(&mut connection).unwrap();
        connection.access_token = "token".to_owned();
        connection.status = crate::connection::ConnectionStatus::Active;
        repository.save(connection.clone());

        assert!(manager.purge(&connection));
        assert!(repository.by_guid(&connection.guid).is_none());
        assert!(store.private_key(&connection.guid).is_none());
        assert!(store.dh_key(connection.dh_key_alias.as_deref().unwrap()).is_none());
    }
}
