//! Client facade consumed by the UI layer.
//!
//! Wires the signer, codec, queue and key manager into the three
//! operations the UI needs: fetch pending authorizations across all
//! connections, confirm or deny a single authorization, and revoke a set
//! of connections. Fan-out operations isolate failures per connection and
//! per item; a zero-connection batch is an empty result, not an error.

use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;

use crate::{
    codec::{self, EncryptedPayload},
    connection::{Connection, RichConnection},
    error::{PerConnectionError, ScaError},
    keys::KeyManager,
    lifecycle::{AuthorizationData, AuthorizationLifecycle, Disposition},
    queue::BatchRequestQueue,
    request::Request,
    signer::{RequestSigner, SignedRequest},
};

/// Server acknowledgement of a disposition.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Confirmation {
    /// The authorization id the acknowledgement belongs to.
    pub id: String,
    /// Whether the provider accepted the disposition.
    pub success: bool,
}

#[derive(Deserialize)]
struct PayloadListResponse {
    data: Vec<EncryptedPayload>,
}

#[derive(Deserialize)]
struct ConfirmationResponse {
    data: Confirmation,
}

#[derive(Deserialize)]
struct RevokeResponse {
    data: RevokeResult,
}

#[derive(Deserialize)]
struct RevokeResult {
    #[serde(default)]
    success: bool,
}

/// The protocol engine's public entry point.
pub struct ScaClient {
    keys: Arc<KeyManager>,
    signer: Arc<RequestSigner>,
    transport: Arc<Request>,
    queue: BatchRequestQueue,
}

impl ScaClient {
    /// Creates a client over the given services.
    pub fn new(keys: Arc<KeyManager>, signer: Arc<RequestSigner>, transport: Arc<Request>) -> Self {
        Self {
            keys,
            signer,
            transport,
            queue: BatchRequestQueue::new(),
        }
    }

    /// Resolves connections into rich pairings, recording a
    /// per-connection error for each one whose key material is missing.
    fn resolve_all(
        &self,
        connections: Vec<Connection>,
        errors: &mut Vec<PerConnectionError>,
    ) -> Vec<RichConnection> {
        let mut resolved = Vec::with_capacity(connections.len());
        for connection in connections {
            match self.keys.resolve(&connection) {
                Ok(rich) => resolved.push(rich),
                Err(error) => errors.push(PerConnectionError::new(connection.guid, error)),
            }
        }
        resolved
    }

    /// Fetches and decrypts the pending authorizations of every given
    /// connection. Decode failures are dropped per item with a warning;
    /// transport/API failures are recorded per connection. Successfully
    /// decoded items are never hidden by failures elsewhere in the batch.
    pub async fn fetch_authorizations(
        &self,
        connections: Vec<Connection>,
    ) -> (Vec<AuthorizationData>, Vec<PerConnectionError>) {
        let mut errors = Vec::new();
        let resolved = self.resolve_all(connections, &mut errors);

        let signer = Arc::clone(&self.signer);
        let transport = Arc::clone(&self.transport);
        let outcome = self
            .queue
            .execute(resolved, move |rich: RichConnection| {
                let signer = Arc::clone(&signer);
                let transport = Arc::clone(&transport);
                async move {
                    let guid = rich.connection.guid.clone();
                    fetch_one(&signer, &transport, &rich)
                        .await
                        .map_err(|error| PerConnectionError::new(guid, error))
                }
            })
            .await;

        errors.extend(outcome.errors);
        let decoded = outcome.successes.into_iter().flatten().collect();
        (decoded, errors)
    }

    /// Sends a signed confirm/deny for one authorization.
    ///
    /// # Errors
    ///
    /// [`ScaError::KeyUnavailable`] if the connection cannot be resolved,
    /// otherwise transport/API failures from the disposition call.
    pub async fn confirm_or_deny(
        &self,
        connection: &Connection,
        authorization_id: &str,
        disposition: Disposition,
        authorization_code: Option<&str>,
    ) -> Result<Confirmation, ScaError> {
        let rich = self.keys.resolve(connection)?;
        let body = serde_json::json!({
            "data": {
                "confirm": disposition == Disposition::Confirm,
                "authorization_code": authorization_code,
            }
        });
        let route = format!(
            "api/authenticator/{}/authorizations/{authorization_id}",
            rich.connection.api_version
        );
        let signed = self.sign(&rich, "PUT", &route, Some(&body))?;
        let value = self.transport.send(Method::PUT, &signed, Some(&body)).await?;
        let response: ConfirmationResponse = serde_json::from_value(value)
            .map_err(|err| ScaError::Serialization(format!("confirmation: {err}")))?;
        Ok(response.data)
    }

    /// Lifecycle-aware disposition: moves the tracked item in flight,
    /// sends the call, and applies the outcome with the stale-response
    /// guard. An already-expired item fails without a network call.
    ///
    /// # Errors
    ///
    /// See [`AuthorizationLifecycle::begin`] and [`Self::confirm_or_deny`].
    pub async fn confirm_or_deny_tracked(
        &self,
        lifecycle: &AuthorizationLifecycle,
        connection: &Connection,
        authorization_id: &str,
        disposition: Disposition,
        authorization_code: Option<&str>,
    ) -> Result<Confirmation, ScaError> {
        lifecycle.begin(authorization_id, disposition)?;
        let result = self
            .confirm_or_deny(connection, authorization_id, disposition, authorization_code)
            .await;
        lifecycle.complete(
            authorization_id,
            disposition,
            match &result {
                Ok(confirmation) => Ok(confirmation.success),
                Err(err) => Err(err.to_string()),
            },
        );
        result
    }

    /// Revokes every given connection at its provider. Each server-side
    /// success also purges the local record and key entries; the revoked
    /// access tokens are returned.
    pub async fn revoke_connections(
        &self,
        connections: Vec<Connection>,
    ) -> (Vec<String>, Vec<PerConnectionError>) {
        let mut errors = Vec::new();
        let resolved = self.resolve_all(connections, &mut errors);

        let keys = Arc::clone(&self.keys);
        let signer = Arc::clone(&self.signer);
        let transport = Arc::clone(&self.transport);
        let outcome = self
            .queue
            .execute(resolved, move |rich: RichConnection| {
                let keys = Arc::clone(&keys);
                let signer = Arc::clone(&signer);
                let transport = Arc::clone(&transport);
                async move {
                    let guid = rich.connection.guid.clone();
                    revoke_one(&keys, &signer, &transport, &rich)
                        .await
                        .map_err(|error| PerConnectionError::new(guid, error))
                }
            })
            .await;

        errors.extend(outcome.errors);
        (outcome.successes, errors)
    }

    fn sign(
        &self,
        rich: &RichConnection,
        method: &str,
        route: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<SignedRequest, ScaError> {
        self.signer.sign(
            rich.connection.api_version,
            method,
            &rich.connection.connect_url,
            route,
            &rich.connection.access_token,
            rich.private_key.as_ref(),
            body,
        )
    }
}

async fn fetch_one(
    signer: &RequestSigner,
    transport: &Request,
    rich: &RichConnection,
) -> Result<Vec<AuthorizationData>, ScaError> {
    let route = format!(
        "api/authenticator/{}/authorizations",
        rich.connection.api_version
    );
    let signed = signer.sign(
        rich.connection.api_version,
        "GET",
        &rich.connection.connect_url,
        &route,
        &rich.connection.access_token,
        rich.private_key.as_ref(),
        None,
    )?;
    let value = transport.send(Method::GET, &signed, None).await?;
    let response: PayloadListResponse = serde_json::from_value(value)
        .map_err(|err| ScaError::Serialization(format!("authorization list: {err}")))?;

    let mut decoded = Vec::with_capacity(response.data.len());
    for payload in &response.data {
        match codec::decrypt(payload, rich) {
            Ok(authorization) => decoded.push(authorization),
            Err(err) => {
                // Per-item isolation: a bad payload yields no result and
                // the rest of the batch proceeds.
                tracing::warn!(id = %payload.id, %err, "dropping undecodable authorization");
            }
        }
    }
    Ok(decoded)
}

async fn revoke_one(
    keys: &KeyManager,
    signer: &RequestSigner,
    transport: &Request,
    rich: &RichConnection,
) -> Result<String, ScaError> {
    let route = format!(
        "api/authenticator/{}/connections",
        rich.connection.api_version
    );
    let signed = signer.sign(
        rich.connection.api_version,
        "DELETE",
        &rich.connection.connect_url,
        &route,
        &rich.connection.access_token,
        rich.private_key.as_ref(),
        None,
    )?;
    let value = transport.send(Method::DELETE, &signed, None).await?;
    let response: RevokeResponse = serde_json::from_value(value)
        .map_err(|err| ScaError::Serialization(format!("revoke: {err}")))?;
    if !response.data.success {
        return Err(ScaError::ApiResponse {
            status: 200,
            error_class: "RevokeFailed".to_owned(),
            error_message: "provider refused to revoke the connection".to_owned(),
        });
    }

    keys.purge(&rich.connection);
    Ok(rich.connection.access_token.clone())
}

#[cfg(test)]
mod tests {
    use scakit_secure_store::{SecureKeyStore, SoftwareKeyStore};

    use crate::{
        clock::{Clock, ManualClock},
        codec::encrypt_v1,
        connection::{ApiVersion, ConnectionRepository, ConnectionStatus,
            MemoryConnectionRepository},
        lifecycle::AuthorizationStatus,
        signer::SignerConfig,
    };

    use super::*;

    struct Fixture {
        store: Arc<SoftwareKeyStore>,
        repository: Arc<MemoryConnectionRepository>,
        clock: Arc<ManualClock>,
        client: ScaClient,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SoftwareKeyStore::new());
        let repository = Arc::new(MemoryConnectionRepository::new());
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let keys = Arc::new(KeyManager::new(
            Arc::clone(&store) as Arc<dyn SecureKeyStore>,
            Arc::clone(&repository) as Arc<dyn ConnectionRepository>,
        ));
        let signer = Arc::new(RequestSigner::new(
            SignerConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let client = ScaClient::new(keys, signer, Arc::new(Request::new()));
        Fixture {
            store,
            repository,
            clock,
            client,
        }
    }

    fn enrolled_connection(fixture: &Fixture, base_url: &str) -> Connection {
        let mut connection = Connection::new(base_url, ApiVersion::V1);
        connection.id = format!("id-{}", connection.guid);
        connection.access_token = format!("token-{}", connection.guid);
        connection.status = ConnectionStatus::Active;
        fixture
            .store
            .create_or_replace_key_pair(&connection.guid)
            .unwrap();
        fixture.repository.save(connection.clone());
        connection
    }

    fn authorization(id: &str, connection_id: &str, expires_at: u64) -> AuthorizationData {
        AuthorizationData {
            id: id.to_owned(),
            connection_id: connection_id.to_owned(),
            title: "Payment".to_owned(),
            description: "100.00 EUR to ACME".to_owned(),
            authorization_code: Some("code-1".to_owned()),
            created_at: 1_700_000_000,
            expires_at,
        }
    }

    fn encrypted_list_body(fixture: &Fixture, connection: &Connection, ids: &[&str]) -> String {
        let key = fixture.store.private_key(&connection.guid).unwrap();
        let payloads: Vec<EncryptedPayload> = ids
            .iter()
            .map(|id| {
                encrypt_v1(
                    id,
                    &connection.id,
                    &authorization(id, &connection.id, 1_700_000_600),
                    key.as_ref(),
                )
                .unwrap()
            })
            .collect();
        serde_json::json!({ "data": payloads }).to_string()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_aggregates_successes_and_per_connection_errors() {
        let fixture = fixture();
        let mut server_ok = mockito::Server::new_async().await;
        let mut server_err = mockito::Server::new_async().await;

        let conn_ok = enrolled_connection(&fixture, &server_ok.url());
        let conn_err = enrolled_connection(&fixture, &server_err.url());

        let body = encrypted_list_body(&fixture, &conn_ok, &["a-1", "a-2", "a-3"]);
        let ok_mock = server_ok
            .mock("GET", "/api/authenticator/v1/authorizations")
            .match_header("access-token", conn_ok.access_token.as_str())
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
        let err_mock = server_err
            .mock("GET", "/api/authenticator/v1/authorizations")
            .with_status(404)
            .with_body(r#"{"error_class":"NotFound","error_message":"no such route"}"#)
            .create_async()
            .await;

        let (decoded, errors) = fixture
            .client
            .fetch_authorizations(vec![conn_ok.clone(), conn_err.clone()])
            .await;

        ok_mock.assert_async().await;
        err_mock.assert_async().await;
        assert_eq!(decoded.len(), 3);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].connection_guid, conn_err.guid);
        assert!(matches!(
            errors[0].error,
            ScaError::ApiResponse { status: 404, .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_drops_undecodable_items_without_aborting() {
        let fixture = fixture();
        let mut server = mockito::Server::new_async().await;
        let connection = enrolled_connection(&fixture, &server.url());

        let key = fixture.store.private_key(&connection.guid).unwrap();
        let good = encrypt_v1(
            "a-1",
            &connection.id,
            &authorization("a-1", &connection.id, 1_700_000_600),
            key.as_ref(),
        )
        .unwrap();
        let mut bad = good.clone();
        bad.id = "a-2".to_owned();
        bad.algorithm = "AES-128-GCM".to_owned();
        let body = serde_json::json!({ "data": [good, bad] }).to_string();
        server
            .mock("GET", "/api/authenticator/v1/authorizations")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let (decoded, errors) = fixture.client.fetch_authorizations(vec![connection]).await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, "a-1");
        assert!(errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_with_no_connections_is_an_empty_result() {
        let fixture = fixture();
        let (decoded, errors) = fixture.client.fetch_authorizations(Vec::new()).await;
        assert!(decoded.is_empty());
        assert!(errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_key_surfaces_as_per_connection_error() {
        let fixture = fixture();
        let mut connection = Connection::new("https://bank.example.com", ApiVersion::V1);
        connection.access_token = "token".to_owned();

        let (decoded, errors) = fixture.client.fetch_authorizations(vec![connection]).await;
        assert!(decoded.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].error, ScaError::KeyUnavailable { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tracked_confirm_reaches_terminal_state() {
        let fixture = fixture();
        let mut server = mockito::Server::new_async().await;
        let connection = enrolled_connection(&fixture, &server.url());

        let lifecycle =
            AuthorizationLifecycle::new(Arc::clone(&fixture.clock) as Arc<dyn Clock>);
        lifecycle.track(vec![authorization("a-1", &connection.id, 1_700_000_600)]);

        let mock = server
            .mock("PUT", "/api/authenticator/v1/authorizations/a-1")
            .match_header("signature", mockito::Matcher::Regex(".+".to_owned()))
            .with_status(200)
            .with_body(r#"{"data":{"id":"a-1","success":true}}"#)
            .create_async()
            .await;

        let confirmation = fixture
            .client
            .confirm_or_deny_tracked(
                &lifecycle,
                &connection,
                "a-1",
                Disposition::Confirm,
                Some("code-1"),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(confirmation.success);
        assert_eq!(
            lifecycle.entry("a-1").unwrap().status,
            AuthorizationStatus::Confirmed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_authorization_never_hits_the_network() {
        let fixture = fixture();
        let mut server = mockito::Server::new_async().await;
        let connection = enrolled_connection(&fixture, &server.url());

        let lifecycle =
            AuthorizationLifecycle::new(Arc::clone(&fixture.clock) as Arc<dyn Clock>);
        lifecycle.track(vec![authorization("a-1", &connection.id, 1_700_000_060)]);
        fixture.clock.advance(std::time::Duration::from_secs(120));

        let mock = server
            .mock("PUT", "/api/authenticator/v1/authorizations/a-1")
            .expect(0)
            .create_async()
            .await;

        let err = fixture
            .client
            .confirm_or_deny_tracked(&lifecycle, &connection, "a-1", Disposition::Confirm, None)
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, ScaError::ExpiredAuthorization { .. }));
        assert_eq!(
            lifecycle.entry("a-1").unwrap().status,
            AuthorizationStatus::Expired
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn revoke_purges_local_state_and_returns_tokens() {
        let fixture = fixture();
        let mut server = mockito::Server::new_async().await;
        let connection = enrolled_connection(&fixture, &server.url());

        server
            .mock("DELETE", "/api/authenticator/v1/connections")
            .with_status(200)
            .with_body(r#"{"data":{"success":true}}"#)
            .create_async()
            .await;

        let (revoked, errors) = fixture
            .client
            .revoke_connections(vec![connection.clone()])
            .await;

        assert!(errors.is_empty());
        assert_eq!(revoked, vec![connection.access_token.clone()]);
        assert!(fixture.repository.by_guid(&connection.guid).is_none());
        assert!(fixture.store.private_key(&connection.guid).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn revoke_failure_keeps_local_state() {
        let fixture = fixture();
        let mut server = mockito::Server::new_async().await;
        let connection = enrolled_connection(&fixture, &server.url());

        server
            .mock("DELETE", "/api/authenticator/v1/connections")
            .with_status(503)
            .with_body(r#"{"error_class":"Unavailable","error_message":"maintenance"}"#)
            .create_async()
            .await;

        let (revoked, errors) = fixture
            .client
            .revoke_connections(vec![connection.clone()])
            .await;

        assert!(revoked.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(fixture.repository.by_guid(&connection.guid).is_some());
        assert!(fixture.store.private_key(&connection.guid).is_some());
    }
}
