//! Request signing.
//!
//! Every outgoing API call carries three headers: the connection's access
//! token, an absolute expiry in Unix seconds, and a signature over a
//! canonical string of the request. V1 connections send a raw base64
//! RSA-SHA256 signature; V2 connections send a compact JWS with the payload
//! segment stripped (the body travels separately in the request itself).

use std::sync::Arc;
use std::time::Duration;

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use scakit_secure_store::PrivateKeyHandle;

use crate::{
    clock::{unix_seconds, Clock},
    connection::ApiVersion,
    error::ScaError,
};

/// Header carrying the connection's bearer credential.
pub const HEADER_ACCESS_TOKEN: &str = "access-token";
/// Header carrying the request expiry in decimal Unix seconds.
pub const HEADER_EXPIRES_AT: &str = "expires-at";
/// Header carrying the request signature.
pub const HEADER_SIGNATURE: &str = "signature";

/// JWS protected header for V2 signatures.
const JWS_PROTECTED: &str = r#"{"alg":"RS256","typ":"JWT"}"#;

/// Signer tunables.
#[derive(Debug, Clone)]
pub struct SignerConfig {
    /// Window during which the server accepts the request.
    pub expires_in: Duration,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            expires_in: Duration::from_secs(5 * 60),
        }
    }
}

/// A fully signed request, ready for the transport.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Absolute request URL.
    pub url: String,
    /// Header name/value pairs, including the signature.
    pub headers: Vec<(String, String)>,
    /// The expiry baked into the signature, in Unix seconds.
    pub expires_at: u64,
}

/// Builds signed requests for a connection's protocol generation.
pub struct RequestSigner {
    config: SignerConfig,
    clock: Arc<dyn Clock>,
}

impl RequestSigner {
    /// Creates a signer with the given config and clock.
    pub fn new(config: SignerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Signs a request expiring `config.expires_in` from now.
    ///
    /// # Errors
    ///
    /// Propagates signing failures; see [`Self::sign_at`].
    pub fn sign(
        &self,
        api_version: ApiVersion,
        method: &str,
        base_url: &str,
        route: &str,
        access_token: &str,
        key: &dyn PrivateKeyHandle,
        body: Option<&serde_json::Value>,
    ) -> Result<SignedRequest, ScaError> {
        let expires_at = unix_seconds(self.clock.now() + self.config.expires_in);
        Self::sign_at(api_version, method, base_url, route, access_token, key, body, expires_at)
    }

    /// Signs a request with an explicit expiry.
    ///
    /// Signing fails loudly when the key refuses to sign; there is no empty
    /// signature fallback, and the caller must treat the failure as
    /// non-retryable for this connection until re-enrollment.
    ///
    /// # Errors
    ///
    /// Returns [`ScaError::Crypto`] if the key handle fails to sign and
    /// [`ScaError::Serialization`] if the body cannot be serialized.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_at(
        api_version: ApiVersion,
        method: &str,
        base_url: &str,
        route: &str,
        access_token: &str,
        key: &dyn PrivateKeyHandle,
        body: Option<&serde_json::Value>,
        expires_at: u64,
    ) -> Result<SignedRequest, ScaError> {
        let url = request_url(base_url, route);
        let canonical = canonical_string(method, &url, expires_at, body)?;

        let signature = match api_version {
            ApiVersion::V1 => STANDARD.encode(key.sign_sha256(canonical.as_bytes())?),
            ApiVersion::V2 => detached_jws(key, canonical.as_bytes())?,
        };

        Ok(SignedRequest {
            url,
            headers: vec![
                (HEADER_ACCESS_TOKEN.to_owned(), access_token.to_owned()),
                (HEADER_EXPIRES_AT.to_owned(), expires_at.to_string()),
                (HEADER_SIGNATURE.to_owned(), signature),
            ],
            expires_at,
        })
    }
}

/// Appends `route` to `base_url`, normalizing any existing path segment to
/// exactly one separating slash.
#[must_use]
pub fn request_url(base_url: &str, route: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        route.trim_start_matches('/')
    )
}

/// The canonical string-to-sign: `method|url|expires_at|body`.
fn canonical_string(
    method: &str,
    url: &str,
    expires_at: u64,
    body: Option<&serde_json::Value>,
) -> Result<String, ScaError> {
    let serialized = match body {
        Some(value) => serde_json::to_string(value)?,
        None => String::new(),
    };
    Ok(format!("{method}|{url}|{expires_at}|{serialized}"))
}

/// Produces `protected..signature` — a compact JWS over the canonical
/// string with the payload segment deliberately omitted from the
/// transmitted value.
fn detached_jws(key: &dyn PrivateKeyHandle, payload: &[u8]) -> Result<String, ScaError> {
    let protected = URL_SAFE_NO_PAD.encode(JWS_PROTECTED.as_bytes());
    let encoded_payload = URL_SAFE_NO_PAD.encode(payload);
    let signing_input = format!("{protected}.{encoded_payload}");
    let signature = key.sign_sha256(signing_input.as_bytes())?;
    Ok(format!("{protected}..{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// Verifies a signature header against the request it covers. Used by tests
/// to prove both signature formats verify against the enrolled public key.
#[must_use]
pub fn verify_signature(
    api_version: ApiVersion,
    key: &dyn PrivateKeyHandle,
    method: &str,
    url: &str,
    expires_at: u64,
    body: Option<&serde_json::Value>,
    signature_header: &str,
) -> bool {
    let Ok(canonical) = canonical_string(method, url, expires_at, body) else {
        return false;
    };
    match api_version {
        ApiVersion::V1 => STANDARD
            .decode(signature_header)
            .is_ok_and(|signature| key.verify_sha256(canonical.as_bytes(), &signature)),
        ApiVersion::V2 => {
            let mut segments = signature_header.split('.');
            let (Some(protected), Some(""), Some(signature), None) = (
                segments.next(),
                segments.next(),
                segments.next(),
                segments.next(),
            ) else {
                return false;
            };
            let encoded_payload = URL_SAFE_NO_PAD.encode(canonical.as_bytes());
            let signing_input = format!("{protected}.{encoded_payload}");
            URL_SAFE_NO_PAD
                .decode(signature)
                .is_ok_and(|signature| key.verify_sha256(signing_input.as_bytes(), &signature))
        }
    }
}
