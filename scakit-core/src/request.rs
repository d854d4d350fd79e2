//! HTTP transport for signed requests.
//!
//! A thin wrapper on `reqwest` that applies timeout and User-Agent
//! defaults, attaches the signature headers, and classifies failures into
//! the engine's error taxonomy. The client timeout sits slightly above the
//! signature expiry window so the server-side expiry is the effective
//! bound.

use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;

use crate::{error::ScaError, signer::SignedRequest};

/// Server error envelope, `{"error_class": ..., "error_message": ...}`.
#[derive(Debug, Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    error_class: String,
    #[serde(default)]
    error_message: String,
}

/// Transport with defaults applied.
pub struct Request {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for Request {
    fn default() -> Self {
        // 10s above the default 5-minute signature window.
        Self::with_timeout(Duration::from_secs(310))
    }
}

impl Request {
    /// Creates a transport with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport with an explicit per-request timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Sends a signed request and returns the parsed JSON body.
    ///
    /// # Errors
    ///
    /// [`ScaError::Transport`] for connect/timeout failures (retryable by
    /// re-invoking the whole operation), [`ScaError::ApiResponse`] for
    /// 4xx/5xx statuses with the server's error envelope attached.
    pub(crate) async fn send(
        &self,
        method: Method,
        signed: &SignedRequest,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, ScaError> {
        #[cfg(not(test))]
        assert!(signed.url.starts_with("https"));

        let mut builder = self
            .client
            .request(method, &signed.url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("scakit-core/{}", env!("CARGO_PKG_VERSION")),
            );
        for (name, value) in &signed.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ScaError::transport(&signed.url, err.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ScaError::transport(&signed.url, err.to_string()))?;

        if !(200..300).contains(&status) {
            let envelope: ErrorEnvelope = serde_json::from_slice(&bytes).unwrap_or_default();
            return Err(ScaError::ApiResponse {
                status,
                error_class: envelope.error_class,
                error_message: envelope.error_message,
            });
        }

        serde_json::from_slice(&bytes)
            .map_err(|err| ScaError::Serialization(format!("response body: {err}")))
    }
}
