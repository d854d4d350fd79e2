//! Authorization challenges and their state machine.
//!
//! Each decrypted authorization is tracked from discovery to a terminal
//! disposition. Terminal states are never left: a disposition response that
//! arrives after the item expired locally is discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    clock::{unix_seconds, Clock},
    error::ScaError,
};

/// A decrypted authorization challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationData {
    /// Server-side id of the challenge.
    pub id: String,
    /// Server-side id of the owning connection.
    pub connection_id: String,
    /// Short human-readable title.
    pub title: String,
    /// Longer description shown to the user.
    pub description: String,
    /// Code echoed back on confirm, when the provider requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<String>,
    /// Creation time, Unix seconds.
    pub created_at: u64,
    /// Absolute expiry, Unix seconds. Checked against the device clock
    /// before any disposition is attempted.
    pub expires_at: u64,
}

/// The user's decision on a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Disposition {
    /// Approve the operation.
    Confirm,
    /// Reject the operation.
    Deny,
}

/// Lifecycle state of a tracked authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AuthorizationStatus {
    /// Decrypted and awaiting a user decision.
    Fetched,
    /// Confirm call in flight.
    Confirming,
    /// Deny call in flight.
    Denying,
    /// Terminal: provider acknowledged the confirmation.
    Confirmed,
    /// Terminal: provider acknowledged the denial.
    Denied,
    /// Terminal: expired locally before a disposition completed.
    Expired,
    /// Terminal: transport or server error; retry is a user-initiated
    /// re-fetch, never automatic.
    Failed,
}

impl AuthorizationStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Denied | Self::Expired | Self::Failed)
    }
}

/// A tracked challenge with its current status.
#[derive(Debug, Clone)]
pub struct TrackedAuthorization {
    /// The decrypted challenge.
    pub data: AuthorizationData,
    /// Current lifecycle state.
    pub status: AuthorizationStatus,
    /// Failure detail once the status is [`AuthorizationStatus::Failed`].
    pub error: Option<String>,
}

/// Tracks authorizations from fetch to terminal disposition.
pub struct AuthorizationLifecycle {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, TrackedAuthorization>>,
}

impl AuthorizationLifecycle {
    /// Creates an empty tracker on the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrackedAuthorization>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers freshly decrypted items as [`AuthorizationStatus::Fetched`].
    /// Items already tracked keep their current state; a re-fetch never
    /// resurrects a terminal item.
    pub fn track(&self, items: Vec<AuthorizationData>) {
        let mut entries = self.lock();
        for data in items {
            entries.entry(data.id.clone()).or_insert(TrackedAuthorization {
                data,
                status: AuthorizationStatus::Fetched,
                error: None,
            });
        }
    }

    /// Returns a snapshot of the entry for `id`.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<TrackedAuthorization> {
        self.lock().get(id).cloned()
    }

    /// Moves `id` into the in-flight state for `disposition`.
    ///
    /// An item whose expiry has already passed transitions to
    /// [`AuthorizationStatus::Expired`] and the call fails without any
    /// network activity.
    ///
    /// # Errors
    ///
    /// [`ScaError::NotTracked`] for unknown ids,
    /// [`ScaError::ExpiredAuthorization`] when the local clock is past
    /// `expires_at`, and [`ScaError::InvalidTransition`] when the item is
    /// not in [`AuthorizationStatus::Fetched`].
    pub fn begin(&self, id: &str, disposition: Disposition) -> Result<(), ScaError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(id).ok_or_else(|| ScaError::NotTracked {
            id: id.to_owned(),
        })?;

        if entry.status != AuthorizationStatus::Fetched {
            return Err(ScaError::InvalidTransition {
                id: id.to_owned(),
                from: entry.status,
            });
        }

        if unix_seconds(self.clock.now()) > entry.data.expires_at {
            entry.status = AuthorizationStatus::Expired;
            tracing::debug!(id, "authorization expired before disposition");
            return Err(ScaError::ExpiredAuthorization { id: id.to_owned() });
        }

        entry.status = match disposition {
            Disposition::Confirm => AuthorizationStatus::Confirming,
            Disposition::Deny => AuthorizationStatus::Denying,
        };
        Ok(())
    }

    /// Applies the network outcome of a disposition call.
    ///
    /// The response is tagged with the disposition it was issued for; if the
    /// item has meanwhile reached a terminal state by another path (local
    /// expiry racing the user action), the late response is discarded and
    /// the terminal state stands.
    ///
    /// Returns the status after applying, or `None` for unknown ids.
    pub fn complete(
        &self,
        id: &str,
        disposition: Disposition,
        outcome: Result<bool, String>,
    ) -> Option<AuthorizationStatus> {
        let mut entries = self.lock();
        let entry = entries.get_mut(id)?;

        let in_flight = match disposition {
            Disposition::Confirm => AuthorizationStatus::Confirming,
            Disposition::Deny => AuthorizationStatus::Denying,
        };
        if entry.status != in_flight {
            tracing::debug!(id, status = %entry.status, "discarding stale disposition response");
            return Some(entry.status);
        }

        entry.status = match outcome {
            Ok(true) => match disposition {
                Disposition::Confirm => AuthorizationStatus::Confirmed,
                Disposition::Deny => AuthorizationStatus::Denied,
            },
            Ok(false) => {
                entry.error = Some("provider rejected the disposition".to_owned());
                AuthorizationStatus::Failed
            }
            Err(detail) => {
                entry.error = Some(detail);
                AuthorizationStatus::Failed
            }
        };
        Some(entry.status)
    }

    /// Sweeps the local countdown: every still-fetched item whose expiry
    /// has passed becomes [`AuthorizationStatus::Expired`]. Returns the ids
    /// that expired in this sweep.
    pub fn expire_due(&self) -> Vec<String> {
        let now = unix_seconds(self.clock.now());
        let mut expired = Vec::new();
        for (id, entry) in self.lock().iter_mut() {
            if entry.status == AuthorizationStatus::Fetched && now > entry.data.expires_at {
                entry.status = AuthorizationStatus::Expired;
                expired.push(id.clone());
            }
        }
        expired
    }
}
