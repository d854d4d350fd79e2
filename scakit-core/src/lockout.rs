//! Passcode lockout and wipe policy.
//!
//! The passcode never leaves the device, so the attempt counter below is
//! the security boundary against offline brute force: a band of escalating
//! waits slows guessing down, and a hard threshold destroys the locally
//! held key material outright.
//!
//! Policy (see DESIGN.md): attempts 1-5 carry no wait, attempts 6-10 block
//! input for `(n - 5) * step` (one minute per step by default), and attempt
//! 11 wipes all local connections, keys and preferences.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::{clock::Clock, keys::KeyManager};

/// Lockout tunables.
#[derive(Debug, Clone)]
pub struct LockoutConfig {
    /// Attempts that carry no wait.
    pub free_attempts: u32,
    /// Attempt count at which the wipe fires.
    pub wipe_threshold: u32,
    /// Wait added per attempt inside the blocking band.
    pub step: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            free_attempts: 5,
            wipe_threshold: 11,
            step: Duration::from_secs(60),
        }
    }
}

impl LockoutConfig {
    /// Wait imposed after the given attempt count. Non-decreasing in
    /// `attempt_count`.
    #[must_use]
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        if attempt_count <= self.free_attempts {
            Duration::ZERO
        } else {
            self.step * (attempt_count - self.free_attempts)
        }
    }
}

/// Observable lockout state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutState {
    /// Authenticated; the capability is accessible.
    Unlocked,
    /// Locked with the passcode prompt enabled.
    InputEnabled {
        /// Wrong attempts recorded so far.
        attempts: u32,
    },
    /// Locked with input disabled until the given time.
    InputBlocked {
        /// When input re-enables.
        until: SystemTime,
    },
    /// All local credentials destroyed; only re-enrollment remains.
    Wiped,
}

/// Persisted lockout counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockoutRecord {
    /// Wrong-passcode events since the last successful authentication.
    pub attempt_count: u32,
    /// Absolute end of the current input block, if any.
    pub blocked_until: Option<SystemTime>,
}

/// Durable storage for [`LockoutRecord`]. The policy is the only writer.
pub trait AttemptStore: Send + Sync {
    /// Loads the current record.
    fn load(&self) -> LockoutRecord;
    /// Replaces the record.
    fn save(&self, record: LockoutRecord);
    /// Resets the record to its default.
    fn clear(&self);
}

/// In-memory [`AttemptStore`], used on targets without preferences storage
/// and as a test double.
#[derive(Default)]
pub struct MemoryAttemptStore {
    record: Mutex<LockoutRecord>,
}

impl MemoryAttemptStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn load(&self) -> LockoutRecord {
        *self.record.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn save(&self, record: LockoutRecord) {
        *self.record.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = record;
    }

    fn clear(&self) {
        self.save(LockoutRecord::default());
    }
}

/// Gates access to the whole capability behind the local passcode.
///
/// All state mutation is serialized behind one mutex; the counter is
/// security-relevant and must have a single writer.
pub struct LockoutPolicy {
    config: LockoutConfig,
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    keys: Arc<KeyManager>,
    mutation: Mutex<()>,
    wiped: AtomicBool,
}

impl LockoutPolicy {
    /// Creates a policy over the given stores.
    pub fn new(
        config: LockoutConfig,
        store: Arc<dyn AttemptStore>,
        clock: Arc<dyn Clock>,
        keys: Arc<KeyManager>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            keys,
            mutation: Mutex::new(()),
            wiped: AtomicBool::new(false),
        }
    }

    /// Records a wrong-passcode event and returns the resulting state.
    ///
    /// The counter increments monotonically; crossing the wipe threshold
    /// destroys all local connections, keys and preferences irreversibly.
    pub fn on_wrong_passcode(&self) -> LockoutState {
        let _guard = self.mutation.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.wiped.load(Ordering::SeqCst) {
            return LockoutState::Wiped;
        }

        let mut record = self.store.load();
        record.attempt_count += 1;

        if record.attempt_count >= self.config.wipe_threshold {
            tracing::warn!(attempts = record.attempt_count, "wipe threshold reached");
            self.wipe();
            return LockoutState::Wiped;
        }

        let wait = self.config.backoff(record.attempt_count);
        if wait.is_zero() {
            record.blocked_until = None;
            self.store.save(record);
            LockoutState::InputEnabled {
                attempts: record.attempt_count,
            }
        } else {
            let until = self.clock.now() + wait;
            record.blocked_until = Some(until);
            self.store.save(record);
            tracing::info!(attempts = record.attempt_count, wait_secs = wait.as_secs(), "input blocked");
            LockoutState::InputBlocked { until }
        }
    }

    /// Records a successful passcode or biometric authentication: the
    /// counter and any block are reset and the capability unlocks.
    pub fn on_correct_passcode(&self) -> LockoutState {
        let _guard = self.mutation.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.wiped.load(Ordering::SeqCst) {
            return LockoutState::Wiped;
        }
        self.store.clear();
        LockoutState::Unlocked
    }

    /// Returns the current state without mutating the counter. An elapsed
    /// block re-enables input and clears the block timestamp; the attempt
    /// count is never reset by time alone. Reading the block end lazily
    /// makes re-arming idempotent: there is no timer object to duplicate.
    pub fn current_state(&self) -> LockoutState {
        let _guard = self.mutation.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.wiped.load(Ordering::SeqCst) {
            return LockoutState::Wiped;
        }

        let mut record = self.store.load();
        match record.blocked_until {
            Some(until) if self.clock.now() < until => LockoutState::InputBlocked { until },
            Some(_) => {
                record.blocked_until = None;
                self.store.save(record);
                LockoutState::InputEnabled {
                    attempts: record.attempt_count,
                }
            }
            None => LockoutState::InputEnabled {
                attempts: record.attempt_count,
            },
        }
    }

    /// Destroys local connections, keys and the attempt record. Partial
    /// key-deletion failures never abort clearing the credentials; denying
    /// future access wins over leaving stale secrets reachable.
    fn wipe(&self) {
        self.keys.wipe();
        self.store.clear();
        self.wiped.store(true, Ordering::SeqCst);
    }
}
