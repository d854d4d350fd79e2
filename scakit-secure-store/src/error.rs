use thiserror::Error;

/// Errors surfaced by a [`crate::SecureKeyStore`] or one of its key handles.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Key pair generation failed.
    #[error("key_generation_failed: {0}")]
    KeyGeneration(String),

    /// No entry exists under the requested alias.
    #[error("key_not_found: {alias}")]
    KeyNotFound {
        /// The alias that was looked up.
        alias: String,
    },

    /// The entry under the alias exists but is of a different key type.
    #[error("key_type_mismatch: {alias}")]
    KeyTypeMismatch {
        /// The alias that was looked up.
        alias: String,
    },

    /// Producing a signature failed.
    #[error("signature_failed: {0}")]
    SignatureFailed(String),

    /// Asymmetric decryption failed (wrong key or malformed ciphertext).
    #[error("decryption_failed")]
    DecryptionFailed,

    /// Asymmetric encryption failed (plaintext too large for the modulus).
    #[error("encryption_failed")]
    EncryptionFailed,

    /// Exporting the public half of a key pair failed.
    #[error("public_key_export_failed: {0}")]
    PublicKeyExport(String),

    /// The peer's public key produced a non-contributory (all-zero) shared
    /// secret and must be rejected.
    #[error("weak_key_agreement")]
    WeakAgreement,
}
