//! Opaque key storage for SCAKit.
//!
//! Connections own their signing keys by alias. The store hands out
//! capability handles (sign, decrypt, agree) and never returns private key
//! material as exportable bytes.
//!
//! Platform implementations should use hardware-backed keystores where
//! available:
//! - iOS: Keychain Services with `kSecAttrAccessibleWhenUnlockedThisDeviceOnly`
//! - Android: Android Keystore with hardware-backed keys
//! - Desktop/server/tests: [`SoftwareKeyStore`]

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use secrecy::SecretBox;

mod error;
pub use error::*;

mod software;
pub use software::*;

/// A 32-byte shared secret produced by key agreement, wrapped so it is
/// zeroized on drop and kept out of `Debug` output.
pub type SharedSecret = SecretBox<[u8; 32]>;

/// Capability handle for an asymmetric (RSA) key pair held by the store.
///
/// The handle exposes operations only; the private exponent never leaves
/// the store.
pub trait PrivateKeyHandle: Send + Sync {
    /// Signs `message` with RSASSA-PKCS1-v1_5 over SHA-256 and returns the
    /// raw signature bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::SignatureFailed`] if the signing operation
    /// fails.
    fn sign_sha256(&self, message: &[u8]) -> Result<Vec<u8>, KeyStoreError>;

    /// Verifies an RSASSA-PKCS1-v1_5/SHA-256 signature against the public
    /// half of this key pair.
    fn verify_sha256(&self, message: &[u8], signature: &[u8]) -> bool;

    /// Decrypts `ciphertext` with RSAES-PKCS1-v1_5 using the private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DecryptionFailed`] on padding or key
    /// mismatch. Callers must treat the two cases identically.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError>;

    /// Encrypts `plaintext` with RSAES-PKCS1-v1_5 using the public key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::EncryptionFailed`] if the plaintext exceeds
    /// the modulus capacity.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError>;

    /// Exports the public half of the key pair as SPKI PEM, as sent to the
    /// provider during enrollment.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::PublicKeyExport`] if encoding fails.
    fn public_key_pem(&self) -> Result<String, KeyStoreError>;
}

/// Capability handle for an X25519 key pair used for key agreement.
pub trait DhKeyHandle: Send + Sync {
    /// Returns the public key bytes, as sent to the provider during
    /// enrollment.
    fn public_key(&self) -> [u8; 32];

    /// Performs X25519 key agreement with `peer_public`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::WeakAgreement`] if the peer key is
    /// non-contributory (low-order point yielding an all-zero secret).
    fn agree(&self, peer_public: &[u8; 32]) -> Result<SharedSecret, KeyStoreError>;
}

/// Keyed storage of signing and agreement key pairs, addressed by alias.
///
/// Implementations must guarantee that private key material is never
/// returned as exportable bytes, only as opaque capability handles.
pub trait SecureKeyStore: Send + Sync {
    /// Generates a fresh RSA-2048 key pair under `alias`, replacing any
    /// existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyGeneration`] if generation fails.
    fn create_or_replace_key_pair(
        &self,
        alias: &str,
    ) -> Result<Arc<dyn PrivateKeyHandle>, KeyStoreError>;

    /// Looks up the asymmetric key pair stored under `alias`.
    fn private_key(&self, alias: &str) -> Option<Arc<dyn PrivateKeyHandle>>;

    /// Generates a fresh X25519 key pair under `alias`, replacing any
    /// existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyGeneration`] if generation fails.
    fn create_or_replace_dh_key_pair(
        &self,
        alias: &str,
    ) -> Result<Arc<dyn DhKeyHandle>, KeyStoreError>;

    /// Looks up the agreement key pair stored under `alias`.
    fn dh_key(&self, alias: &str) -> Option<Arc<dyn DhKeyHandle>>;

    /// Removes the entry under `alias`. Returns `true` if an entry existed.
    fn delete_key(&self, alias: &str) -> bool;

    /// Removes every entry in the store. Used by the wipe path.
    fn delete_all(&self);
}
