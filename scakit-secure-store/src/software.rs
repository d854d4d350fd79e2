//! Software-backed key store.
//!
//! Keys live in process memory only. Suitable for desktop targets and test
//! doubles; mobile targets should provide a hardware-backed implementation
//! of the same traits.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::rngs::OsRng;
use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{EncodePublicKey, LineEnding},
    sha2::Sha256,
    signature::{SignatureEncoding, Signer, Verifier},
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
};
use secrecy::SecretBox;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{DhKeyHandle, KeyStoreError, PrivateKeyHandle, SecureKeyStore, SharedSecret};

const RSA_BITS: usize = 2048;

enum KeyEntry {
    Rsa(Arc<SoftwareRsaKey>),
    Dh(Arc<SoftwareDhKey>),
}

/// In-memory [`SecureKeyStore`].
#[derive(Default)]
pub struct SoftwareKeyStore {
    entries: RwLock<HashMap<String, KeyEntry>>,
}

impl SoftwareKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, KeyEntry>> {
        self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn entries_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, KeyEntry>> {
        self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SecureKeyStore for SoftwareKeyStore {
    fn create_or_replace_key_pair(
        &self,
        alias: &str,
    ) -> Result<Arc<dyn PrivateKeyHandle>, KeyStoreError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|err| KeyStoreError::KeyGeneration(err.to_string()))?;
        let handle = Arc::new(SoftwareRsaKey::new(private));
        self.entries_mut()
            .insert(alias.to_owned(), KeyEntry::Rsa(Arc::clone(&handle)));
        tracing::debug!(alias, "created asymmetric key pair");
        Ok(handle)
    }

    fn private_key(&self, alias: &str) -> Option<Arc<dyn PrivateKeyHandle>> {
        match self.entries().get(alias) {
            Some(KeyEntry::Rsa(handle)) => Some(Arc::clone(handle) as Arc<dyn PrivateKeyHandle>),
            _ => None,
        }
    }

    fn create_or_replace_dh_key_pair(
        &self,
        alias: &str,
    ) -> Result<Arc<dyn DhKeyHandle>, KeyStoreError> {
        let handle = Arc::new(SoftwareDhKey {
            secret: StaticSecret::random_from_rng(OsRng),
        });
        self.entries_mut()
            .insert(alias.to_owned(), KeyEntry::Dh(Arc::clone(&handle)));
        tracing::debug!(alias, "created agreement key pair");
        Ok(handle)
    }

    fn dh_key(&self, alias: &str) -> Option<Arc<dyn DhKeyHandle>> {
        match self.entries().get(alias) {
            Some(KeyEntry::Dh(handle)) => Some(Arc::clone(handle) as Arc<dyn DhKeyHandle>),
            _ => None,
        }
    }

    fn delete_key(&self, alias: &str) -> bool {
        self.entries_mut().remove(alias).is_some()
    }

    fn delete_all(&self) {
        self.entries_mut().clear();
    }
}

/// RSA key pair held in memory.
struct SoftwareRsaKey {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl SoftwareRsaKey {
    fn new(private: RsaPrivateKey) -> Self {
        let public = private.to_public_key();
        Self { private, public }
    }
}

impl PrivateKeyHandle for SoftwareRsaKey {
    fn sign_sha256(&self, message: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let signer = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signer
            .try_sign(message)
            .map_err(|err| KeyStoreError::SignatureFailed(err.to_string()))?;
        Ok(signature.to_vec())
    }

    fn verify_sha256(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(self.public.clone())
            .verify(message, &signature)
            .is_ok()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| KeyStoreError::DecryptionFailed)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.public
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
            .map_err(|_| KeyStoreError::EncryptionFailed)
    }

    fn public_key_pem(&self) -> Result<String, KeyStoreError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| KeyStoreError::PublicKeyExport(err.to_string()))
    }
}

/// X25519 key pair held in memory. The secret is zeroized on drop by
/// `x25519-dalek`.
struct SoftwareDhKey {
    secret: StaticSecret,
}

impl DhKeyHandle for SoftwareDhKey {
    fn public_key(&self) -> [u8; 32] {
        X25519Public::from(&self.secret).to_bytes()
    }

    fn agree(&self, peer_public: &[u8; 32]) -> Result<SharedSecret, KeyStoreError> {
        let shared = self.secret.diffie_hellman(&X25519Public::from(*peer_public));
        if !shared.was_contributory() {
            return Err(KeyStoreError::WeakAgreement);
        }
        Ok(SecretBox::new(Box::new(shared.to_bytes())))
    }
}
