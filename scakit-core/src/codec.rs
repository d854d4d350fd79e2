//! Hybrid encryption codec for authorization payloads.
//!
//! Two incompatible protocol generations coexist indefinitely:
//!
//! - **V1**: every payload carries its own AES key and IV, each wrapped
//!   with the connection's RSA key (RSAES-PKCS1-v1_5). The payload body is
//!   AES-256-CBC with PKCS7 padding.
//! - **V2**: the symmetric key is derived once per connection from an
//!   X25519 agreement (see [`crate::keys::derive_shared_secret`]) and
//!   reused across messages; only the IV is per-message.
//!
//! The decoder is selected by the owning connection's protocol generation.
//! A payload whose algorithm tag does not match that decoder is a hard
//! decode failure, never a silent fallback, and decode failures are
//! isolated per item so one bad payload cannot abort a batch.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use scakit_secure_store::{PrivateKeyHandle, SharedSecret};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::{
    connection::{ApiVersion, RichConnection},
    error::ScaError,
    lifecycle::AuthorizationData,
};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Algorithm tag of V1 payloads.
pub const ALGORITHM_V1: &str = "AES-256-CBC";
/// Algorithm tag of V2 payloads.
pub const ALGORITHM_V2: &str = "AES-256-CBC-DH";

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

/// Wire record of an encrypted authorization. All ciphertext fields are
/// base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Server-side id of the challenge.
    pub id: String,
    /// Server-side id of the owning connection.
    pub connection_id: String,
    /// Algorithm tag; must match the decoder of the owning connection.
    pub algorithm: String,
    /// RSA-wrapped AES key (V1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// RSA-wrapped IV for V1, plain base64 IV for V2.
    pub iv: String,
    /// AES-256-CBC ciphertext of the serialized authorization.
    pub data: String,
}

/// Decrypts `payload` with the key material of its owning connection.
///
/// # Errors
///
/// Returns [`ScaError::Decode`] for an unsupported algorithm tag, a missing
/// ciphertext field, an unwrap failure or a JSON parse failure, and
/// [`ScaError::KeyUnavailable`] when a V2 connection has no derived secret.
pub fn decrypt(
    payload: &EncryptedPayload,
    rich: &RichConnection,
) -> Result<AuthorizationData, ScaError> {
    let plaintext = match rich.connection.api_version {
        ApiVersion::V1 => decrypt_v1(payload, rich.private_key.as_ref())?,
        ApiVersion::V2 => {
            let shared = rich
                .shared_secret
                .as_ref()
                .ok_or_else(|| ScaError::key_unavailable(&rich.connection.guid))?;
            decrypt_v2(payload, shared)?
        }
    };
    serde_json::from_slice(&plaintext)
        .map_err(|err| ScaError::decode(format!("authorization json: {err}")))
}

fn decrypt_v1(
    payload: &EncryptedPayload,
    private_key: &dyn PrivateKeyHandle,
) -> Result<Vec<u8>, ScaError> {
    expect_algorithm(payload, ALGORITHM_V1)?;
    let wrapped_key = payload
        .key
        .as_deref()
        .ok_or_else(|| ScaError::decode("missing wrapped key field"))?;

    let key = private_key
        .decrypt(&decode_field("key", wrapped_key)?)
        .map_err(|_| ScaError::decode("rsa key unwrap failed"))?;
    let iv = private_key
        .decrypt(&decode_field("iv", &payload.iv)?)
        .map_err(|_| ScaError::decode("rsa iv unwrap failed"))?;
    let data = decode_field("data", &payload.data)?;

    aes_decrypt(&fixed::<AES_KEY_LEN>("key", &key)?, &fixed::<AES_IV_LEN>("iv", &iv)?, &data)
}

fn decrypt_v2(payload: &EncryptedPayload, shared: &SharedSecret) -> Result<Vec<u8>, ScaError> {
    expect_algorithm(payload, ALGORITHM_V2)?;
    let iv = decode_field("iv", &payload.iv)?;
    let data = decode_field("data", &payload.data)?;
    aes_decrypt(shared.expose_secret(), &fixed::<AES_IV_LEN>("iv", &iv)?, &data)
}

/// Encrypts `value` as a V1 payload: fresh AES key and IV, both wrapped
/// with the connection's RSA public key. The inverse of the V1 decoder.
///
/// # Errors
///
/// Returns [`ScaError::Crypto`] if RSA wrapping fails and
/// [`ScaError::Serialization`] if `value` cannot be serialized.
pub fn encrypt_v1<T: Serialize>(
    id: &str,
    connection_id: &str,
    value: &T,
    key_handle: &dyn PrivateKeyHandle,
) -> Result<EncryptedPayload, ScaError> {
    let plaintext = serde_json::to_vec(value)?;
    let mut key = [0u8; AES_KEY_LEN];
    let mut iv = [0u8; AES_IV_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut iv);

    let payload = EncryptedPayload {
        id: id.to_owned(),
        connection_id: connection_id.to_owned(),
        algorithm: ALGORITHM_V1.to_owned(),
        key: Some(STANDARD.encode(key_handle.encrypt(&key)?)),
        iv: STANDARD.encode(key_handle.encrypt(&iv)?),
        data: STANDARD.encode(aes_encrypt(&key, &iv, &plaintext)),
    };
    Ok(payload)
}

/// Encrypts `value` as a V2 payload with the connection's derived key and a
/// fresh IV. The inverse of the V2 decoder.
///
/// # Errors
///
/// Returns [`ScaError::Serialization`] if `value` cannot be serialized.
pub fn encrypt_v2<T: Serialize>(
    id: &str,
    connection_id: &str,
    value: &T,
    shared: &SharedSecret,
) -> Result<EncryptedPayload, ScaError> {
    let plaintext = serde_json::to_vec(value)?;
    let mut iv = [0u8; AES_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    Ok(EncryptedPayload {
        id: id.to_owned(),
        connection_id: connection_id.to_owned(),
        algorithm: ALGORITHM_V2.to_owned(),
        key: None,
        iv: STANDARD.encode(iv),
        data: STANDARD.encode(aes_encrypt(shared.expose_secret(), &iv, &plaintext)),
    })
}

fn expect_algorithm(payload: &EncryptedPayload, expected: &str) -> Result<(), ScaError> {
    if payload.algorithm == expected {
        Ok(())
    } else {
        Err(ScaError::decode(format!(
            "unsupported algorithm '{}' for this connection",
            payload.algorithm
        )))
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, ScaError> {
    STANDARD
        .decode(value)
        .map_err(|_| ScaError::decode(format!("{name} is not valid base64")))
}

fn fixed<const N: usize>(name: &str, bytes: &[u8]) -> Result<[u8; N], ScaError> {
    bytes
        .try_into()
        .map_err(|_| ScaError::decode(format!("{name} has unexpected length {}", bytes.len())))
}

fn aes_encrypt(key: &[u8; AES_KEY_LEN], iv: &[u8; AES_IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn aes_decrypt(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; AES_IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ScaError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ScaError::decode("aes decryption failed"))
}
