//! Symmetric encryption for cached payloads and queued writes.
//!
//! Cache keys are derived per session with HKDF-SHA256 from the signed-in
//! user's identifier and an application salt. The write queue uses a random
//! per-device key instead. Payloads are zstd-compressed and then
//! sealed with AES-256-GCM. Sealed blobs carry a magic header and a random
//! 96-bit nonce:
//!
//! ```text
//! | "POSC0001" | nonce (12) | ciphertext + tag |
//! ```

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{Result, SyncError};

const SEALED_PAYLOAD_MAGIC: &[u8; 8] = b"POSC0001";
const AES_GCM_NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"pos-offline-cache-key-v1";
const ZSTD_LEVEL: i32 = 3;

/// Salt used when the configuration does not override it.
pub const DEFAULT_KEY_SALT: &str = "the-small-pos/offline-cache";

/// In-memory key. Wiped on drop; only the device queue key is ever persisted,
/// and only to the OS credential store.
pub struct SessionKey {
    bytes: [u8; 32],
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl SessionKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Fresh random key, used for the per-device queue key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Key derivation plus authenticated encryption.
pub trait Cipher: Send + Sync {
    fn derive_key(&self, user_id: &str, salt: &[u8]) -> Result<SessionKey>;
    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>>;
    /// Fails with `DecryptionFailed` when `sealed` was not produced under `key`.
    fn decrypt(&self, key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM with zstd compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmCipher;

impl Cipher for AesGcmCipher {
    fn derive_key(&self, user_id: &str, salt: &[u8]) -> Result<SessionKey> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(SyncError::EncryptionUnavailable);
        }
        let hk = Hkdf::<Sha256>::new(Some(salt), user_id.as_bytes());
        let mut bytes = [0u8; 32];
        hk.expand(KEY_INFO, &mut bytes)
            .map_err(|e| SyncError::Crypto(format!("hkdf expand failed: {e:?}")))?;
        Ok(SessionKey { bytes })
    }

    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::stream::encode_all(std::io::Cursor::new(plaintext), ZSTD_LEVEL)?;
        let cipher = Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| SyncError::Crypto(format!("AES key init failed: {e}")))?;
        let mut nonce = [0u8; AES_GCM_NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), compressed.as_ref())
            .map_err(|e| SyncError::Crypto(format!("AES-GCM encrypt failed: {e}")))?;

        let mut out =
            Vec::with_capacity(SEALED_PAYLOAD_MAGIC.len() + AES_GCM_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(SEALED_PAYLOAD_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>> {
        if !sealed.starts_with(SEALED_PAYLOAD_MAGIC)
            || sealed.len() < SEALED_PAYLOAD_MAGIC.len() + AES_GCM_NONCE_LEN
        {
            return Err(SyncError::DecryptionFailed);
        }
        let nonce_start = SEALED_PAYLOAD_MAGIC.len();
        let nonce_end = nonce_start + AES_GCM_NONCE_LEN;
        let cipher = Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| SyncError::Crypto(format!("AES key init failed: {e}")))?;
        let compressed = cipher
            .decrypt(
                Nonce::from_slice(&sealed[nonce_start..nonce_end]),
                &sealed[nonce_end..],
            )
            .map_err(|_| SyncError::DecryptionFailed)?;
        Ok(zstd::stream::decode_all(std::io::Cursor::new(compressed))?)
    }
}
