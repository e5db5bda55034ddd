// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Protocol 3.4 session key negotiation

//! Protocol 3.4 session key negotiation.
//!
//! Both sides contribute a 16-byte nonce and prove knowledge of the local key
//! by returning an HMAC-SHA256 of the other side's nonce. The session key is
//! the XOR of the two nonces, encrypted once with the local key (single
//! AES-ECB block, no padding). Every frame after the handshake is encrypted
//! and authenticated with the session key.

use rand::RngCore;
use tracing::debug;

use crate::constants::{HMAC_LEN, KEY_LEN};
use crate::crypto::{hmac_sha256, TuyaCipher};
use crate::error::{Result, TuyaError};

/// Client side of the handshake.
pub struct SessionNegotiator {
    local_key: [u8; KEY_LEN],
    local_nonce: [u8; KEY_LEN],
    remote_nonce: Option<[u8; KEY_LEN]>,
}

impl SessionNegotiator {
    /// Start a negotiation with a fresh random nonce.
    pub fn new(local_key: [u8; KEY_LEN]) -> Self {
        let mut nonce = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::with_nonce(local_key, nonce)
    }

    /// Start a negotiation with a caller-chosen nonce.
    pub fn with_nonce(local_key: [u8; KEY_LEN], local_nonce: [u8; KEY_LEN]) -> Self {
        Self {
            local_key,
            local_nonce,
            remote_nonce: None,
        }
    }

    pub fn local_nonce(&self) -> &[u8; KEY_LEN] {
        &self.local_nonce
    }

    /// Plaintext payload of `SESS_KEY_NEG_START`.
    pub fn start_payload(&self) -> Vec<u8> {
        self.local_nonce.to_vec()
    }

    /// Check the device's `SESS_KEY_NEG_RESP` (already decrypted) and return
    /// the plaintext payload of `SESS_KEY_NEG_FINISH`.
    pub fn handle_response(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        if plain.len() < KEY_LEN + HMAC_LEN {
            return Err(TuyaError::KeyOrVersion {
                details: format!("negotiation response too short ({} bytes)", plain.len()),
            });
        }

        let mut remote_nonce = [0u8; KEY_LEN];
        remote_nonce.copy_from_slice(&plain[..KEY_LEN]);

        let expected = hmac_sha256(&self.local_key, &self.local_nonce)?;
        if plain[KEY_LEN..KEY_LEN + HMAC_LEN] != expected {
            return Err(TuyaError::KeyOrVersion {
                details: "device HMAC of local nonce does not match".to_string(),
            });
        }
        debug!("Device proved knowledge of the local key");

        self.remote_nonce = Some(remote_nonce);
        Ok(hmac_sha256(&self.local_key, &remote_nonce)?.to_vec())
    }

    /// The negotiated session key. Only available after [`handle_response`](Self::handle_response).
    pub fn session_key(&self) -> Result<[u8; KEY_LEN]> {
        let remote = self.remote_nonce.ok_or_else(|| TuyaError::KeyOrVersion {
            details: "session key requested before negotiation finished".to_string(),
        })?;
        derive_session_key(&self.local_key, &self.local_nonce, &remote)
    }
}

/// `AES-ECB(local_key, local_nonce XOR remote_nonce)`.
pub fn derive_session_key(
    local_key: &[u8; KEY_LEN],
    local_nonce: &[u8; KEY_LEN],
    remote_nonce: &[u8; KEY_LEN],
) -> Result<[u8; KEY_LEN]> {
    let mut xored = [0u8; KEY_LEN];
    for (i, b) in xored.iter_mut().enumerate() {
        *b = local_nonce[i] ^ remote_nonce[i];
    }
    let encrypted = TuyaCipher::new(local_key)?.encrypt(&xored, false)?;
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&encrypted[..KEY_LEN]);
    Ok(key)
}

/// Device side of step 2: `remote_nonce || HMAC(local_key, client_nonce)`.
pub fn device_response(
    local_key: &[u8; KEY_LEN],
    client_nonce: &[u8],
    device_nonce: &[u8; KEY_LEN],
) -> Result<Vec<u8>> {
    let mut out = device_nonce.to_vec();
    out.extend_from_slice(&hmac_sha256(local_key, client_nonce)?);
    Ok(out)
}

/// Device side of step 3: check the client's HMAC of the device nonce.
pub fn verify_finish(
    local_key: &[u8; KEY_LEN],
    device_nonce: &[u8; KEY_LEN],
    finish: &[u8],
) -> Result<bool> {
    Ok(hmac_sha256(local_key, device_nonce)?.as_slice() == finish)
}
