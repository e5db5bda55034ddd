// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// AES-128-ECB payload cipher, CRC32 and HMAC-SHA256

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::constants::{CRC32_TABLE, KEY_LEN};
use crate::error::{Result, TuyaError};

type HmacSha256 = Hmac<Sha256>;

const BLOCK_LEN: usize = 16;

/// AES-128 in ECB mode, the payload cipher of protocol 3.3 and 3.4.
///
/// Each 16-byte block is processed independently. Padding is PKCS#7 and is
/// optional on both sides: the 3.4 session key derivation encrypts exactly
/// one block without padding.
pub struct TuyaCipher {
    cipher: Aes128,
}

impl TuyaCipher {
    /// Create a cipher from a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher =
            Aes128::new_from_slice(key).map_err(|_| TuyaError::InvalidKey { len: key.len() })?;
        Ok(Self { cipher })
    }

    /// Encrypt `data`, appending PKCS#7 padding when `pad` is set.
    ///
    /// Without padding the input must already be block aligned.
    pub fn encrypt(&self, data: &[u8], pad: bool) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        if pad {
            let pad_len = BLOCK_LEN - (buf.len() % BLOCK_LEN);
            buf.extend(std::iter::repeat_n(pad_len as u8, pad_len));
        } else if buf.len() % BLOCK_LEN != 0 {
            return Err(TuyaError::Decrypt {
                details: format!("unpadded input of {} bytes is not block aligned", buf.len()),
            });
        }

        for chunk in buf.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }

    /// Decrypt `data`, stripping and validating PKCS#7 padding when `unpad` is set.
    pub fn decrypt(&self, data: &[u8], unpad: bool) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK_LEN != 0 {
            return Err(TuyaError::Decrypt {
                details: format!("ciphertext length {} is not a multiple of 16", data.len()),
            });
        }

        let mut buf = data.to_vec();
        for chunk in buf.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(chunk));
        }

        if unpad {
            let pad_len = buf[buf.len() - 1] as usize;
            if pad_len == 0
                || pad_len > BLOCK_LEN
                || !buf[buf.len() - pad_len..].iter().all(|&b| b as usize == pad_len)
            {
                return Err(TuyaError::Decrypt {
                    details: "invalid padding (wrong key?)".to_string(),
                });
            }
            buf.truncate(buf.len() - pad_len);
        }
        Ok(buf)
    }
}

/// Validate and copy a local key into a fixed array.
pub fn key_from_str(key: &str) -> Result<[u8; KEY_LEN]> {
    key.as_bytes()
        .try_into()
        .map_err(|_| TuyaError::InvalidKey { len: key.len() })
}

/// HMAC-SHA256 of `data` keyed with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| TuyaError::KeyOrVersion {
        details: format!("failed to create HMAC: {}", e),
    })?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// CRC-32 (IEEE) as used in the 3.3 frame footer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    crc ^ 0xFFFF_FFFF
}
