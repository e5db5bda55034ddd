// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Command codes, versions, payload building and parsing

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::config::DevType;
use crate::constants::{DATA_UNVALID, VERSION_HEADER_LEN};
use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};

/// Command codes carried in the `cmd` word of a frame.
///
/// # Query Flow (3.4)
///
/// ```text
/// client                          device
///   SESS_KEY_NEG_START (nonce)  ->
///                               <-  SESS_KEY_NEG_RESP (nonce + hmac)
///   SESS_KEY_NEG_FINISH (hmac)  ->
///   DP_QUERY_NEW {}             ->
///                               <-  DP_QUERY_NEW {"protocol":4,"data":{"dps":{...}}}
/// ```
///
/// 3.3 skips the negotiation and sends `DP_QUERY` encrypted with the local key.
///
/// # Unsolicited Traffic
///
/// Devices push `STATUS` frames whenever a data point changes, including
/// after a `CONTROL` command. The direct reply to `CONTROL` is usually an
/// empty acknowledgement with the same sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Unbind = 0x06,
    /// Set data points (3.3).
    Control = 0x07,
    /// Unsolicited status push from the device.
    Status = 0x08,
    HeartBeat = 0x09,
    /// Query all data points (3.3).
    DpQuery = 0x0a,
    QueryWifi = 0x0b,
    TokenBind = 0x0c,
    /// Set data points (3.4, and device22 queries on 3.3).
    ControlNew = 0x0d,
    EnableWifi = 0x0e,
    WifiInfo = 0x0f,
    /// Query all data points (3.4).
    DpQueryNew = 0x10,
    SceneExecute = 0x11,
    /// Ask the device to refresh the listed data points.
    UpdateDps = 0x12,
    UdpNew = 0x13,
    ApConfigNew = 0x14,
    LanExtStream = 0x40,
}

impl CommandType {
    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x03 => Some(Self::SessKeyNegStart),
            0x04 => Some(Self::SessKeyNegResp),
            0x05 => Some(Self::SessKeyNegFinish),
            0x06 => Some(Self::Unbind),
            0x07 => Some(Self::Control),
            0x08 => Some(Self::Status),
            0x09 => Some(Self::HeartBeat),
            0x0a => Some(Self::DpQuery),
            0x0b => Some(Self::QueryWifi),
            0x0c => Some(Self::TokenBind),
            0x0d => Some(Self::ControlNew),
            0x0e => Some(Self::EnableWifi),
            0x0f => Some(Self::WifiInfo),
            0x10 => Some(Self::DpQueryNew),
            0x11 => Some(Self::SceneExecute),
            0x12 => Some(Self::UpdateDps),
            0x13 => Some(Self::UdpNew),
            0x14 => Some(Self::ApConfigNew),
            0x40 => Some(Self::LanExtStream),
            _ => None,
        }
    }

    /// Whether the encrypted payload of this command carries the
    /// `"3.x" + 12 zero bytes` version header.
    pub fn needs_version_header(&self) -> bool {
        !matches!(
            self,
            Self::DpQuery
                | Self::DpQueryNew
                | Self::UpdateDps
                | Self::HeartBeat
                | Self::SessKeyNegStart
                | Self::SessKeyNegResp
                | Self::SessKeyNegFinish
                | Self::LanExtStream
        )
    }
}

/// Supported LAN protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V3_3,
    V3_4,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V3_3 => "3.3",
            Self::V3_4 => "3.4",
        }
    }

    /// Parse from a float as written in device inventories (`3.4`).
    pub fn from_f64(v: f64) -> Result<Self> {
        if (v - 3.3).abs() < 1e-6 {
            Ok(Self::V3_3)
        } else if (v - 3.4).abs() < 1e-6 {
            Ok(Self::V3_4)
        } else {
            Err(TuyaError::UnsupportedVersion {
                version: v.to_string(),
            })
        }
    }

    /// Whether frames use an HMAC-SHA256 footer and a negotiated session key.
    pub fn uses_session_key(&self) -> bool {
        matches!(self, Self::V3_4)
    }

    /// The 15-byte version header: ASCII version then 12 zero bytes.
    pub fn header(&self) -> [u8; VERSION_HEADER_LEN] {
        let mut header = [0u8; VERSION_HEADER_LEN];
        header[..3].copy_from_slice(self.as_str().as_bytes());
        header
    }
}

impl FromStr for Version {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "3.3" => Ok(Self::V3_3),
            "3.4" => Ok(Self::V3_4),
            other => Err(TuyaError::UnsupportedVersion {
                version: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the JSON body for a command.
///
/// Returns the command actually sent, which differs from `cmd` where a
/// protocol version or device type overrides it (3.4 uses the `*_NEW`
/// commands, device22 queries go through `CONTROL_NEW`).
///
/// `data` is the dps object for `Control`, the list of ids for `UpdateDps`
/// and the dps-to-request object for device22 queries.
pub fn build_payload(
    cmd: CommandType,
    version: Version,
    dev_type: DevType,
    dev_id: &str,
    data: Option<&Value>,
) -> Result<(CommandType, Value)> {
    let now = chrono::Utc::now().timestamp();
    let t_str = now.to_string();

    match (cmd, version) {
        (CommandType::DpQuery, Version::V3_4) => Ok((CommandType::DpQueryNew, json!({}))),
        (CommandType::DpQuery, Version::V3_3) => match dev_type {
            DevType::Default => Ok((
                CommandType::DpQuery,
                json!({ "gwId": dev_id, "devId": dev_id, "uid": dev_id, "t": t_str }),
            )),
            DevType::Device22 => {
                let dps = data.cloned().unwrap_or_else(|| json!({ "1": null }));
                Ok((
                    CommandType::ControlNew,
                    json!({ "devId": dev_id, "uid": dev_id, "t": t_str, "dps": dps }),
                ))
            }
        },
        (CommandType::Control, _) => {
            let dps = data.cloned().ok_or_else(|| TuyaError::MissingParams {
                details: "CONTROL requires a dps object".to_string(),
            })?;
            match version {
                Version::V3_4 => Ok((
                    CommandType::ControlNew,
                    json!({ "protocol": 5, "t": now, "data": { "dps": dps } }),
                )),
                Version::V3_3 => Ok((
                    CommandType::Control,
                    json!({ "devId": dev_id, "uid": dev_id, "t": t_str, "dps": dps }),
                )),
            }
        }
        (CommandType::UpdateDps, _) => {
            let ids = data.cloned().ok_or_else(|| TuyaError::MissingParams {
                details: "UPDATEDPS requires a list of dp ids".to_string(),
            })?;
            Ok((CommandType::UpdateDps, json!({ "dpId": ids })))
        }
        (CommandType::HeartBeat, _) | (CommandType::Status, _) => {
            Ok((cmd, json!({ "gwId": dev_id, "devId": dev_id })))
        }
        _ => Ok((cmd, data.cloned().unwrap_or_else(|| json!({})))),
    }
}

/// Encrypt a payload for the wire.
///
/// 3.3 encrypts first and then prepends the version header; 3.4 prepends
/// the header inside the ciphertext. `cipher` holds the local key on 3.3
/// and the session key (or the local key during negotiation) on 3.4.
pub fn encode_payload(
    cmd: CommandType,
    version: Version,
    cipher: &TuyaCipher,
    payload: &[u8],
) -> Result<Vec<u8>> {
    match version {
        Version::V3_3 => {
            let encrypted = cipher.encrypt(payload, true)?;
            if cmd.needs_version_header() {
                let mut out = version.header().to_vec();
                out.extend_from_slice(&encrypted);
                Ok(out)
            } else {
                Ok(encrypted)
            }
        }
        Version::V3_4 => {
            if cmd.needs_version_header() {
                let mut plain = version.header().to_vec();
                plain.extend_from_slice(payload);
                cipher.encrypt(&plain, true)
            } else {
                cipher.encrypt(payload, true)
            }
        }
    }
}

/// Reverse of [`encode_payload`] for frames received from the device.
pub fn decode_payload(version: Version, cipher: &TuyaCipher, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    match version {
        Version::V3_3 => {
            let body = strip_version_header(version, payload);
            if body.is_empty() {
                return Ok(Vec::new());
            }
            match cipher.decrypt(body, true) {
                Ok(plain) => Ok(plain),
                // Some firmware answers errors in clear text.
                Err(_) if body[0] == b'{' => Ok(body.to_vec()),
                Err(e) => Err(e),
            }
        }
        Version::V3_4 => {
            let plain = cipher.decrypt(payload, true)?;
            Ok(strip_version_header(version, &plain).to_vec())
        }
    }
}

fn strip_version_header(version: Version, data: &[u8]) -> &[u8] {
    if data.len() >= VERSION_HEADER_LEN && data.starts_with(version.as_str().as_bytes()) {
        &data[VERSION_HEADER_LEN..]
    } else {
        data
    }
}

/// Parse a decrypted response body into JSON.
///
/// 3.4 devices nest data points under `data.dps`; they are copied to a
/// top-level `dps` so callers see one shape regardless of version.
pub fn normalize_response(plain: &[u8]) -> Result<Value> {
    let text = String::from_utf8_lossy(plain);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    if text.contains(DATA_UNVALID) {
        return Err(TuyaError::DeviceTypeMismatch);
    }

    let mut value: Value = serde_json::from_str(text).map_err(|_| TuyaError::InvalidJson {
        payload: text.to_string(),
    })?;

    if let Value::Object(ref mut obj) = value
        && !obj.contains_key("dps")
        && let Some(dps) = obj.get("data").and_then(|d| d.get("dps")).cloned()
    {
        obj.insert("dps".to_string(), dps);
    }
    Ok(value)
}

/// Merge the `dps` of a status object into a cache of data points.
pub fn merge_dps(cache: &mut Map<String, Value>, status: &Value) {
    if let Some(dps) = status.get("dps").and_then(Value::as_object) {
        for (k, v) in dps {
            cache.insert(k.clone(), v.clone());
        }
    }
}
