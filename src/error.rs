// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Error type and Tuya error codes

use std::fmt;

use serde_json::{json, Value};

/// Numeric error codes used across the Tuya LAN tooling ecosystem.
///
/// These are what `tuyactl` prints in the `"Err"` field of an error response,
/// so scripts that already parse those codes keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 900 - Invalid JSON Response from Device
    Json,
    /// 901 - Network Error: Unable to Connect
    Connect,
    /// 902 - Timeout Waiting for Device
    Timeout,
    /// 903 - Specified Value Out of Range
    Range,
    /// 904 - Unexpected Payload from Device
    Payload,
    /// 905 - Network Error: Device Unreachable
    Offline,
    /// 906 - Device in Unknown State
    State,
    /// 907 - Function Not Supported by Device
    Function,
    /// 908 - Device22 Detected: Retry Command
    DevType,
    /// 912 - Missing Function Parameters
    Params,
    /// 914 - Check device key or version
    KeyOrVersion,
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Json => 900,
            Self::Connect => 901,
            Self::Timeout => 902,
            Self::Range => 903,
            Self::Payload => 904,
            Self::Offline => 905,
            Self::State => 906,
            Self::Function => 907,
            Self::DevType => 908,
            Self::Params => 912,
            Self::KeyOrVersion => 914,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            900 => Some(Self::Json),
            901 => Some(Self::Connect),
            902 => Some(Self::Timeout),
            903 => Some(Self::Range),
            904 => Some(Self::Payload),
            905 => Some(Self::Offline),
            906 => Some(Self::State),
            907 => Some(Self::Function),
            908 => Some(Self::DevType),
            912 => Some(Self::Params),
            914 => Some(Self::KeyOrVersion),
            _ => None,
        }
    }

    /// Human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Json => "Invalid JSON Response from Device",
            Self::Connect => "Network Error: Unable to Connect",
            Self::Timeout => "Timeout Waiting for Device",
            Self::Range => "Specified Value Out of Range",
            Self::Payload => "Unexpected Payload from Device",
            Self::Offline => "Network Error: Device Unreachable",
            Self::State => "Device in Unknown State",
            Self::Function => "Function Not Supported by Device",
            Self::DevType => "Device22 Detected: Retry Command",
            Self::Params => "Missing Function Parameters",
            Self::KeyOrVersion => "Check device key or version",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.as_u16(), self.description())
    }
}

/// All errors that can occur in the tuya-lan-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum TuyaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout: {address}")]
    ConnectionTimeout { address: String },

    #[error("Timeout waiting for response to command 0x{cmd:02X}")]
    CommandTimeout { cmd: u32 },

    #[error("Socket disconnected")]
    Disconnected,

    #[error("Invalid local key: expected 16 bytes, got {len}")]
    InvalidKey { len: usize },

    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: String },

    #[error("Incomplete frame: need {needed} bytes, have {have}")]
    IncompleteFrame { needed: usize, have: usize },

    #[error("Invalid frame: {details}")]
    InvalidFrame { details: String },

    #[error("Decryption failed: {details}")]
    Decrypt { details: String },

    #[error("Session key negotiation failed: {details}")]
    KeyOrVersion { details: String },

    #[error("Invalid JSON from device: {payload}")]
    InvalidJson { payload: String },

    #[error("Unexpected payload from device: {details}")]
    UnexpectedPayload { details: String },

    #[error("Device22 detected, command must be retried")]
    DeviceTypeMismatch,

    #[error("Missing function parameters: {details}")]
    MissingParams { details: String },

    #[error("Too many bad frames (exceeded limit of {limit})")]
    BadFrameLimitExceeded { limit: u32 },

    #[error("Channel closed")]
    ChannelClosed,
}

impl TuyaError {
    /// Whether this error is transient and the connection should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TuyaError::Io(_)
                | TuyaError::ConnectionTimeout { .. }
                | TuyaError::CommandTimeout { .. }
                | TuyaError::Disconnected
                | TuyaError::BadFrameLimitExceeded { .. }
                | TuyaError::ChannelClosed
        )
    }

    /// The ecosystem error code this error is reported as.
    pub fn code(&self) -> ErrorCode {
        match self {
            TuyaError::Io(_) | TuyaError::ConnectionTimeout { .. } => ErrorCode::Connect,
            TuyaError::CommandTimeout { .. } => ErrorCode::Timeout,
            TuyaError::Disconnected
            | TuyaError::ChannelClosed
            | TuyaError::BadFrameLimitExceeded { .. } => ErrorCode::Offline,
            TuyaError::InvalidKey { .. }
            | TuyaError::UnsupportedVersion { .. }
            | TuyaError::Decrypt { .. }
            | TuyaError::KeyOrVersion { .. } => ErrorCode::KeyOrVersion,
            TuyaError::IncompleteFrame { .. }
            | TuyaError::InvalidFrame { .. }
            | TuyaError::UnexpectedPayload { .. } => ErrorCode::Payload,
            TuyaError::InvalidJson { .. } => ErrorCode::Json,
            TuyaError::DeviceTypeMismatch => ErrorCode::DevType,
            TuyaError::MissingParams { .. } => ErrorCode::Params,
        }
    }

    /// Render as the `{"Error", "Err", "Payload"}` object printed by `tuyactl`.
    pub fn to_json(&self) -> Value {
        let payload = match self {
            TuyaError::InvalidJson { payload } => Value::String(payload.clone()),
            _ => Value::Null,
        };
        let code = self.code();
        json!({
            "Error": code.description(),
            "Err": code.as_u16().to_string(),
            "Payload": payload,
        })
    }
}

pub type Result<T> = std::result::Result<T, TuyaError>;
