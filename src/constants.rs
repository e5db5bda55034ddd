// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Protocol constants and timing defaults

use std::time::Duration;

/// Frame prefix for protocol 3.1 through 3.4.
pub const PREFIX_55AA: u32 = 0x0000_55AA;
/// Frame suffix for protocol 3.1 through 3.4.
pub const SUFFIX_AA55: u32 = 0x0000_AA55;

/// prefix + seqno + cmd + length
pub const HEADER_LEN: usize = 16;
pub const RETCODE_LEN: usize = 4;
pub const SUFFIX_LEN: usize = 4;
pub const CRC_LEN: usize = 4;
pub const HMAC_LEN: usize = 32;

/// Upper bound on the declared length of a single frame.
///
/// Devices never send more than a few KiB; anything larger means the decoder
/// latched onto a stray prefix inside encrypted data.
pub const MAX_FRAME_PAYLOAD: usize = 0x1_0000;

/// Default TCP port for the LAN protocol.
pub const DEFAULT_PORT: u16 = 6668;

/// Length of the AES-128 local key and of the session nonces.
pub const KEY_LEN: usize = 16;

/// Length of a version header: ASCII version ("3.4") followed by 12 zero bytes.
pub const VERSION_HEADER_LEN: usize = 15;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Bad-footer frames tolerated inside [`BAD_FRAME_WINDOW`] before the
/// connection is dropped.
pub const BAD_FRAME_LIMIT: u32 = 10;
pub const BAD_FRAME_WINDOW: Duration = Duration::from_secs(60);

/// Marker a 3.3 device returns when it wants the device22 query form.
pub const DATA_UNVALID: &str = "data unvalid";

/// CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320) lookup table.
pub const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}
