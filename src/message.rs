// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Tuya frame packing, unpacking and stream decoding

use tracing::{debug, trace};

use crate::constants::{
    CRC_LEN, HEADER_LEN, HMAC_LEN, MAX_FRAME_PAYLOAD, PREFIX_55AA, RETCODE_LEN, SUFFIX_AA55,
    SUFFIX_LEN,
};
use crate::crypto::{crc32, hmac_sha256};
use crate::error::{Result, TuyaError};

/// A single `0x000055AA` frame, before payload encryption or after decryption
/// has been left to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuyaMessage {
    pub seqno: u32,
    pub cmd: u32,
    /// Return code; present only on device-to-client frames.
    pub retcode: Option<u32>,
    pub payload: Vec<u8>,
    /// Whether the CRC-32 or HMAC footer matched.
    pub crc_good: bool,
}

impl TuyaMessage {
    pub fn new(seqno: u32, cmd: u32, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            cmd,
            retcode: None,
            payload,
            crc_good: true,
        }
    }
}

fn footer_len(hmac_key: Option<&[u8]>) -> usize {
    if hmac_key.is_some() { HMAC_LEN } else { CRC_LEN }
}

/// Serialise a message into a wire frame.
///
/// With `hmac_key` the footer is HMAC-SHA256 (protocol 3.4), otherwise CRC-32.
/// The payload must already be encrypted.
pub fn pack_message(msg: &TuyaMessage, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let retcode_len = if msg.retcode.is_some() { RETCODE_LEN } else { 0 };
    let length = retcode_len + msg.payload.len() + footer_len(hmac_key) + SUFFIX_LEN;

    let mut data = Vec::with_capacity(HEADER_LEN + length);
    data.extend_from_slice(&PREFIX_55AA.to_be_bytes());
    data.extend_from_slice(&msg.seqno.to_be_bytes());
    data.extend_from_slice(&msg.cmd.to_be_bytes());
    data.extend_from_slice(&(length as u32).to_be_bytes());
    if let Some(retcode) = msg.retcode {
        data.extend_from_slice(&retcode.to_be_bytes());
    }
    data.extend_from_slice(&msg.payload);

    match hmac_key {
        Some(key) => {
            let mac = hmac_sha256(key, &data)?;
            data.extend_from_slice(&mac);
        }
        None => {
            let crc = crc32(&data);
            data.extend_from_slice(&crc.to_be_bytes());
        }
    }
    data.extend_from_slice(&SUFFIX_AA55.to_be_bytes());

    trace!("Packed frame: {}", hex::encode(&data));
    Ok(data)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse one wire frame.
///
/// `no_retcode` forces the payload to start right after the header (frames
/// sent by a client). Otherwise the first payload word is taken as a return
/// code unless its upper 24 bits are set, in which case it is payload.
///
/// A footer mismatch does not fail the parse; it clears `crc_good`.
pub fn unpack_message(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    no_retcode: bool,
) -> Result<TuyaMessage> {
    if data.len() < HEADER_LEN {
        return Err(TuyaError::IncompleteFrame {
            needed: HEADER_LEN,
            have: data.len(),
        });
    }

    let prefix = read_u32(data, 0);
    if prefix != PREFIX_55AA {
        return Err(TuyaError::InvalidFrame {
            details: format!("bad prefix 0x{:08X}", prefix),
        });
    }

    let seqno = read_u32(data, 4);
    let cmd = read_u32(data, 8);
    let length = read_u32(data, 12) as usize;
    let end_len = footer_len(hmac_key) + SUFFIX_LEN;

    if length < end_len {
        return Err(TuyaError::InvalidFrame {
            details: format!("declared length {} shorter than footer {}", length, end_len),
        });
    }
    let msg_len = HEADER_LEN + length;
    if data.len() < msg_len {
        return Err(TuyaError::IncompleteFrame {
            needed: msg_len,
            have: data.len(),
        });
    }

    let suffix = read_u32(data, msg_len - SUFFIX_LEN);
    if suffix != SUFFIX_AA55 {
        return Err(TuyaError::InvalidFrame {
            details: format!("bad suffix 0x{:08X}", suffix),
        });
    }

    let body_end = msg_len - end_len;
    let mut payload_start = HEADER_LEN;
    let mut retcode = None;
    if !no_retcode && body_end >= HEADER_LEN + RETCODE_LEN {
        let word = read_u32(data, HEADER_LEN);
        if word & 0xFFFF_FF00 == 0 {
            retcode = Some(word);
            payload_start += RETCODE_LEN;
        }
    }

    let footer = &data[body_end..msg_len - SUFFIX_LEN];
    let crc_good = match hmac_key {
        Some(key) => hmac_sha256(key, &data[..body_end])?.as_slice() == footer,
        None => crc32(&data[..body_end]).to_be_bytes().as_slice() == footer,
    };
    if !crc_good {
        debug!("Footer mismatch on frame seq={} cmd=0x{:02X}", seqno, cmd);
    }

    Ok(TuyaMessage {
        seqno,
        cmd,
        retcode,
        payload: data[payload_start..body_end].to_vec(),
        crc_good,
    })
}

/// Splits a TCP byte stream into whole frames.
///
/// Bytes before a frame prefix are dropped. A prefix whose declared length
/// exceeds [`MAX_FRAME_PAYLOAD`] is treated as noise and skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let prefix = PREFIX_55AA.to_be_bytes();
        loop {
            let Some(start) = self.buffer.windows(4).position(|w| w == prefix) else {
                // Keep a possible partial prefix at the tail.
                let keep = self.buffer.len().min(3);
                let drop = self.buffer.len() - keep;
                if drop > 0 {
                    debug!("Discarding {} bytes without frame prefix", drop);
                    self.buffer.drain(..drop);
                }
                return None;
            };
            if start > 0 {
                debug!("Discarding {} bytes before frame prefix", start);
                self.buffer.drain(..start);
            }

            if self.buffer.len() < HEADER_LEN {
                return None;
            }
            let length = read_u32(&self.buffer, 12) as usize;
            if length > MAX_FRAME_PAYLOAD || length < CRC_LEN + SUFFIX_LEN {
                debug!("Skipping prefix with implausible length {}", length);
                self.buffer.drain(..4);
                continue;
            }

            let total = HEADER_LEN + length;
            if self.buffer.len() < total {
                return None;
            }
            let frame: Vec<u8> = self.buffer.drain(..total).collect();
            return Some(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b";B#tSrtX1#|#B)j`";

    #[test]
    fn test_pack_layout_crc() {
        let msg = TuyaMessage::new(1, 0x0a, b"{}".to_vec());
        let frame = pack_message(&msg, None).unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x55, 0xAA]);
        assert_eq!(read_u32(&frame, 4), 1);
        assert_eq!(read_u32(&frame, 8), 0x0a);
        // payload + crc + suffix
        assert_eq!(read_u32(&frame, 12), 2 + 4 + 4);
        assert_eq!(frame.len(), 16 + 10);
        assert_eq!(&frame[frame.len() - 4..], &[0x00, 0x00, 0xAA, 0x55]);
    }

    #[test]
    fn test_pack_layout_hmac_with_retcode() {
        let mut msg = TuyaMessage::new(7, 0x04, vec![0xAB; 48]);
        msg.retcode = Some(0);
        let frame = pack_message(&msg, Some(KEY)).unwrap();
        assert_eq!(read_u32(&frame, 12) as usize, 4 + 48 + 32 + 4);
        assert_eq!(read_u32(&frame, 16), 0);
    }

    #[test]
    fn test_unpack_client_frame() {
        let msg = TuyaMessage::new(3, 0x10, vec![0xFF; 32]);
        let frame = pack_message(&msg, Some(KEY)).unwrap();
        let decoded = unpack_message(&frame, Some(KEY), true).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unpack_detects_retcode() {
        let mut msg = TuyaMessage::new(2, 0x08, br#"{"dps":{"1":true}}"#.to_vec());
        msg.retcode = Some(1);
        let frame = pack_message(&msg, None).unwrap();
        let decoded = unpack_message(&frame, None, false).unwrap();
        assert_eq!(decoded.retcode, Some(1));
        assert_eq!(decoded.payload, msg.payload);
        assert!(decoded.crc_good);
    }

    #[test]
    fn test_unpack_payload_without_retcode() {
        // "3.3\0" has high bits set, so it cannot be a return code
        let msg = TuyaMessage::new(0, 0x08, b"3.3\0\0\0\0\0\0\0\0\0\0\0\0abcd".to_vec());
        let frame = pack_message(&msg, None).unwrap();
        let decoded = unpack_message(&frame, None, false).unwrap();
        assert_eq!(decoded.retcode, None);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_unpack_empty_ack() {
        let mut msg = TuyaMessage::new(5, 0x07, Vec::new());
        msg.retcode = Some(0);
        let frame = pack_message(&msg, Some(KEY)).unwrap();
        let decoded = unpack_message(&frame, Some(KEY), false).unwrap();
        assert_eq!(decoded.retcode, Some(0));
        assert!(decoded.payload.is_empty());
        assert!(decoded.crc_good);
    }

    #[test]
    fn test_unpack_bad_footer() {
        let msg = TuyaMessage::new(1, 0x09, b"{}".to_vec());
        let frame = pack_message(&msg, Some(KEY)).unwrap();
        let decoded = unpack_message(&frame, Some(b"0000000000000000"), true).unwrap();
        assert!(!decoded.crc_good);

        let mut corrupted = pack_message(&msg, None).unwrap();
        corrupted[17] ^= 0x01;
        assert!(!unpack_message(&corrupted, None, true).unwrap().crc_good);
    }

    #[test]
    fn test_unpack_rejects_malformed() {
        assert!(matches!(
            unpack_message(&[0, 0, 0x55], None, false),
            Err(TuyaError::IncompleteFrame { .. })
        ));

        let msg = TuyaMessage::new(1, 0x09, b"{}".to_vec());
        let mut frame = pack_message(&msg, None).unwrap();
        let last = frame.len() - 1;
        frame[last] = 0x00;
        assert!(matches!(
            unpack_message(&frame, None, true),
            Err(TuyaError::InvalidFrame { .. })
        ));

        let frame = pack_message(&msg, None).unwrap();
        assert!(matches!(
            unpack_message(&frame[..frame.len() - 2], None, true),
            Err(TuyaError::IncompleteFrame { .. })
        ));

        let mut frame = pack_message(&msg, None).unwrap();
        frame[0] = 0x01;
        assert!(matches!(
            unpack_message(&frame, None, true),
            Err(TuyaError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_decoder_splits_and_reassembles() {
        let a = pack_message(&TuyaMessage::new(1, 0x09, Vec::new()), None).unwrap();
        let b = pack_message(&TuyaMessage::new(2, 0x08, b"{\"dps\":{}}".to_vec()), None).unwrap();

        let mut stream = vec![0xDE, 0xAD];
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        // Feed in two uneven pieces
        decoder.push(&stream[..20]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&stream[20..]);

        assert_eq!(decoder.next_frame(), Some(a));
        assert_eq!(decoder.next_frame(), Some(b));
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_skips_bogus_length() {
        let good = pack_message(&TuyaMessage::new(9, 0x09, Vec::new()), None).unwrap();
        let mut stream = vec![0x00, 0x00, 0x55, 0xAA, 0, 0, 0, 1, 0, 0, 0, 8, 0x7F, 0xFF, 0xFF, 0xFF];
        stream.extend_from_slice(&good);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert_eq!(decoder.next_frame(), Some(good));
    }
}
