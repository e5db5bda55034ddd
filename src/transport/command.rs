// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Command/response correlation over one connection

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, trace, warn};

use crate::constants::{BAD_FRAME_LIMIT, BAD_FRAME_WINDOW, KEY_LEN};
use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::message::{pack_message, unpack_message, TuyaMessage};
use crate::protocol::{decode_payload, encode_payload, CommandType, Version};

/// A command waiting for its answer.
struct Pending {
    cmd: CommandType,
    expect_data: bool,
    tx: oneshot::Sender<Result<TuyaMessage>>,
}

impl Pending {
    /// Whether a frame with command code `code` can be the answer to this
    /// command when the device did not echo the sequence number.
    fn answered_by(&self, code: u32) -> bool {
        code == self.cmd.code()
            || (self.cmd == CommandType::SessKeyNegStart
                && code == CommandType::SessKeyNegResp.code())
    }
}

/// Tracks pending commands and routes responses back to callers via oneshot channels.
///
/// Owns the write half of the socket and the current payload key. On 3.3 the
/// key is always the local key. On 3.4 it is the local key until the session
/// negotiation completes, then the session key.
pub struct CommandEngine {
    version: Version,
    /// Sequence numbers start at 1 and only increase
    seqno: AtomicU32,
    pending: Mutex<HashMap<u32, Pending>>,
    writer: Mutex<OwnedWriteHalf>,
    key: RwLock<[u8; KEY_LEN]>,
    connected: RwLock<bool>,
    response_timeout: Duration,
    /// Bad footer counter and time of the last one (for the reset window)
    bad_frames: Mutex<(u32, Option<Instant>)>,
}

impl CommandEngine {
    pub fn new(
        writer: OwnedWriteHalf,
        version: Version,
        local_key: [u8; KEY_LEN],
        response_timeout: Duration,
    ) -> Self {
        Self {
            version,
            seqno: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(writer),
            key: RwLock::new(local_key),
            connected: RwLock::new(true),
            response_timeout,
            bad_frames: Mutex::new((0, None)),
        }
    }

    /// Replace the payload key (used once the 3.4 session key is known).
    pub async fn set_key(&self, key: [u8; KEY_LEN]) {
        *self.key.write().await = key;
    }

    pub async fn set_connected(&self, connected: bool) {
        *self.connected.write().await = connected;
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    fn next_seqno(&self) -> u32 {
        self.seqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Encrypt `payload` and frame it with the current key.
    async fn encode_frame(&self, cmd: CommandType, seqno: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let key = *self.key.read().await;
        let cipher = TuyaCipher::new(&key)?;
        let encrypted = encode_payload(cmd, self.version, &cipher, payload)?;
        let msg = TuyaMessage::new(seqno, cmd.code(), encrypted);
        let hmac_key = self.version.uses_session_key().then_some(&key[..]);
        pack_message(&msg, hmac_key)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await.map_err(|e| {
            error!("Failed to write frame: {}", e);
            TuyaError::Io(e)
        })
    }

    /// Send a command and wait for the matching response.
    ///
    /// When `expect_data` is set, empty acknowledgements with the same
    /// sequence number are skipped and the wait continues for a frame that
    /// carries a payload.
    pub async fn send_command(
        &self,
        cmd: CommandType,
        payload: &[u8],
        expect_data: bool,
    ) -> Result<TuyaMessage> {
        let seqno = self.next_seqno();
        let frame = self.encode_frame(cmd, seqno, payload).await?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            seqno,
            Pending {
                cmd,
                expect_data,
                tx,
            },
        );

        // Checked after registering so a concurrent fail_pending cannot miss this waiter.
        if !self.is_connected().await {
            self.pending.lock().await.remove(&seqno);
            return Err(TuyaError::Disconnected);
        }

        debug!("Sending command 0x{:02X} (seq {})", cmd.code(), seqno);
        trace!("Command payload: {}", String::from_utf8_lossy(payload));
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.remove(&seqno);
            return Err(e);
        }

        match timeout(self.response_timeout, rx).await {
            Ok(Ok(result)) => {
                if let Ok(ref msg) = result {
                    debug!(
                        "Received response for seq {}: cmd=0x{:02X} {} bytes",
                        seqno,
                        msg.cmd,
                        msg.payload.len()
                    );
                }
                result
            }
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&seqno);
                Err(TuyaError::ChannelClosed)
            }
            Err(_) => {
                self.pending.lock().await.remove(&seqno);
                debug!("Command timeout: seq {} cmd 0x{:02X}", seqno, cmd.code());
                Err(TuyaError::CommandTimeout { cmd: cmd.code() })
            }
        }
    }

    /// Send a command without waiting for any response.
    pub async fn send_raw(&self, cmd: CommandType, payload: &[u8]) -> Result<()> {
        let seqno = self.next_seqno();
        let frame = self.encode_frame(cmd, seqno, payload).await?;
        debug!("Sending command 0x{:02X} (seq {}, no reply expected)", cmd.code(), seqno);
        self.write_frame(&frame).await
    }

    /// Decode a raw frame from the reader task.
    ///
    /// Frames that answer a pending command are delivered to the waiter and
    /// `None` is returned. Everything else comes back decrypted so the caller
    /// can publish it.
    pub async fn route_frame(&self, frame: &[u8]) -> Result<Option<TuyaMessage>> {
        let key = *self.key.read().await;
        let hmac_key = self.version.uses_session_key().then_some(&key[..]);
        let mut msg = unpack_message(frame, hmac_key, false)?;
        trace!("Received frame: {}", hex::encode(frame));

        let mut pending = self.pending.lock().await;
        let waiter_seq = if pending.contains_key(&msg.seqno) {
            Some(msg.seqno)
        } else {
            pending
                .iter()
                .find(|(_, p)| p.answered_by(msg.cmd))
                .map(|(seq, _)| *seq)
        };

        if !msg.crc_good {
            if let Some(seq) = waiter_seq
                && let Some(waiter) = pending.remove(&seq)
            {
                let _ = waiter.tx.send(Err(TuyaError::KeyOrVersion {
                    details: "frame footer mismatch".to_string(),
                }));
                return Ok(None);
            }
            drop(pending);
            if self.handle_bad_frame().await {
                return Err(TuyaError::BadFrameLimitExceeded {
                    limit: BAD_FRAME_LIMIT,
                });
            }
            return Ok(None);
        }

        let cipher = TuyaCipher::new(&key)?;
        let decoded = decode_payload(self.version, &cipher, &msg.payload);

        if let Some(seq) = waiter_seq {
            let skip = pending
                .get(&seq)
                .is_some_and(|p| p.expect_data && matches!(decoded, Ok(ref d) if d.is_empty()));
            if skip {
                debug!("Empty acknowledgement for seq {}, still waiting for data", seq);
                return Ok(None);
            }
            if let Some(waiter) = pending.remove(&seq) {
                let result = decoded.map(|payload| {
                    msg.payload = payload;
                    msg
                });
                let _ = waiter.tx.send(result);
                return Ok(None);
            }
        }
        drop(pending);

        msg.payload = decoded?;
        Ok(Some(msg))
    }

    /// Count a bad footer. Returns true if the limit has been exceeded.
    async fn handle_bad_frame(&self) -> bool {
        let mut state = self.bad_frames.lock().await;
        if let Some(last) = state.1
            && last.elapsed() > BAD_FRAME_WINDOW
        {
            state.0 = 0;
        }
        state.0 += 1;
        state.1 = Some(Instant::now());

        if state.0 > BAD_FRAME_LIMIT {
            error!("Too many bad frames ({})", state.0);
            true
        } else {
            warn!("Bad frame footer (count: {})", state.0);
            false
        }
    }

    /// Fail every pending command, e.g. after the socket closed.
    pub async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, waiter) in pending.drain() {
            let _ = waiter.tx.send(Err(TuyaError::Disconnected));
        }
    }

    /// Mark as disconnected and shut the write half down.
    pub async fn disconnect(&self) {
        self.set_connected(false).await;
        self.fail_pending().await;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
