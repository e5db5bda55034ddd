// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// TCP connection lifecycle and reader task

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::crypto::key_from_str;
use crate::error::{Result, TuyaError};
use crate::event::{DeviceEvent, EventSender};
use crate::message::{FrameDecoder, TuyaMessage};
use crate::protocol::{merge_dps, normalize_response, CommandType};
use crate::session::SessionNegotiator;
use crate::transport::command::CommandEngine;

/// Shared cache of the last known data points.
pub type DpsCache = Arc<RwLock<Map<String, Value>>>;

/// One TCP connection to a device, with its reader task.
pub struct Connection {
    engine: Arc<CommandEngine>,
    event_tx: EventSender,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Connection {
    /// Connect to the device and, on 3.4, negotiate the session key.
    ///
    /// Sequence (3.4): TCP connect → SESS_KEY_NEG_START → SESS_KEY_NEG_RESP
    /// → SESS_KEY_NEG_FINISH → switch to session key → Connected
    pub async fn open(config: &DeviceConfig, event_tx: EventSender, cache: DpsCache) -> Result<Self> {
        let local_key = key_from_str(&config.local_key)?;
        let address = config.socket_address();
        info!("Connecting to device {} at {}", config.dev_id, address);

        let stream = match timeout(config.connection_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("TCP connect failed: {}", e);
                return Err(TuyaError::Io(e));
            }
            Err(_) => {
                error!("TCP connect to {} timed out", address);
                return Err(TuyaError::ConnectionTimeout { address });
            }
        };
        stream.set_nodelay(true)?;
        debug!("TCP socket connected");

        let (reader, writer) = stream.into_split();
        let engine = Arc::new(CommandEngine::new(
            writer,
            config.version,
            local_key,
            config.connection_timeout,
        ));

        let reader_handle = spawn_reader_task(reader, engine.clone(), event_tx.clone(), cache);

        let connection = Self {
            engine: engine.clone(),
            event_tx: event_tx.clone(),
            reader_handle: Some(reader_handle),
        };

        if config.version.uses_session_key() {
            negotiate_session_key(&engine, local_key).await?;
        }

        info!("Connection to device successfully established");
        let _ = event_tx.send(DeviceEvent::Connected);

        Ok(connection)
    }

    /// Send a JSON command and wait for its response.
    pub async fn request(
        &self,
        cmd: CommandType,
        body: &Value,
        expect_data: bool,
    ) -> Result<TuyaMessage> {
        let payload = serde_json::to_vec(body).map_err(|e| TuyaError::MissingParams {
            details: format!("cannot serialize payload: {}", e),
        })?;
        self.engine.send_command(cmd, &payload, expect_data).await
    }

    /// Whether the socket is still believed to be open.
    pub async fn is_connected(&self) -> bool {
        self.engine.is_connected().await
    }

    /// Close the socket.
    pub async fn close(&self) {
        debug!("Closing device connection");
        if self.engine.is_connected().await {
            let _ = self.event_tx.send(DeviceEvent::Disconnected);
        }
        self.engine.disconnect().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}

/// Run the 3.4 key exchange and switch the engine to the session key.
async fn negotiate_session_key(engine: &CommandEngine, local_key: [u8; 16]) -> Result<()> {
    let mut negotiator = SessionNegotiator::new(local_key);

    debug!("Starting session key negotiation");
    let response = engine
        .send_command(CommandType::SessKeyNegStart, &negotiator.start_payload(), true)
        .await?;
    if response.cmd != CommandType::SessKeyNegResp.code() {
        return Err(TuyaError::KeyOrVersion {
            details: format!(
                "expected SESS_KEY_NEG_RESP, got command 0x{:02X}",
                response.cmd
            ),
        });
    }

    let finish = negotiator.handle_response(&response.payload)?;
    engine
        .send_raw(CommandType::SessKeyNegFinish, &finish)
        .await?;

    engine.set_key(negotiator.session_key()?).await;
    debug!("Session key negotiated");
    Ok(())
}

/// Spawn the reader task that processes incoming data from the device.
fn spawn_reader_task(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    engine: Arc<CommandEngine>,
    event_tx: EventSender,
    cache: DpsCache,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut decoder = FrameDecoder::new();

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Reader: connection closed by device");
                    break;
                }
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    while let Some(frame) = decoder.next_frame() {
                        match engine.route_frame(&frame).await {
                            Ok(Some(msg)) => publish_message(msg, &event_tx, &cache).await,
                            Ok(None) => {}
                            Err(TuyaError::BadFrameLimitExceeded { limit }) => {
                                error!("Dropping connection after {} bad frames", limit);
                                engine.disconnect().await;
                                let _ = event_tx.send(DeviceEvent::Disconnected);
                                return;
                            }
                            Err(e) => warn!("Discarding undecodable frame: {}", e),
                        }
                    }
                }
                Err(e) => {
                    error!("Reader: read error: {}", e);
                    break;
                }
            }
        }

        if engine.is_connected().await {
            engine.set_connected(false).await;
            let _ = event_tx.send(DeviceEvent::Disconnected);
        }
        engine.fail_pending().await;
    })
}

/// Emit an unsolicited frame, plus a status update when it carries data points.
async fn publish_message(msg: TuyaMessage, event_tx: &EventSender, cache: &DpsCache) {
    if !msg.payload.is_empty() {
        match normalize_response(&msg.payload) {
            Ok(value) => {
                if let Some(dps) = value.get("dps").cloned() {
                    debug!("Status update from device: {}", dps);
                    merge_dps(&mut *cache.write().await, &value);
                    let _ = event_tx.send(DeviceEvent::StatusUpdate { dps });
                }
            }
            Err(e) => debug!("Unsolicited payload is not a status object: {}", e),
        }
    } else {
        debug!("Empty frame from device: cmd=0x{:02X} seq={}", msg.cmd, msg.seqno);
    }
    let _ = event_tx.send(DeviceEvent::Message(msg));
}
