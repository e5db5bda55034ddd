// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Device handle: connection policy, commands and keep-alive

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::{DevType, DeviceConfig};
use crate::error::{Result, TuyaError};
use crate::event::{event_channel, DeviceEvent, EventReceiver, EventSender};
use crate::protocol::{build_payload, merge_dps, normalize_response, CommandType, Version};
use crate::transport::{Connection, DpsCache};

/// The main public API for talking to a Tuya device on the LAN.
///
/// # Example
///
/// ```no_run
/// use tuya_lan_bridge::{DeviceConfig, TuyaDevice, Version};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = DeviceConfig::builder()
///         .dev_id("bff9dcd9353a327b67wvgf")
///         .address("192.168.1.145")
///         .local_key(";B#tSrtX1#|#B)j`")
///         .version(Version::V3_4)
///         .build();
///
///     let device = TuyaDevice::new(config)?;
///     device.set_socket_persistent(true);
///
///     let status = device.status().await?;
///     println!("{}", serde_json::to_string_pretty(&status)?);
///
///     device.turn_on(1).await?;
///     device.close().await;
///     Ok(())
/// }
/// ```
pub struct TuyaDevice {
    config: StdRwLock<DeviceConfig>,
    persistent: AtomicBool,
    dev_type: RwLock<DevType>,
    connection: Mutex<Option<Connection>>,
    event_tx: EventSender,
    dps_cache: DpsCache,
}

impl TuyaDevice {
    /// Create a device handle. No network I/O happens until the first command.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let (event_tx, _event_rx) = event_channel(256);
        Ok(Self {
            persistent: AtomicBool::new(config.persistent),
            dev_type: RwLock::new(config.dev_type),
            connection: Mutex::new(None),
            event_tx,
            dps_cache: Arc::new(RwLock::new(Map::new())),
            config: StdRwLock::new(config),
        })
    }

    /// Snapshot of the current configuration, including runtime changes
    /// made through the setters.
    pub fn config(&self) -> DeviceConfig {
        let mut config = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        config.persistent = self.is_socket_persistent();
        config
    }

    /// Keep the TCP connection open between commands.
    ///
    /// When disabled, each command opens a fresh connection and closes it
    /// once the response has arrived.
    pub fn set_socket_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Relaxed);
    }

    pub fn is_socket_persistent(&self) -> bool {
        self.persistent.load(Ordering::Relaxed)
    }

    /// Number of connection attempts and the initial backoff between them.
    pub fn set_retry(&self, limit: u32, delay: Duration) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config.retry_limit = limit;
        config.retry_delay = delay;
    }

    /// Timeout for both the TCP connect and each command response.
    ///
    /// Takes effect on the next connection.
    pub fn set_timeout(&self, timeout: Duration) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connection_timeout = timeout;
    }

    /// Subscribe to device events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    /// Current query dialect (changes to device22 if the device asks for it).
    pub async fn dev_type(&self) -> DevType {
        *self.dev_type.read().await
    }

    /// Last known data points, merged from status replies and pushes.
    pub async fn cached_dps(&self) -> Map<String, Value> {
        self.dps_cache.read().await.clone()
    }

    /// Open the connection now instead of on the first command.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connected(&mut guard).await?;
        Ok(())
    }

    /// Whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        match self.connection.lock().await.as_ref() {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }

    /// Close the connection, if any.
    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close().await;
        }
    }

    /// Query all data points.
    ///
    /// Returns the device's JSON reply with the data points under `"dps"`.
    /// A 3.3 device that rejects the normal query is switched to the
    /// device22 dialect and queried once more.
    pub async fn status(&self) -> Result<Value> {
        let config = self.config();
        let request = config.dps_to_request;
        let can_switch =
            config.version == Version::V3_3 && self.dev_type().await == DevType::Default;
        let result = match self.request(CommandType::DpQuery, Some(&request), true).await {
            Err(TuyaError::DeviceTypeMismatch) if can_switch => {
                warn!("Device {} wants device22 queries, retrying", config.dev_id);
                *self.dev_type.write().await = DevType::Device22;
                self.request(CommandType::DpQuery, Some(&request), true).await?
            }
            other => other?,
        };

        let status = result.ok_or_else(|| TuyaError::UnexpectedPayload {
            details: "empty status response".to_string(),
        })?;
        merge_dps(&mut *self.dps_cache.write().await, &status);
        Ok(status)
    }

    /// Set a single data point.
    pub async fn set_value(&self, dp: impl Display, value: Value) -> Result<Option<Value>> {
        let mut dps = Map::new();
        dps.insert(dp.to_string(), value);
        self.set_multiple_values(dps).await
    }

    /// Set several data points in one command.
    pub async fn set_multiple_values(&self, dps: Map<String, Value>) -> Result<Option<Value>> {
        if dps.is_empty() {
            return Err(TuyaError::MissingParams {
                details: "no data points to set".to_string(),
            });
        }
        let dps = Value::Object(dps);
        let reply = self.request(CommandType::Control, Some(&dps), false).await?;
        if let Some(ref status) = reply {
            merge_dps(&mut *self.dps_cache.write().await, status);
        }
        Ok(reply)
    }

    /// Switch a boolean data point on.
    pub async fn turn_on(&self, dp: impl Display) -> Result<Option<Value>> {
        self.set_value(dp, Value::Bool(true)).await
    }

    /// Switch a boolean data point off.
    pub async fn turn_off(&self, dp: impl Display) -> Result<Option<Value>> {
        self.set_value(dp, Value::Bool(false)).await
    }

    /// Send a heartbeat; keeps persistent connections alive.
    pub async fn heartbeat(&self) -> Result<()> {
        self.request(CommandType::HeartBeat, None, false).await?;
        Ok(())
    }

    /// Ask the device to refresh (and push) the given data points.
    pub async fn update_dps(&self, dp_ids: &[u32]) -> Result<()> {
        if dp_ids.is_empty() {
            return Err(TuyaError::MissingParams {
                details: "no data point ids to update".to_string(),
            });
        }
        let ids = json!(dp_ids);
        self.request(CommandType::UpdateDps, Some(&ids), false).await?;
        Ok(())
    }

    /// Wait up to `wait` for the next status push from the device.
    ///
    /// Opens the connection if needed. Returns `Ok(None)` on timeout.
    pub async fn receive(&self, wait: Duration) -> Result<Option<Value>> {
        let mut events = self.subscribe();
        self.connect().await?;

        let result = timeout(wait, async {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::StatusUpdate { dps }) => return Ok(json!({ "dps": dps })),
                    Ok(DeviceEvent::Disconnected) => return Err(TuyaError::Disconnected),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event receiver lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(TuyaError::ChannelClosed);
                    }
                }
            }
        })
        .await;

        match result {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Send a heartbeat every `heartbeat_interval`, forever.
    ///
    /// Failures are logged and the loop carries on; the next heartbeat
    /// reconnects. Run it on its own task and abort it to stop.
    pub async fn keep_alive(&self) {
        let period = self.config().heartbeat_interval.max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.heartbeat().await {
                Ok(()) => debug!("Heartbeat acknowledged"),
                Err(e) => warn!("Heartbeat failed: {}", e),
            }
        }
    }

    /// Build, send and parse one command, managing the connection policy.
    ///
    /// Returns `None` when the device answered with an empty payload.
    async fn request(
        &self,
        cmd: CommandType,
        data: Option<&Value>,
        expect_data: bool,
    ) -> Result<Option<Value>> {
        let dev_type = self.dev_type().await;
        let config = self.config();
        let (cmd, body) = build_payload(cmd, config.version, dev_type, &config.dev_id, data)?;

        let mut guard = self.connection.lock().await;
        let reused = guard.is_some();
        let mut result = self.send_on(&mut guard, cmd, &body, expect_data).await;

        // A persistent socket may have been closed by the device while idle.
        if reused
            && let Err(ref e) = result
            && e.is_retryable()
        {
            debug!("Request on reused connection failed ({}), reconnecting", e);
            result = self.send_on(&mut guard, cmd, &body, expect_data).await;
        }

        let drop_connection = !self.is_socket_persistent()
            || result.as_ref().is_err_and(|e| e.is_retryable());
        if drop_connection && let Some(conn) = guard.take() {
            conn.close().await;
        }
        drop(guard);

        let msg = result?;
        if msg.payload.is_empty() {
            return Ok(None);
        }
        normalize_response(&msg.payload).map(Some)
    }

    async fn send_on(
        &self,
        guard: &mut Option<Connection>,
        cmd: CommandType,
        body: &Value,
        expect_data: bool,
    ) -> Result<crate::message::TuyaMessage> {
        let conn = self.ensure_connected(guard).await?;
        let result = conn.request(cmd, body, expect_data).await;
        if let Err(ref e) = result
            && e.is_retryable()
            && let Some(conn) = guard.take()
        {
            conn.close().await;
        }
        result
    }

    /// Make sure `guard` holds a live connection, connecting with retries.
    async fn ensure_connected<'a>(&self, guard: &'a mut Option<Connection>) -> Result<&'a Connection> {
        let stale = match guard.as_ref() {
            Some(conn) => !conn.is_connected().await,
            None => false,
        };
        if stale {
            debug!("Dropping stale connection");
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(self.connect_with_retry().await?);
        }
        guard.as_ref().ok_or(TuyaError::Disconnected)
    }

    /// Connect, retrying transient errors with exponential backoff.
    ///
    /// Makes at most `retry_limit` attempts (at least one); the delay starts
    /// at `retry_delay` and doubles up to 16x.
    async fn connect_with_retry(&self) -> Result<Connection> {
        let config = self.config();
        let attempts = config.retry_limit.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(config.retry_delay, attempt);
                warn!(
                    "Connection attempt {} failed, retrying in {:.1}s...",
                    attempt,
                    delay.as_secs_f64()
                );
                sleep(delay).await;
            }

            match Connection::open(&config, self.event_tx.clone(), self.dps_cache.clone()).await {
                Ok(conn) => {
                    if attempt > 0 {
                        info!("Connected after {} attempts", attempt + 1);
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt + 1 == attempts {
                        return Err(e);
                    }
                    warn!("Connection error (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TuyaError::Disconnected))
    }
}

/// Delay before retry number `retry` (1-based): doubles from `base`, capped at 16x.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base * (1u32 << retry.saturating_sub(1).min(4))
}
