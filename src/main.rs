// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Command-line client and MQTT bridge

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use tuya_lan_bridge::{DeviceConfig, DeviceEvent, TuyaDevice, TuyaError, Version};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "tuyactl")]
#[command(about = "Query and control Tuya devices over the local network")]
struct Cli {
    /// Path to an optional TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Device id
    #[arg(long)]
    id: Option<String>,

    /// Device IP address
    #[arg(long)]
    address: Option<String>,

    /// 16-character local key
    #[arg(long)]
    key: Option<String>,

    /// Protocol version (3.3 or 3.4)
    #[arg(long)]
    version: Option<String>,

    /// Device TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Keep the socket open between commands
    #[arg(long)]
    persistent: bool,

    /// Trace every frame sent and received
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the device status as JSON
    Status,
    /// Set one data point; VALUE is parsed as JSON, else taken as a string
    Set { dp: String, value: String },
    /// Stay connected and print every status update
    Listen,
    /// Bridge the device to an MQTT broker
    Bridge {
        /// Broker URL (mqtt://host:port), overrides [mqtt].url
        #[arg(long)]
        mqtt_url: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    device: DeviceToml,
    #[serde(default)]
    mqtt: Option<MqttToml>,
}

#[derive(Debug, Deserialize)]
struct DeviceToml {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    local_key: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    persistent: bool,
    #[serde(default = "default_connection_timeout")]
    connection_timeout_ms: u64,
    #[serde(default = "default_retry_limit")]
    retry_limit: u32,
    #[serde(default = "default_retry_delay")]
    retry_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    heartbeat_interval_secs: u64,
    /// Data points requested from device22-type devices
    #[serde(default)]
    dps_to_request: Option<Vec<String>>,
}

impl Default for DeviceToml {
    fn default() -> Self {
        Self {
            id: None,
            address: None,
            local_key: None,
            version: None,
            port: None,
            persistent: false,
            connection_timeout_ms: default_connection_timeout(),
            retry_limit: default_retry_limit(),
            retry_delay_ms: default_retry_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            dps_to_request: None,
        }
    }
}

fn default_connection_timeout() -> u64 {
    5000
}
fn default_retry_limit() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    5000
}
fn default_heartbeat_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
struct MqttToml {
    #[serde(default)]
    url: Option<String>,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
    #[serde(default = "default_snapshot_interval")]
    snapshot_interval_secs: u64,
}

impl Default for MqttToml {
    fn default() -> Self {
        Self {
            url: None,
            client_id: default_client_id(),
            subscribe_topic: default_subscribe_topic(),
            publish_topic: default_publish_topic(),
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

fn default_client_id() -> String {
    "tuya-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "tuya/cmd".to_string()
}
fn default_publish_topic() -> String {
    "tuya".to_string()
}
fn default_snapshot_interval() -> u64 {
    60
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

/// Merge the TOML `[device]` table with command-line flags (flags win).
fn build_device_config(cli: &Cli, toml: &DeviceToml) -> Result<DeviceConfig> {
    let dev_id = cli
        .id
        .clone()
        .or_else(|| toml.id.clone())
        .context("Missing device id (--id or [device].id)")?;
    let address = cli
        .address
        .clone()
        .or_else(|| toml.address.clone())
        .context("Missing device address (--address or [device].address)")?;
    let local_key = cli
        .key
        .clone()
        .or_else(|| toml.local_key.clone())
        .context("Missing local key (--key or [device].local_key)")?;
    let version: Version = cli
        .version
        .as_deref()
        .or(toml.version.as_deref())
        .unwrap_or("3.3")
        .parse()
        .context("Invalid protocol version")?;

    let mut builder = DeviceConfig::builder()
        .dev_id(dev_id)
        .address(address)
        .local_key(local_key)
        .version(version)
        .persistent(cli.persistent || toml.persistent)
        .connection_timeout(Duration::from_millis(toml.connection_timeout_ms))
        .retry_limit(toml.retry_limit)
        .retry_delay(Duration::from_millis(toml.retry_delay_ms))
        .heartbeat_interval(Duration::from_secs(toml.heartbeat_interval_secs.max(1)));
    if let Some(port) = cli.port.or(toml.port) {
        builder = builder.port(port);
    }
    if let Some(ref dps) = toml.dps_to_request {
        let request: Map<String, Value> = dps.iter().map(|dp| (dp.clone(), Value::Null)).collect();
        builder = builder.dps_to_request(Value::Object(request));
    }
    Ok(builder.build())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the error document and signal failure.
fn report_error(e: &TuyaError) -> Result<ExitCode> {
    error!("Device command failed: {e}");
    print_json(&e.to_json())?;
    Ok(ExitCode::FAILURE)
}

async fn run_status(device: &TuyaDevice) -> Result<ExitCode> {
    let result = device.status().await;
    device.close().await;
    match result {
        Ok(status) => {
            print_json(&status)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_error(&e),
    }
}

/// VALUE is JSON when it parses as JSON (`true`, `25`, `"x"`), else a plain string.
fn parse_dp_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_set(device: &TuyaDevice, dp: &str, raw: &str) -> Result<ExitCode> {
    let value = parse_dp_value(raw);
    info!("Setting dp {dp} to {value}");
    let result = device.set_value(dp, value).await;
    device.close().await;
    match result {
        Ok(reply) => {
            print_json(&reply.unwrap_or_else(|| json!({})))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_error(&e),
    }
}

async fn run_listen(device: TuyaDevice) -> Result<ExitCode> {
    device.set_socket_persistent(true);
    let device = Arc::new(device);
    let mut events = device.subscribe();

    match device.status().await {
        Ok(status) => print_json(&status)?,
        Err(e) => return report_error(&e),
    }

    // Heartbeats keep the socket open; a failed one reconnects on the next tick.
    let hb_device = Arc::clone(&device);
    let hb_handle = tokio::spawn(async move { hb_device.keep_alive().await });

    info!("Listening for updates. Press Ctrl-C to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(DeviceEvent::StatusUpdate { dps }) => print_json(&json!({ "dps": dps }))?,
                Ok(DeviceEvent::Disconnected) => warn!("Device disconnected"),
                Ok(DeviceEvent::Connected) => info!("Device connected"),
                Ok(DeviceEvent::Message(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged, missed {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    hb_handle.abort();
    device.close().await;
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share a flat {now, op, ...} structure

#[derive(Serialize)]
struct MqttDpsMessage {
    now: u64,
    op: String,
    dps: Map<String, Value>,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    dps: Option<Map<String, Value>>,
}

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn dps_message(op: &str, dps: Map<String, Value>) -> MqttDpsMessage {
    MqttDpsMessage {
        now: now_epoch_ms(),
        op: op.to_string(),
        dps,
    }
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    success: bool,
    src: Option<Value>,
    data: Option<Value>,
) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
    };
    publish_json(client, topic, &msg, false).await;
}

/// Query the device and publish a retained SNAPSHOT. Returns the message on success.
async fn publish_snapshot(
    client: &AsyncClient,
    topic: &str,
    device: &TuyaDevice,
) -> Option<MqttDpsMessage> {
    if let Err(e) = device.status().await {
        warn!("Status poll failed: {e}");
        return None;
    }
    let snapshot = dps_message("SNAPSHOT", device.cached_dps().await);
    publish_json(client, topic, &snapshot, true).await;
    Some(snapshot)
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

fn dps_summary(dps: &Map<String, Value>) -> String {
    serde_json::to_string(dps).unwrap_or_else(|_| format!("{} data points", dps.len()))
}

async fn handle_command(
    payload_str: &str,
    cmd: MqttCommand,
    client: &AsyncClient,
    topic: &str,
    device: &TuyaDevice,
) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<Value>(payload_str).ok();

    match cmd.op.as_str() {
        "SNAPSHOT" => {
            debug!("Command: SNAPSHOT");
            match publish_snapshot(client, topic, device).await {
                Some(snapshot) => {
                    let data = serde_json::to_value(&snapshot).ok();
                    publish_cmd_ack(client, topic, true, src_json, data).await;
                }
                None => publish_cmd_ack(client, topic, false, src_json, None).await,
            }
        }

        "PING" => {
            info!("Command: PING");
            publish_cmd_ack(client, topic, true, src_json, None).await;
        }

        "SET" => {
            let dps = match cmd.dps {
                Some(dps) if !dps.is_empty() => dps,
                _ => {
                    warn!("SET: missing dps");
                    publish_cmd_ack(client, topic, false, src_json, None).await;
                    return;
                }
            };
            info!("Command: SET {}", dps_summary(&dps));
            match device.set_multiple_values(dps).await {
                Ok(reply) => publish_cmd_ack(client, topic, true, src_json, reply).await,
                Err(e) => {
                    error!("SET failed: {e}");
                    publish_cmd_ack(client, topic, false, src_json, Some(e.to_json())).await;
                }
            }
        }

        other => {
            warn!("Unknown command: {other}");
            publish_cmd_ack(client, topic, false, src_json, None).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

async fn run_bridge(cli: &Cli, mqtt_url: Option<&str>) -> Result<ExitCode> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut config = load_config(cli.config.as_deref())?;

    loop {
        let mqtt = config.mqtt.clone().unwrap_or_default();
        let url = mqtt_url
            .map(str::to_string)
            .or(mqtt.url.clone())
            .context("Missing MQTT URL (--mqtt-url or [mqtt].url)")?;
        let (mqtt_host, mqtt_port) = parse_mqtt_url(&url)?;

        let device_config = build_device_config(cli, &config.device)?;
        let device = Arc::new(TuyaDevice::new(device_config)?);
        device.set_socket_persistent(true);
        let device_config = device.config();
        info!(
            "Bridging device {} at {} to MQTT {mqtt_host}:{mqtt_port}",
            device_config.dev_id, device_config.address
        );

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        client
            .subscribe(&mqtt.subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {}", mqtt.subscribe_topic);

        // Task 1: device events -> MQTT
        let mut rx = device.subscribe();
        let client_events = client.clone();
        let topic_events = mqtt.publish_topic.clone();
        let event_handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DeviceEvent::StatusUpdate { dps }) => {
                        let Value::Object(dps) = dps else {
                            debug!("Ignoring non-object dps: {dps}");
                            continue;
                        };
                        let msg = dps_message("DPS_UPDATE", dps);
                        publish_json(&client_events, &topic_events, &msg, false).await;
                    }
                    Ok(DeviceEvent::Connected) => info!("Device connected"),
                    Ok(DeviceEvent::Disconnected) => {
                        warn!("Device disconnected, will reconnect on next command");
                    }
                    Ok(DeviceEvent::Message(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event receiver lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("Event channel closed");
                        break;
                    }
                }
            }
        });

        // Task 2: MQTT event loop (receives messages, handles commands)
        let device_cmds = Arc::clone(&device);
        let client_cmds = client.clone();
        let topic_cmds = mqtt.publish_topic.clone();
        let sub_topic = mqtt.subscribe_topic.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_cmds.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload);
                            match serde_json::from_str::<MqttCommand>(&payload) {
                                Ok(cmd) => {
                                    if cmd.op == "SNAPSHOT" {
                                        debug!("MQTT command received: {payload}");
                                    } else {
                                        info!("MQTT command received: {payload}");
                                    }
                                    handle_command(
                                        &payload,
                                        cmd,
                                        &client_cmds,
                                        &topic_cmds,
                                        &device_cmds,
                                    )
                                    .await;
                                }
                                Err(e) => warn!("Failed to parse MQTT command: {e}"),
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: snapshot timer; the first tick publishes the initial snapshot
        let device_snap = Arc::clone(&device);
        let client_snap = client.clone();
        let topic_snap = mqtt.publish_topic.clone();
        let snapshot_period = Duration::from_secs(mqtt.snapshot_interval_secs.max(1));
        let snap_handle = tokio::spawn(async move {
            let mut ticker = interval(snapshot_period);
            loop {
                ticker.tick().await;
                publish_snapshot(&client_snap, &topic_snap, &device_snap).await;
            }
        });

        // Task 4: heartbeat between snapshots
        let device_hb = Arc::clone(&device);
        let hb_handle = tokio::spawn(async move { device_hb.keep_alive().await });

        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        event_handle.abort();
        mqtt_handle.abort();
        snap_handle.abort();
        hb_handle.abort();
        device.close().await;

        if !restart {
            break;
        }

        // Keep the previous config when the new one does not load
        match load_config(cli.config.as_deref()) {
            Ok(new_config) => {
                config = new_config;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug). Default: info.
    // --debug dumps every frame.
    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("info,tuya_lan_bridge=trace")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    // systemd journal already adds timestamps, so omit them when running under systemd.
    // Logs go to stderr so stdout stays pure JSON.
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt()
            .without_time()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
    }

    match cli.command {
        Command::Bridge { ref mqtt_url } => run_bridge(&cli, mqtt_url.as_deref()).await,
        Command::Status => run_status(&open_device(&cli)?).await,
        Command::Set { ref dp, ref value } => run_set(&open_device(&cli)?, dp, value).await,
        Command::Listen => run_listen(open_device(&cli)?).await,
    }
}

/// Device handle for the one-shot commands, from config file plus flags.
fn open_device(cli: &Cli) -> Result<TuyaDevice> {
    let config = load_config(cli.config.as_deref())?;
    let device_config = build_device_config(cli, &config.device)?;
    TuyaDevice::new(device_config).context("Invalid device configuration")
}
