// Device session tests against an in-process fake device
//
// The fake device speaks the device side of the LAN protocol using the
// crate's public codec and session helpers, so these tests exercise the
// full client stack (connect, 3.4 negotiation, framing, routing) over a
// real TCP socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

use tuya_lan_bridge::crypto::TuyaCipher;
use tuya_lan_bridge::message::{pack_message, unpack_message, FrameDecoder, TuyaMessage};
use tuya_lan_bridge::protocol::{decode_payload, encode_payload};
use tuya_lan_bridge::session::{derive_session_key, device_response, verify_finish};
use tuya_lan_bridge::{
    CommandType, DevType, DeviceConfig, DeviceEvent, TuyaDevice, TuyaError, Version,
};

const DEV_ID: &str = "bff9dcd9353a327b67wvgf";
const KEY: &str = "0123456789abcdef";
const DEVICE_NONCE: [u8; 16] = *b"fedcba9876543210";

// =========================================================================
// Fake device
// =========================================================================

/// Ways the fake device departs from the well-behaved default.
#[derive(Default)]
struct Quirks {
    /// Answer DP_QUERY with "data unvalid" like a device22 device
    device22: bool,
    /// Send an empty frame with the query's seqno before the data
    ack_before_data: bool,
    /// Flip a footer byte on query replies
    corrupt_query_footer: bool,
    /// Push a STATUS frame as soon as a 3.3 client connects
    push_on_connect: bool,
    /// Close each connection after this many commands
    hang_up_after: Option<usize>,
    /// Close the connection on the first heartbeat without answering
    drop_first_heartbeat: bool,
    /// Never answer anything
    silent: bool,
    /// Answer a 3.4 negotiation start even when its footer fails to verify
    answer_unauthenticated: bool,
}

struct FakeDevice {
    version: Version,
    key: [u8; 16],
    quirks: Quirks,
    dps: Mutex<Map<String, Value>>,
    connections: AtomicUsize,
    commands: Mutex<Vec<u32>>,
    requests: Mutex<Vec<Value>>,
    heartbeat_dropped: AtomicBool,
}

impl FakeDevice {
    fn new(version: Version, device22: bool) -> Arc<Self> {
        Self::with_quirks(
            version,
            Quirks {
                device22,
                ..Quirks::default()
            },
        )
    }

    fn with_quirks(version: Version, quirks: Quirks) -> Arc<Self> {
        let mut dps = Map::new();
        dps.insert("1".to_string(), json!(true));
        dps.insert("9".to_string(), json!(0));
        Arc::new(Self {
            version,
            key: *KEY.as_bytes().first_chunk::<16>().unwrap(),
            quirks,
            dps: Mutex::new(dps),
            connections: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            heartbeat_dropped: AtomicBool::new(false),
        })
    }

    fn count(&self, cmd: CommandType) -> usize {
        self.commands().iter().filter(|&&c| c == cmd.code()).count()
    }

    fn last_request(&self) -> Option<Value> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn commands(&self) -> Vec<u32> {
        self.commands.lock().unwrap().clone()
    }

    fn dps(&self) -> Value {
        Value::Object(self.dps.lock().unwrap().clone())
    }
}

async fn spawn_device(device: Arc<FakeDevice>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            device.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_connection(stream, Arc::clone(&device)));
        }
    });
    addr
}

/// Encrypt and frame a device-to-client message (always with a return code).
fn device_frame(
    device: &FakeDevice,
    key: &[u8; 16],
    seqno: u32,
    cmd: CommandType,
    body: &[u8],
) -> Vec<u8> {
    let payload = if body.is_empty() {
        Vec::new()
    } else {
        let cipher = TuyaCipher::new(key).unwrap();
        encode_payload(cmd, device.version, &cipher, body).unwrap()
    };
    let mut msg = TuyaMessage::new(seqno, cmd.code(), payload);
    msg.retcode = Some(0);
    let hmac_key = device.version.uses_session_key().then_some(&key[..]);
    pack_message(&msg, hmac_key).unwrap()
}

/// Flip the last footer byte so the CRC or HMAC no longer verifies.
fn corrupt_footer(mut frame: Vec<u8>) -> Vec<u8> {
    let at = frame.len() - 5;
    frame[at] ^= 0xff;
    frame
}

fn status_push(device: &FakeDevice, dps: &Value) -> Vec<u8> {
    let push = match device.version {
        Version::V3_3 => json!({ "devId": DEV_ID, "dps": dps, "t": 1700000000 }),
        Version::V3_4 => json!({ "protocol": 4, "t": 1700000000, "data": { "dps": dps } }),
    };
    serde_json::to_vec(&push).unwrap()
}

async fn serve_connection(mut stream: TcpStream, device: Arc<FakeDevice>) {
    let local_key = device.key;
    let mut key = local_key;
    let mut client_nonce = [0u8; 16];
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    let mut handled = 0;

    if device.quirks.push_on_connect && device.version == Version::V3_3 {
        let push = status_push(&device, &device.dps());
        let frame = device_frame(&device, &key, 0, CommandType::Status, &push);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.push(&buf[..n]);

        while let Some(frame) = decoder.next_frame() {
            let hmac_key = device.version.uses_session_key().then_some(&key[..]);
            let Ok(msg) = unpack_message(&frame, hmac_key, true) else {
                return;
            };
            if !msg.crc_good {
                if device.quirks.answer_unauthenticated
                    && msg.cmd == CommandType::SessKeyNegStart.code()
                {
                    let resp = device_response(&local_key, &[0u8; 16], &DEVICE_NONCE).unwrap();
                    let reply =
                        device_frame(&device, &key, msg.seqno, CommandType::SessKeyNegResp, &resp);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                    continue;
                }
                // A real device drops frames it cannot authenticate; hang up instead
                // so the client fails fast.
                return;
            }
            let cipher = TuyaCipher::new(&key).unwrap();
            let Ok(plain) = decode_payload(device.version, &cipher, &msg.payload) else {
                return;
            };
            device.commands.lock().unwrap().push(msg.cmd);
            if let Ok(request) = serde_json::from_slice::<Value>(&plain) {
                device.requests.lock().unwrap().push(request);
            }
            if device.quirks.silent {
                continue;
            }

            let mut replies = Vec::new();
            match CommandType::from_code(msg.cmd) {
                Some(CommandType::SessKeyNegStart) => {
                    client_nonce.copy_from_slice(&plain[..16]);
                    let resp = device_response(&local_key, &plain, &DEVICE_NONCE).unwrap();
                    replies.push(device_frame(
                        &device,
                        &key,
                        msg.seqno,
                        CommandType::SessKeyNegResp,
                        &resp,
                    ));
                }
                Some(CommandType::SessKeyNegFinish) => {
                    if !verify_finish(&local_key, &DEVICE_NONCE, &plain).unwrap() {
                        return;
                    }
                    key = derive_session_key(&local_key, &client_nonce, &DEVICE_NONCE).unwrap();
                }
                Some(CommandType::DpQuery) => {
                    let body = if device.quirks.device22 {
                        b"json obj data unvalid".to_vec()
                    } else {
                        serde_json::to_vec(&json!({ "devId": DEV_ID, "dps": device.dps() }))
                            .unwrap()
                    };
                    if device.quirks.ack_before_data {
                        replies.push(device_frame(&device, &key, msg.seqno, CommandType::DpQuery, b""));
                    }
                    let reply = device_frame(&device, &key, msg.seqno, CommandType::DpQuery, &body);
                    replies.push(if device.quirks.corrupt_query_footer {
                        corrupt_footer(reply)
                    } else {
                        reply
                    });
                }
                Some(CommandType::DpQueryNew) => {
                    let body = json!({ "protocol": 4, "t": 1700000000, "data": { "dps": device.dps() } });
                    let body = serde_json::to_vec(&body).unwrap();
                    if device.quirks.ack_before_data {
                        replies.push(device_frame(
                            &device,
                            &key,
                            msg.seqno,
                            CommandType::DpQueryNew,
                            b"",
                        ));
                    }
                    let reply =
                        device_frame(&device, &key, msg.seqno, CommandType::DpQueryNew, &body);
                    replies.push(if device.quirks.corrupt_query_footer {
                        corrupt_footer(reply)
                    } else {
                        reply
                    });
                }
                Some(CommandType::ControlNew) if device.version == Version::V3_3 => {
                    // device22 query: answer with every data point
                    let body = json!({ "devId": DEV_ID, "dps": device.dps() });
                    let body = serde_json::to_vec(&body).unwrap();
                    replies.push(device_frame(
                        &device,
                        &key,
                        msg.seqno,
                        CommandType::ControlNew,
                        &body,
                    ));
                }
                Some(cmd @ (CommandType::Control | CommandType::ControlNew)) => {
                    let request: Value = serde_json::from_slice(&plain).unwrap();
                    let changed = request
                        .get("dps")
                        .or_else(|| request.get("data").and_then(|d| d.get("dps")))
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    device.dps.lock().unwrap().extend(changed.clone());

                    replies.push(device_frame(&device, &key, msg.seqno, cmd, b""));
                    let push = status_push(&device, &Value::Object(changed));
                    replies.push(device_frame(&device, &key, 0, CommandType::Status, &push));
                }
                Some(CommandType::UpdateDps) => {
                    // Acknowledge, then push the current value of each requested dp
                    let request: Value = serde_json::from_slice(&plain).unwrap();
                    let current = device.dps.lock().unwrap().clone();
                    let refreshed: Map<String, Value> = request["dpId"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|id| {
                            let id = id.to_string();
                            current.get(&id).map(|v| (id, v.clone()))
                        })
                        .collect();
                    replies.push(device_frame(&device, &key, msg.seqno, CommandType::UpdateDps, b""));
                    let push = status_push(&device, &Value::Object(refreshed));
                    replies.push(device_frame(&device, &key, 0, CommandType::Status, &push));
                }
                Some(CommandType::HeartBeat) => {
                    if device.quirks.drop_first_heartbeat
                        && !device.heartbeat_dropped.swap(true, Ordering::SeqCst)
                    {
                        return;
                    }
                    replies.push(device_frame(&device, &key, msg.seqno, CommandType::HeartBeat, b""));
                }
                _ => {}
            }

            for reply in replies {
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }

            handled += 1;
            if device.quirks.hang_up_after.is_some_and(|limit| handled >= limit) {
                return;
            }
        }
    }
}

fn config_for(addr: SocketAddr, version: Version) -> DeviceConfig {
    DeviceConfig::builder()
        .dev_id(DEV_ID)
        .address(addr.ip().to_string())
        .port(addr.port())
        .local_key(KEY)
        .version(version)
        .connection_timeout(Duration::from_secs(2))
        .retry_limit(1)
        .retry_delay(Duration::from_millis(10))
        .build()
}

async fn next_status_update(events: &mut tuya_lan_bridge::EventReceiver) -> Value {
    timeout(Duration::from_secs(2), async {
        loop {
            if let DeviceEvent::StatusUpdate { dps } = events.recv().await.unwrap() {
                return dps;
            }
        }
    })
    .await
    .expect("no status update from device")
}

// =========================================================================
// Protocol 3.3
// =========================================================================

#[tokio::test]
async fn v33_status_returns_dps() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();

    let status = device.status().await.unwrap();
    assert_eq!(status["dps"], json!({ "1": true, "9": 0 }));
    assert_eq!(status["devId"], DEV_ID);
    assert_eq!(device.cached_dps().await.get("1"), Some(&json!(true)));
    assert_eq!(fake.commands(), vec![CommandType::DpQuery.code()]);
}

#[tokio::test]
async fn v33_per_call_sockets_reconnect_every_command() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    assert!(!device.is_socket_persistent());

    device.status().await.unwrap();
    assert!(!device.is_connected().await);
    device.set_value(1, json!(false)).await.unwrap();
    device.status().await.unwrap();

    assert_eq!(fake.connections(), 3);
    assert_eq!(fake.dps()["1"], json!(false));
}

#[tokio::test]
async fn v33_persistent_socket_is_reused() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    device.set_socket_persistent(true);

    device.status().await.unwrap();
    device.heartbeat().await.unwrap();
    device.turn_off(1).await.unwrap();
    device.status().await.unwrap();
    assert!(device.is_connected().await);
    assert_eq!(fake.connections(), 1);

    device.close().await;
    assert!(!device.is_connected().await);
    device.status().await.unwrap();
    assert_eq!(fake.connections(), 2);
}

#[tokio::test]
async fn v33_device22_fallback() {
    let fake = FakeDevice::new(Version::V3_3, true);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    device.set_socket_persistent(true);
    assert_eq!(device.dev_type().await, DevType::Default);

    let status = device.status().await.unwrap();
    assert_eq!(status["dps"]["9"], json!(0));
    assert_eq!(device.dev_type().await, DevType::Device22);
    assert_eq!(
        fake.commands(),
        vec![CommandType::DpQuery.code(), CommandType::ControlNew.code()]
    );

    // Later queries go straight to the device22 dialect
    device.status().await.unwrap();
    assert_eq!(fake.commands().last(), Some(&CommandType::ControlNew.code()));
}

#[tokio::test]
async fn v33_set_value_pushes_status_update() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    device.set_socket_persistent(true);
    let mut events = device.subscribe();

    let reply = device.set_value("9", json!(25)).await.unwrap();
    assert!(reply.is_none(), "CONTROL is acknowledged with an empty frame");

    let dps = next_status_update(&mut events).await;
    assert_eq!(dps, json!({ "9": 25 }));
    assert_eq!(device.cached_dps().await.get("9"), Some(&json!(25)));
}

#[tokio::test]
async fn v33_empty_ack_before_query_data_is_skipped() {
    let fake = FakeDevice::with_quirks(
        Version::V3_3,
        Quirks {
            ack_before_data: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();

    let status = device.status().await.unwrap();
    assert_eq!(status["dps"], json!({ "1": true, "9": 0 }));
}

#[tokio::test]
async fn v33_corrupt_reply_footer_is_a_key_error() {
    let fake = FakeDevice::with_quirks(
        Version::V3_3,
        Quirks {
            corrupt_query_footer: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();

    let err = device.status().await.unwrap_err();
    assert!(matches!(err, TuyaError::KeyOrVersion { .. }), "unexpected error: {err:?}");
    assert_eq!(err.to_json()["Err"], json!("914"));
    assert!(device.cached_dps().await.is_empty());
}

#[tokio::test]
async fn v33_update_dps_triggers_push() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    device.set_socket_persistent(true);
    let mut events = device.subscribe();

    device.update_dps(&[9]).await.unwrap();
    assert_eq!(fake.commands(), vec![CommandType::UpdateDps.code()]);
    assert_eq!(fake.last_request(), Some(json!({ "dpId": [9] })));

    let dps = next_status_update(&mut events).await;
    assert_eq!(dps, json!({ "9": 0 }));
}

#[tokio::test]
async fn update_dps_without_ids_is_rejected() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();

    let err = device.update_dps(&[]).await.unwrap_err();
    assert!(matches!(err, TuyaError::MissingParams { .. }));
    assert_eq!(fake.connections(), 0);
}

#[tokio::test]
async fn v33_receive_returns_pushed_status() {
    let fake = FakeDevice::with_quirks(
        Version::V3_3,
        Quirks {
            push_on_connect: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();

    let pushed = device.receive(Duration::from_secs(2)).await.unwrap();
    assert_eq!(pushed, Some(json!({ "dps": { "1": true, "9": 0 } })));
    assert_eq!(device.cached_dps().await.get("9"), Some(&json!(0)));
}

#[tokio::test]
async fn receive_times_out_without_push() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();

    let pushed = device.receive(Duration::from_millis(100)).await.unwrap();
    assert_eq!(pushed, None);
    assert!(device.is_connected().await);
}

#[tokio::test]
async fn v33_persistent_socket_reconnects_after_device_hangs_up() {
    let fake = FakeDevice::with_quirks(
        Version::V3_3,
        Quirks {
            hang_up_after: Some(1),
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    device.set_socket_persistent(true);
    let mut events = device.subscribe();

    device.status().await.unwrap();
    timeout(Duration::from_secs(2), async {
        while !matches!(events.recv().await.unwrap(), DeviceEvent::Disconnected) {}
    })
    .await
    .expect("device hang-up was not noticed");
    assert!(!device.is_connected().await);

    let status = device.status().await.unwrap();
    assert_eq!(status["dps"]["1"], json!(true));
    assert_eq!(fake.connections(), 2);
}

#[tokio::test]
async fn set_timeout_bounds_the_wait_for_a_silent_device() {
    let fake = FakeDevice::with_quirks(
        Version::V3_3,
        Quirks {
            silent: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    device.set_timeout(Duration::from_millis(150));

    let started = Instant::now();
    let err = device.status().await.unwrap_err();
    assert!(matches!(err, TuyaError::CommandTimeout { cmd: 0x0a }), "unexpected error: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!device.is_connected().await);
}

#[tokio::test]
async fn keep_alive_carries_on_after_a_failed_heartbeat() {
    let fake = FakeDevice::with_quirks(
        Version::V3_3,
        Quirks {
            drop_first_heartbeat: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let mut config = config_for(addr, Version::V3_3);
    config.heartbeat_interval = Duration::from_millis(100);
    let device = Arc::new(TuyaDevice::new(config).unwrap());
    device.set_socket_persistent(true);

    let runner = Arc::clone(&device);
    let handle = tokio::spawn(async move { runner.keep_alive().await });

    let waited = timeout(Duration::from_secs(3), async {
        while fake.count(CommandType::HeartBeat) < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    handle.abort();

    assert!(waited.is_ok(), "keep-alive stopped after the first failure");
    assert!(fake.connections() >= 2);
}

// =========================================================================
// Protocol 3.4
// =========================================================================

#[tokio::test]
async fn v34_negotiates_session_and_queries() {
    let fake = FakeDevice::new(Version::V3_4, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_4)).unwrap();
    device.set_socket_persistent(true);

    let status = device.status().await.unwrap();
    assert_eq!(status["dps"], json!({ "1": true, "9": 0 }));
    assert_eq!(status["protocol"], json!(4));
    assert_eq!(
        fake.commands(),
        vec![
            CommandType::SessKeyNegStart.code(),
            CommandType::SessKeyNegFinish.code(),
            CommandType::DpQueryNew.code(),
        ]
    );
}

#[tokio::test]
async fn v34_set_value_uses_control_new() {
    let fake = FakeDevice::new(Version::V3_4, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_4)).unwrap();
    device.set_socket_persistent(true);
    let mut events = device.subscribe();

    device.turn_off(1).await.unwrap();
    let dps = next_status_update(&mut events).await;
    assert_eq!(dps, json!({ "1": false }));
    assert_eq!(fake.dps()["1"], json!(false));
    assert_eq!(fake.commands().last(), Some(&CommandType::ControlNew.code()));

    // Same socket, same session key
    device.heartbeat().await.unwrap();
    assert_eq!(fake.connections(), 1);
}

#[tokio::test]
async fn v34_each_connection_negotiates_again() {
    let fake = FakeDevice::new(Version::V3_4, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_4)).unwrap();

    device.status().await.unwrap();
    device.status().await.unwrap();

    let starts = fake
        .commands()
        .iter()
        .filter(|&&c| c == CommandType::SessKeyNegStart.code())
        .count();
    assert_eq!(starts, 2);
    assert_eq!(fake.connections(), 2);
}

#[tokio::test]
async fn v34_wrong_key_is_reported_as_key_error() {
    // The device answers the negotiation start under its own key, so the
    // reply's HMAC cannot verify on our side.
    let fake = FakeDevice::with_quirks(
        Version::V3_4,
        Quirks {
            answer_unauthenticated: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let mut config = config_for(addr, Version::V3_4);
    config.local_key = "ffffffffffffffff".to_string();
    let device = TuyaDevice::new(config).unwrap();

    let err = device.status().await.unwrap_err();
    assert!(matches!(err, TuyaError::KeyOrVersion { .. }), "unexpected error: {err:?}");
    assert_eq!(err.to_json()["Err"], json!("914"));
    assert!(!device.is_connected().await);
    assert!(fake.commands().is_empty());
}

#[tokio::test]
async fn v34_wrong_key_device_hangs_up() {
    let fake = FakeDevice::new(Version::V3_4, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let mut config = config_for(addr, Version::V3_4);
    config.local_key = "ffffffffffffffff".to_string();
    let device = TuyaDevice::new(config).unwrap();

    let err = device.status().await.unwrap_err();
    assert!(matches!(err, TuyaError::Disconnected), "unexpected error: {err:?}");
    assert!(!device.is_connected().await);
    assert!(!fake.commands().contains(&CommandType::DpQueryNew.code()));
}

#[tokio::test]
async fn v34_empty_ack_before_query_data_is_skipped() {
    let fake = FakeDevice::with_quirks(
        Version::V3_4,
        Quirks {
            ack_before_data: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_4)).unwrap();

    let status = device.status().await.unwrap();
    assert_eq!(status["dps"], json!({ "1": true, "9": 0 }));
}

#[tokio::test]
async fn v34_corrupt_reply_footer_is_a_key_error() {
    let fake = FakeDevice::with_quirks(
        Version::V3_4,
        Quirks {
            corrupt_query_footer: true,
            ..Quirks::default()
        },
    );
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_4)).unwrap();
    device.set_socket_persistent(true);

    let err = device.status().await.unwrap_err();
    assert!(matches!(err, TuyaError::KeyOrVersion { .. }), "unexpected error: {err:?}");
    assert!(!err.is_retryable());
    // The session itself is fine; only that reply was rejected
    assert!(device.is_connected().await);
    assert_eq!(fake.connections(), 1);
}

// =========================================================================
// Failures without a device
// =========================================================================

#[test]
fn short_key_is_rejected_without_io() {
    let config = DeviceConfig::builder()
        .dev_id(DEV_ID)
        .address("127.0.0.1")
        .local_key("tooshort")
        .build();
    assert!(matches!(
        TuyaDevice::new(config),
        Err(TuyaError::InvalidKey { len: 8 })
    ));
}

#[tokio::test]
async fn connection_refused_reports_connect_error() {
    // Bind then drop to get a port with nothing listening
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();
    let err = device.status().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.to_json()["Err"], json!("901"));
}

/// Accepts connections and closes them straight away, counting each one.
async fn spawn_hang_up_listener() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });
    (addr, accepted)
}

#[tokio::test]
async fn connect_retries_up_to_retry_limit_with_backoff() {
    let (addr, accepted) = spawn_hang_up_listener().await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_4)).unwrap();
    device.set_retry(3, Duration::from_millis(40));

    let started = Instant::now();
    let err = device.status().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_retryable(), "unexpected error: {err:?}");
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    // Two waits: 40ms then 80ms
    assert!(elapsed >= Duration::from_millis(120), "retried too fast: {elapsed:?}");
}

#[tokio::test]
async fn zero_retry_limit_still_makes_one_attempt() {
    let (addr, accepted) = spawn_hang_up_listener().await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_4)).unwrap();
    device.set_retry(0, Duration::from_millis(10));

    assert!(device.status().await.is_err());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_set_is_rejected() {
    let fake = FakeDevice::new(Version::V3_3, false);
    let addr = spawn_device(Arc::clone(&fake)).await;
    let device = TuyaDevice::new(config_for(addr, Version::V3_3)).unwrap();

    let err = device.set_multiple_values(Map::new()).await.unwrap_err();
    assert!(matches!(err, TuyaError::MissingParams { .. }));
    assert_eq!(fake.connections(), 0);
}
