// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Tuya LAN protocol 3.3/3.4 client library

//! # tuya-lan-bridge
//!
//! Local-network control of Tuya smart devices (plugs, switches, bulbs)
//! over the Tuya LAN protocol, versions 3.3 and 3.4, without the Tuya cloud.
//!
//! Each device is reached over TCP port 6668 and addressed by its device id
//! and 16-character local key. Version 3.4 devices negotiate a per-connection
//! session key before any command is accepted; this happens automatically.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tuya_lan_bridge::{DeviceConfig, TuyaDevice, Version};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DeviceConfig::builder()
//!         .dev_id("bff9dcd9353a327b67wvgf")
//!         .address("192.168.1.145")
//!         .local_key(";B#tSrtX1#|#B)j`")
//!         .version(Version::V3_4)
//!         .build();
//!
//!     let device = TuyaDevice::new(config)?;
//!     device.set_socket_persistent(true);
//!
//!     let mut events = device.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let status = device.status().await?;
//!     println!("{}", serde_json::to_string_pretty(&status)?);
//!
//!     device.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod crypto;
pub mod device;
pub mod error;
pub mod event;
pub mod message;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{DevType, DeviceConfig, DeviceConfigBuilder};
pub use device::TuyaDevice;
pub use error::{ErrorCode, Result, TuyaError};
pub use event::{DeviceEvent, EventReceiver};
pub use message::TuyaMessage;
pub use protocol::{CommandType, Version};
