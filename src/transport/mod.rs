// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Connection transport

pub mod command;
pub mod connection;

pub use connection::{Connection, DpsCache};
