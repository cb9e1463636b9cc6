//! BlueFusion dual-interface Bluetooth LE observation and analysis stack.
//!
//! Captures advertisements and connection traffic from a host controller
//! and an external sniffer radio, dissects and classifies it, decrypts it
//! where keys are known, and drives per-device auto-connect policies.
//!
//! The host-OS radio binding, the serial transport to a sniffer dongle, and
//! any HTTP/UI façade are out of scope for this crate; they are expected to
//! be layered on top of [`radio::RadioInterface`] and the [`inspect`] /
//! [`connect`] event streams.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub use bluefusion_crypto as crypto;

#[path = "pattern/pattern.rs"]
pub mod pattern;
#[path = "proto/proto.rs"]
pub mod proto;
#[path = "radio/radio.rs"]
pub mod radio;
#[path = "inspect/inspect.rs"]
pub mod inspect;
#[path = "connect/connect.rs"]
pub mod connect;

pub(crate) type SyncMutex<T> = parking_lot::Mutex<T>;
pub(crate) type SyncRwLock<T> = parking_lot::RwLock<T>;
