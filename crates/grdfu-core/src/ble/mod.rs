//! Blocking BLE layer.
//!
//! - `platform`: the callback-driven stack seam
//! - `rendezvous`: single-slot result hand-off
//! - `buffer`: per-characteristic notification queues
//! - `facade`: blocking, timeout-bounded operations on top of the above
//! - `mock`: in-process platform hosting a scripted device

pub mod buffer;
pub mod facade;
pub mod mock;
pub mod platform;
pub mod rendezvous;

use thiserror::Error;

pub use buffer::BufferKind;
pub use facade::{BlockingBle, ScanFilter, WriteProgress};
pub use mock::{MockDevice, MockPlatform, MockReaction};
pub use platform::{
    BleEvent, BleEventHandler, BlePlatform, CharProperties, Characteristic, Peripheral, Service,
    WriteKind,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("timeout: {waiter}")]
    Timeout { waiter: String },

    #[error("disconnected: {waiter}")]
    Disconnected { waiter: String },

    #[error("{0}")]
    Other(String),
}
