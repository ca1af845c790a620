//! GRDFU-Core: Goodix GR5xxx BLE firmware update in Rust.
//!
//! This crate drives the device-side DFU bootloader of GR5xxx chips over
//! Bluetooth Low Energy, with the standard framed protocol and the fast
//! raw-command protocol.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **BLE**: Blocking facade over a callback-driven stack (`BlePlatform`, mock)
//! - **Codec**: Little-endian byte cursor and checksums
//! - **Image**: Image info, boot info and firmware classification
//! - **Memory**: Flash area overlap checks
//! - **Protocol**: UUIDs, opcodes, frame encoding
//! - **Standard / Fast**: The two protocol engines
//! - **Events / Listener**: Log sinks, progress callbacks, cancellation
//! - **Session**: Worker-thread orchestrator
//! - **Sim**: Simulated bootloaders for tests and dry runs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use grdfu_core::ble::{MockPlatform, Peripheral};
//! use grdfu_core::session::{DfuSession, EngineKind};
//!
//! let platform = Arc::new(MockPlatform::new());
//! let firmware = std::fs::read("app_fw.bin").expect("read firmware");
//!
//! let mut session = DfuSession::new(platform).with_engine(EngineKind::Fast);
//! session
//!     .start_dfu(Peripheral::new("AA:BB:CC:DD:EE:FF", None), firmware)
//!     .expect("start");
//! session.join().expect("DFU failed");
//! ```

pub mod ble;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod fast;
pub mod image;
pub mod listener;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod standard;
pub mod state;

// Re-exports for convenience
pub use ble::{BleError, BlePlatform, BlockingBle, MockPlatform, Peripheral, ScanFilter};
pub use config::{BleTimeouts, SessionConfig, SettleDelays};
pub use error::{DfuError, Result};
pub use events::{LogLevel, LogSink, Logger, MemorySink, TracingSink};
pub use fast::FastEngine;
pub use image::{EncryptionState, FirmwareBlob, FirmwareError, ImageInfo};
pub use listener::{CancelToken, DfuListener, InlineExecutor, NullListener, ThreadExecutor};
pub use memory::MemoryArea;
pub use session::{DfuSession, EngineKind};
pub use standard::StandardEngine;
pub use state::{Outcome, UpdateMode, UpdateRequest};
