//! Session configuration, loadable from TOML.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Hard cap on one BLE write, whatever the link reports.
pub const PACKET_MAX_SIZE: usize = 244;

/// Per-operation transport deadlines, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleTimeouts {
    pub power_on_ms: u64,
    pub scan_ms: u64,
    pub connect_ms: u64,
    pub disconnect_ms: u64,
    pub discover_ms: u64,
    pub notify_ms: u64,
    pub write_with_response_ms: u64,
    /// Backpressure window for write-without-response.
    pub write_without_response_ms: u64,
    /// Standard engine command response.
    pub response_ms: u64,
    /// Fast engine command response.
    pub fast_response_ms: u64,
}

impl Default for BleTimeouts {
    fn default() -> Self {
        Self {
            power_on_ms: 30_000,
            scan_ms: 10_000,
            connect_ms: 3_000,
            disconnect_ms: 31_000,
            discover_ms: 10_000,
            notify_ms: 31_000,
            write_with_response_ms: 1_000,
            write_without_response_ms: 100,
            response_ms: 3_000,
            fast_response_ms: 6_000,
        }
    }
}

impl BleTimeouts {
    pub fn power_on(&self) -> Duration {
        Duration::from_millis(self.power_on_ms)
    }
    pub fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_ms)
    }
    pub fn discover(&self) -> Duration {
        Duration::from_millis(self.discover_ms)
    }
    pub fn notify(&self) -> Duration {
        Duration::from_millis(self.notify_ms)
    }
    pub fn write_with_response(&self) -> Duration {
        Duration::from_millis(self.write_with_response_ms)
    }
    pub fn write_without_response(&self) -> Duration {
        Duration::from_millis(self.write_without_response_ms)
    }
    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }
    pub fn fast_response(&self) -> Duration {
        Duration::from_millis(self.fast_response_ms)
    }
}

/// Fixed pauses the devices need between protocol steps, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleDelays {
    /// Around the disconnect that follows a mode switch.
    pub mode_switch_ms: u64,
    /// After entering copy mode.
    pub copy_mode_ms: u64,
    /// Before the fast checksum check.
    pub fast_checksum_ms: u64,
    /// After the fast write-boot / start-copy.
    pub fast_finalize_ms: u64,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            mode_switch_ms: 200,
            copy_mode_ms: 500,
            fast_checksum_ms: 200,
            fast_finalize_ms: 1_000,
        }
    }
}

impl SettleDelays {
    /// No pauses at all (simulated devices).
    pub fn none() -> Self {
        Self {
            mode_switch_ms: 0,
            copy_mode_ms: 0,
            fast_checksum_ms: 0,
            fast_finalize_ms: 0,
        }
    }

    pub fn mode_switch(&self) -> Duration {
        Duration::from_millis(self.mode_switch_ms)
    }
    pub fn copy_mode(&self) -> Duration {
        Duration::from_millis(self.copy_mode_ms)
    }
    pub fn fast_checksum(&self) -> Duration {
        Duration::from_millis(self.fast_checksum_ms)
    }
    pub fn fast_finalize(&self) -> Duration {
        Duration::from_millis(self.fast_finalize_ms)
    }
}

/// Configuration for an update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Standard engine streams with program-start-fast / program-flash-fast.
    pub fast_mode: bool,
    /// Advertised name to look for when reconnecting after a mode switch.
    pub reconnect_name: Option<String>,
    /// Control-point command written first in the legacy flow.
    pub control_command: Option<Vec<u8>>,
    pub max_packet_size: usize,
    pub timeouts: BleTimeouts,
    pub delays: SettleDelays,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fast_mode: false,
            reconnect_name: None,
            control_command: None,
            max_packet_size: PACKET_MAX_SIZE,
            timeouts: BleTimeouts::default(),
            delays: SettleDelays::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Packet cap clamped to the protocol maximum.
    pub fn packet_limit(&self) -> usize {
        self.max_packet_size.clamp(1, PACKET_MAX_SIZE)
    }
}
