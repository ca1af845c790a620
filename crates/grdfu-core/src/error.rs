//! Error taxonomy shared by the engines and the orchestrator.

use thiserror::Error;

use crate::ble::BleError;
use crate::image::FirmwareError;
use crate::protocol::FrameError;

#[derive(Error, Debug)]
pub enum DfuError {
    /// No matching transport event within the deadline.
    #[error("communication timeout: {0}")]
    Timeout(String),

    /// Peer dropped mid-operation.
    #[error("disconnect error: {0}")]
    Disconnected(String),

    /// Checksum mismatch, unexpected opcode/address/length, overlap, ...
    #[error("{0}")]
    Protocol(String),

    /// Connect/discover/write failures reported by the platform.
    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Firmware(#[from] FirmwareError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DfuError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        DfuError::Protocol(message.into())
    }

    /// True for failures caused by the link rather than by device state.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, DfuError::Timeout(_) | DfuError::Disconnected(_))
    }
}

impl From<BleError> for DfuError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Timeout { waiter } => DfuError::Timeout(waiter),
            BleError::Disconnected { waiter } => DfuError::Disconnected(waiter),
            BleError::Other(msg) => DfuError::Transport(msg),
        }
    }
}

impl From<FrameError> for DfuError {
    fn from(err: FrameError) -> Self {
        DfuError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_error_mapping() {
        let err: DfuError = BleError::Timeout {
            waiter: "readNotification".into(),
        }
        .into();
        assert!(matches!(err, DfuError::Timeout(ref w) if w == "readNotification"));
        assert!(err.is_link_failure());

        let err: DfuError = BleError::Other("write failed".into()).into();
        assert!(matches!(err, DfuError::Transport(_)));
        assert_eq!(err.to_string(), "write failed");
        assert!(!err.is_link_failure());
    }
}
