//! Characteristic binding for the fast DFU service.

use tracing::{debug, trace};

use crate::ble::{BlePlatform, BlockingBle, BufferKind, Characteristic, WriteProgress};
use crate::codec::to_hex;
use crate::error::{DfuError, Result};
use crate::protocol::{FAST_DFU_CMD_UUID, FAST_DFU_DATA_UUID, FAST_DFU_SERVICE_UUID, fast_command};

/// Command and data characteristics of the fast DFU service.
pub struct FastLink<'a, P: BlePlatform> {
    ble: &'a BlockingBle<P>,
    cmd: Characteristic,
    data: Characteristic,
}

impl<'a, P: BlePlatform> FastLink<'a, P> {
    /// Look both characteristics up; command responses arrive one
    /// notification per answer.
    pub fn bind(ble: &'a BlockingBle<P>) -> Result<Self> {
        if !ble.is_connected() {
            return Err(DfuError::Disconnected(
                "bondTo: The device is not connected. Please connect and try again.".into(),
            ));
        }
        if ble.services(Some(FAST_DFU_SERVICE_UUID))?.is_empty() {
            return Err(DfuError::protocol(format!(
                "DFU Service not found. Please check UUID: {}",
                FAST_DFU_SERVICE_UUID
            )));
        }
        let find = |uuid| -> Result<Characteristic> {
            ble.find_characteristic(FAST_DFU_SERVICE_UUID, uuid)?
                .ok_or_else(|| {
                    DfuError::protocol(format!(
                        "DFU characteristic not found. Please check UUID: {}",
                        uuid
                    ))
                })
        };
        let cmd = find(FAST_DFU_CMD_UUID)?;
        ble.enable_notification(&cmd, BufferKind::Frame)?;
        let data = find(FAST_DFU_DATA_UUID)?;
        debug!("fast DFU service bound");
        Ok(Self { ble, cmd, data })
    }

    pub fn send_cmd(&self, opcode: u8, args: &[u8]) -> Result<()> {
        let command = fast_command(opcode, args);
        trace!(opcode = format_args!("0x{:02X}", opcode), data = %to_hex(&command), "send");
        self.ble.write_without_response(&self.cmd, &command, None)?;
        Ok(())
    }

    /// Next raw response, `[opcode][args...]`.
    pub fn recv(&self) -> Result<Vec<u8>> {
        let frame = self
            .ble
            .read_notification_frame(&self.cmd.uuid, self.ble.timeouts().fast_response())?;
        trace!(data = %to_hex(&frame), "recv");
        Ok(frame)
    }

    /// Payload bytes on the data characteristic.
    pub fn send_data(&self, data: &[u8], progress: Option<WriteProgress<'_>>) -> Result<usize> {
        Ok(self.ble.write_without_response(&self.data, data, progress)?)
    }
}
