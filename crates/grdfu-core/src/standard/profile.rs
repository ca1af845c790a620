//! Characteristic binding and frame I/O for the standard DFU service.

use tracing::{debug, trace};

use crate::ble::{BlePlatform, BlockingBle, BufferKind, Characteristic, WriteProgress};
use crate::codec::to_hex;
use crate::error::{DfuError, Result};
use crate::protocol::{
    DFU_CONTROL_POINT_UUID, DFU_RX_UUID, DFU_SERVICE_UUID, DFU_TX_UUID, FRAME_HEAD_SIZE,
    FrameHeader, Response, encode_frame,
};

/// The three standard characteristics on a connected device.
pub struct StandardLink<'a, P: BlePlatform> {
    ble: &'a BlockingBle<P>,
    tx: Characteristic,
    rx: Characteristic,
    ctrl: Characteristic,
}

impl<'a, P: BlePlatform> StandardLink<'a, P> {
    /// Look the characteristics up and subscribe to responses.
    pub fn bind(ble: &'a BlockingBle<P>) -> Result<Self> {
        if !ble.is_connected() {
            return Err(DfuError::Disconnected(
                "bondTo: The device is not connected. Please connect and try again.".into(),
            ));
        }
        if ble.services(Some(DFU_SERVICE_UUID))?.is_empty() {
            return Err(DfuError::protocol(format!(
                "DFU Service not found. Please check UUID: {}",
                DFU_SERVICE_UUID
            )));
        }
        let find = |uuid| -> Result<Characteristic> {
            ble.find_characteristic(DFU_SERVICE_UUID, uuid)?
                .ok_or_else(|| {
                    DfuError::protocol(format!(
                        "DFU characteristic not found. Please check UUID: {}",
                        uuid
                    ))
                })
        };
        let tx = find(DFU_TX_UUID)?;
        ble.enable_notification(&tx, BufferKind::Stream)?;
        let rx = find(DFU_RX_UUID)?;
        let ctrl = find(DFU_CONTROL_POINT_UUID)?;
        debug!(extended = ctrl.properties.indicate, "standard DFU service bound");
        Ok(Self { ble, tx, rx, ctrl })
    }

    /// Whether the device speaks the extended (app-bootloader) scheme.
    pub fn is_extended(&self) -> bool {
        self.ctrl.properties.indicate
    }

    pub fn send_ctrl(&self, data: &[u8]) -> Result<()> {
        trace!(data = %to_hex(data), "control point");
        self.ble.write_without_response(&self.ctrl, data, None)?;
        Ok(())
    }

    /// Frame and send one command.
    pub fn send_cmd(&self, opcode: u16, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(opcode, payload);
        trace!(opcode = format_args!("0x{:02X}", opcode), len = payload.len(), "send");
        self.ble.write_without_response(&self.rx, &frame, None)?;
        Ok(())
    }

    /// Unframed bulk write on the command characteristic.
    pub fn send_raw(&self, data: &[u8], progress: Option<WriteProgress<'_>>) -> Result<usize> {
        Ok(self.ble.write_without_response(&self.rx, data, progress)?)
    }

    /// Read one response frame and check it against `opcode`.
    pub fn recv(&self, opcode: u16) -> Result<Response> {
        let timeout = self.ble.timeouts().response();
        let head = self
            .ble
            .read_notification(&self.tx.uuid, FRAME_HEAD_SIZE, timeout)?;
        let header = FrameHeader::parse(&head)?;
        let body = self
            .ble
            .read_notification(&self.tx.uuid, header.body_len(), timeout)?;
        let response = Response::decode(header, &body, opcode)?;
        trace!(
            opcode = format_args!("0x{:02X}", opcode),
            data = %to_hex(&response.data),
            "recv"
        );
        Ok(response)
    }

    /// Send a command and wait for its response.
    pub fn transact(&self, opcode: u16, payload: &[u8]) -> Result<Response> {
        self.send_cmd(opcode, payload)?;
        self.recv(opcode)
    }
}

/// Fail with `"<step>: Command response error."` unless the status is success.
pub fn expect_success(step: &str, response: &Response) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(DfuError::protocol(format!(
            "{}: Command response error.",
            step
        )))
    }
}
