//! Fast DFU engine.
//!
//! Raw `[magic][opcode][args]` commands on the command characteristic, one
//! notification per answer, and the payload on a separate data
//! characteristic. Devices from protocol version 3 on take the payload in
//! one bulk write; older ones pull it buffer by buffer.

pub mod profile;

use std::ops::ControlFlow;
use std::thread;

use tracing::{debug, info, instrument, warn};

use crate::ble::{BlePlatform, BlockingBle};
use crate::codec::{ByteCursor, to_hex};
use crate::config::SessionConfig;
use crate::error::{DfuError, Result};
use crate::events::Logger;
use crate::listener::{ProgressReporter, percent_of};
use crate::protocol::*;
use crate::state::{DeviceSession, Flow, Outcome, UpdateMode, UpdateRequest};

pub use profile::FastLink;

const TAG: &str = "GR5xxxFastDfu";
const DOWNLOADING: &str = "Downloading...";

/// Fast protocol engine bound to a connected device.
pub struct FastEngine<'a, P: BlePlatform> {
    link: FastLink<'a, P>,
    config: &'a SessionConfig,
    logger: Logger,
    reporter: &'a ProgressReporter,
}

impl<'a, P: BlePlatform> FastEngine<'a, P> {
    pub fn bind(
        ble: &'a BlockingBle<P>,
        config: &'a SessionConfig,
        logger: Logger,
        reporter: &'a ProgressReporter,
    ) -> Result<Self> {
        Ok(Self {
            link: FastLink::bind(ble)?,
            config,
            logger,
            reporter,
        })
    }

    fn progress(&self, message: &str, percent: u8) {
        self.logger
            .debug(TAG, format!("{} : {}", message, percent));
        let _ = self.reporter.report(message, percent);
    }

    /// Run the whole update for `request`.
    #[instrument(skip_all, fields(mode = %request.mode()))]
    pub fn run(&self, request: &UpdateRequest) -> Result<Outcome> {
        let mut session = DeviceSession::new(Flow::Fast);

        self.progress("Loading device info...", 0);
        session.fast_version = self.get_version()?;
        self.select_flash(request.external_flash())?;

        self.progress("Erasing flash...", 0);
        self.erase(request.write_address(), request.size())?;
        // Buffer size is queried after the erase.
        session.buffer_size = self.get_buffer_size(session.fast_version)?;
        info!(
            version = session.fast_version,
            buffer_size = session.buffer_size,
            "fast DFU negotiated"
        );

        self.progress(DOWNLOADING, 0);
        if let ControlFlow::Break(percent) = self.download(request, &session)? {
            return Ok(Outcome::Cancelled { percent });
        }

        thread::sleep(self.config.delays.fast_checksum());
        self.check_checksum(request.checksum())?;
        self.finalize(request)?;

        self.progress("DFU Completed", 100);
        Ok(Outcome::Completed)
    }

    fn transact(&self, opcode: u8, args: &[u8]) -> Result<Vec<u8>> {
        self.link.send_cmd(opcode, args)?;
        self.link.recv()
    }

    #[instrument(skip(self))]
    pub fn get_version(&self) -> Result<u8> {
        self.logger.debug(TAG, "getFastDfuVersion: start");
        match self.transact(FAST_GET_VERSION, &[])?.as_slice() {
            [FAST_GET_VERSION, version, ..] => Ok(*version),
            _ => Err(DfuError::protocol("getFastDfuVersion error")),
        }
    }

    #[instrument(skip(self))]
    pub fn select_flash(&self, external: bool) -> Result<()> {
        self.logger.debug(TAG, "selectAimFlash: start");
        match self.transact(FAST_SELECT_FLASH, &[u8::from(external)])?.first() {
            Some(&FAST_SELECT_FLASH) => Ok(()),
            _ => Err(DfuError::protocol("selectAimFlash error")),
        }
    }

    /// Erase `[start, start + size)` and follow the device's progress.
    #[instrument(skip(self))]
    pub fn erase(&self, start: u32, size: u32) -> Result<()> {
        let sectors = size.div_ceil(ERASE_SECTOR_SIZE);
        self.logger.debug(
            TAG,
            format!("eraseFlash: 0x{:08X} + {} ({} sectors)", start, size, sectors),
        );
        let mut args = ByteCursor::new(8);
        args.put(4, start.into()).put(4, size.into());
        self.link.send_cmd(FAST_ERASE, args.as_slice())?;

        loop {
            let resp = self.link.recv()?;
            if resp.len() < 2 || resp[0] != FAST_ERASE {
                return Err(DfuError::protocol("eraseFlash error."));
            }
            let mut cur = ByteCursor::from_bytes(resp.as_slice());
            cur.set_pos(2);
            match EraseState::read(resp[1], &mut cur) {
                EraseState::Started => debug!("erase started"),
                EraseState::Progress(done) => {
                    debug!(done, total = sectors, "erase progress")
                }
                EraseState::Done => {
                    self.logger.debug(TAG, "eraseFlash: erased.");
                    return Ok(());
                }
                failed => return Err(DfuError::protocol(erase_failure(failed))),
            }
        }
    }

    /// Device buffer size; fixed for bulk-capable devices.
    #[instrument(skip(self))]
    pub fn get_buffer_size(&self, version: u8) -> Result<u32> {
        if version >= FAST_BULK_MIN_VERSION {
            return Ok(FAST_DEFAULT_BUFFER_SIZE);
        }
        self.logger.debug(TAG, "getBufferSize: start");
        let resp = self.transact(FAST_GET_BUFFER_SIZE, &[])?;
        if resp.len() < 5 || resp[0] != FAST_GET_BUFFER_SIZE {
            return Err(DfuError::protocol("getBufferSize error"));
        }
        let mut cur = ByteCursor::from_bytes(resp);
        cur.set_pos(1);
        match cur.get_u32() {
            0 => Err(DfuError::protocol("getBufferSize: device reported 0")),
            size => Ok(size),
        }
    }

    /// Send the payload. Returns `Break(percent)` when cancelled.
    #[instrument(skip_all, fields(size = request.size(), version = session.fast_version))]
    pub fn download(
        &self,
        request: &UpdateRequest,
        session: &DeviceSession,
    ) -> Result<ControlFlow<u8>> {
        let data = request.data();
        if session.fast_version >= FAST_BULK_MIN_VERSION {
            let mut progress = self.reporter.throttled(DOWNLOADING);
            let written = self.link.send_data(data, Some(&mut progress))?;
            if written < data.len() {
                return Ok(ControlFlow::Break(percent_of(written, data.len())));
            }
            return match self.transact(FAST_FLUSH, &[])?.first() {
                Some(&FAST_FLUSH) => Ok(ControlFlow::Continue(())),
                _ => Err(DfuError::protocol("downloadData error")),
            };
        }

        // The device asks for each buffer and acknowledges the last one with
        // a flush answer.
        self.link.send_cmd(FAST_FLUSH, &[])?;
        let buffer_size = session.buffer_size as usize;
        let mut written = 0usize;
        loop {
            let resp = self.link.recv()?;
            match resp.first() {
                Some(&FAST_FLUSH) => return Ok(ControlFlow::Continue(())),
                Some(&FAST_FLOW_CTRL_PAUSE) => {
                    return Err(DfuError::protocol("FlowCtrl = true, buffer overflowed."));
                }
                Some(&FAST_FLOW_CTRL_RESUME) => {
                    return Err(DfuError::protocol("FlowCtrl = false, not allowed."));
                }
                Some(&FAST_NEXT_BUFFER) => {
                    if written >= data.len() {
                        debug!("device asked for more data than the payload holds");
                        continue;
                    }
                    let end = (written + buffer_size).min(data.len());
                    self.link.send_data(&data[written..end], None)?;
                    written = end;
                    let percent = percent_of(written, data.len());
                    if self.reporter.report(DOWNLOADING, percent).is_break() {
                        warn!(written, percent, "cancelled between buffers");
                        return Ok(ControlFlow::Break(percent));
                    }
                }
                _ => {
                    return Err(DfuError::protocol(format!(
                        "downloadData: receive unknown code. ({})",
                        to_hex(&resp)
                    )));
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub fn check_checksum(&self, checksum: u32) -> Result<()> {
        self.logger.debug(TAG, "checkChecksum: start");
        let resp = self.transact(FAST_CHECK_CHECKSUM, &checksum.to_le_bytes())?;
        if resp.len() < 5 || resp[0] != FAST_CHECK_CHECKSUM {
            return Err(DfuError::protocol("checkChecksum: error"));
        }
        let mut cur = ByteCursor::from_bytes(resp);
        cur.set_pos(1);
        let echoed = cur.get_u32();
        if echoed != checksum {
            return Err(DfuError::protocol(format!(
                "checkChecksum: sendChecksum != recvChecksum (0x{:08X} != 0x{:08X})",
                checksum, echoed
            )));
        }
        Ok(())
    }

    /// Tell the device what to do with the new image, then let it settle.
    #[instrument(skip_all)]
    pub fn finalize(&self, request: &UpdateRequest) -> Result<()> {
        match request.mode() {
            UpdateMode::Firmware => {
                self.logger.debug(TAG, "writeBoot: start");
                self.link
                    .send_cmd(FAST_WRITE_BOOT, &request.image()?.serialize())?;
            }
            UpdateMode::CopyFirmware { copy_address } => {
                self.logger.debug(TAG, "startCopy: start");
                let mut args = ByteCursor::new(48);
                args.put_bytes(40, &request.image()?.serialize(), 0)
                    .put(4, copy_address.into())
                    .put(4, request.size().into());
                self.link.send_cmd(FAST_START_COPY, args.as_slice())?;
            }
            UpdateMode::Resource { .. } => {}
        }
        thread::sleep(self.config.delays.fast_finalize());
        Ok(())
    }
}

fn erase_failure(state: EraseState) -> String {
    let reason = match state {
        EraseState::NotAligned => "address is not 4K aligned.",
        EraseState::OverlapsRunning => "Overlap running firmware.",
        EraseState::Failed => "Failed to erase.",
        EraseState::MissingArea => "No ext flash.",
        _ => "unknown code.",
    };
    format!("eraseFlash: {}", reason)
}
