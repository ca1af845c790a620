//! Standard DFU engine.
//!
//! Two flows share one command set:
//!
//! - **extended**: the control point indicates. The host sends the enter
//!   signal, reads chip/boot/extra info, may switch the device into its
//!   bootloader, then programs the flash (optionally in fast mode).
//! - **legacy**: no indications. The host reads the resident image table
//!   instead of the extra info and keeps that table consistent with the new
//!   image before programming.

pub mod checks;
pub mod profile;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, instrument, warn};

use crate::ble::{BlePlatform, BlockingBle, ScanFilter};
use crate::codec::ByteCursor;
use crate::config::SessionConfig;
use crate::error::{DfuError, Result};
use crate::events::Logger;
use crate::image::{IMAGE_INFO_SIZE, IMAGE_TABLE_ENTRIES, ImageInfo};
use crate::listener::{ProgressReporter, percent_of};
use crate::protocol::*;
use crate::state::{DeviceSession, Flow, Outcome, UpdateMode, UpdateRequest};

pub use checks::{
    TableUpdate, check_encryption, extended_overlap, legacy_overlap, reconcile_image_table,
};
pub use profile::{StandardLink, expect_success};

const TAG: &str = "GR5xxxDFU2";
const DOWNLOADING: &str = "Downloading...";

/// Answer to GET_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub svn: u32,
    pub dfu_version: u8,
}

/// Boot image record read from the configuration area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    pub info: ImageInfo,
    pub peer_encrypted: bool,
}

/// Answer to GET_FW_INFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraInfo {
    pub save_address: u32,
    pub position: u8,
    pub app_info: Option<ImageInfo>,
}

/// Resident image table read from the configuration area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageList {
    pub entries: Vec<ImageInfo>,
    pub peer_encrypted: bool,
}

/// Standard protocol engine bound to a connected device.
pub struct StandardEngine<'a, P: BlePlatform> {
    ble: &'a BlockingBle<P>,
    link: StandardLink<'a, P>,
    config: &'a SessionConfig,
    logger: Logger,
    reporter: &'a ProgressReporter,
    reconnect: Option<Arc<ScanFilter>>,
}

impl<'a, P: BlePlatform> StandardEngine<'a, P> {
    /// Bind the standard characteristics of the connected device.
    pub fn bind(
        ble: &'a BlockingBle<P>,
        config: &'a SessionConfig,
        logger: Logger,
        reporter: &'a ProgressReporter,
    ) -> Result<Self> {
        let link = StandardLink::bind(ble)?;
        Ok(Self {
            ble,
            link,
            config,
            logger,
            reporter,
            reconnect: None,
        })
    }

    /// Filter used to find the device again after a mode switch.
    pub fn with_reconnect_filter(mut self, filter: Option<Arc<ScanFilter>>) -> Self {
        self.reconnect = filter;
        self
    }

    /// Flow selected by the bound control point.
    pub fn flow(&self) -> Flow {
        if self.link.is_extended() {
            Flow::Extended
        } else {
            Flow::Legacy
        }
    }

    fn progress(&self, message: &str, percent: u8) {
        self.logger
            .debug(TAG, format!("{} : {}", message, percent));
        // Cancellation is only honored between chunks.
        let _ = self.reporter.report(message, percent);
    }

    /// Run the whole update for `request`.
    #[instrument(skip_all, fields(mode = %request.mode()))]
    pub fn run(&mut self, request: &UpdateRequest) -> Result<Outcome> {
        let flow = self.flow();
        info!(%flow, size = request.size(), "starting standard DFU");
        match flow {
            Flow::Extended => self.run_extended(request),
            Flow::Legacy => self.run_legacy(request),
            Flow::Fast => Err(DfuError::Config(format!(
                "{} flow is not handled by the standard engine",
                flow
            ))),
        }
    }

    fn run_extended(&mut self, request: &UpdateRequest) -> Result<Outcome> {
        // Wakes the firmware-side DFU task if it is not running yet.
        self.set_dfu_enter()?;

        self.progress("Loading device info...", 0);
        let mut session = DeviceSession::new(Flow::Extended);
        let chip = self.get_chip_info()?;
        session.set_chip(chip.svn, chip.dfu_version);
        let boot = self.get_boot_info(session.sca)?;
        session.boot_info = Some(boot.info);
        session.peer_encrypted = boot.peer_encrypted;
        let extra = self.get_extra_info()?;
        session.position = extra.position;
        session.save_address = extra.save_address;
        session.app_info = extra.app_info;

        self.progress("Checking memory coverage...", 0);
        extended_overlap(request, &session)?;
        check_encryption(request, &session)?;

        match request.mode() {
            UpdateMode::Firmware if session.position == POSITION_RUNNING_SLOT => {
                self.set_dfu_mode(DFU_MODE_RUNNING_SLOT)?;
                self.progress("Jumping to boot mode...", 5);
                reconnect(
                    self.ble,
                    self.config,
                    self.reconnect.as_ref(),
                    BOOTLOADER_NAME,
                )?;
                self.link = StandardLink::bind(self.ble)?;
            }
            UpdateMode::CopyFirmware { .. } => {
                self.set_dfu_mode(DFU_MODE_COPY)?;
                thread::sleep(self.config.delays.copy_mode());
            }
            _ => {}
        }

        self.progress(DOWNLOADING, 0);
        let fast = self.config.fast_mode;
        let flow = if fast {
            self.program_start_fast(request, session.dfu_version)?;
            self.program_flash_fast(request)?
        } else {
            self.program_start(request, session.dfu_version)?;
            self.program_flash(request)?
        };
        if let ControlFlow::Break(percent) = flow {
            return Ok(Outcome::Cancelled { percent });
        }
        self.program_end(request, session.dfu_version, fast)?;
        self.progress("DFU Completed", 100);
        Ok(Outcome::Completed)
    }

    fn run_legacy(&mut self, request: &UpdateRequest) -> Result<Outcome> {
        if self.config.fast_mode {
            debug!("fast mode is not available in the legacy flow");
        }
        self.write_control_point(self.config.control_command.as_deref())?;

        self.progress("Loading device info...", 0);
        let mut session = DeviceSession::new(Flow::Legacy);
        let chip = self.get_chip_info()?;
        session.set_chip(chip.svn, chip.dfu_version);
        let boot = self.get_boot_info(session.sca)?;
        session.boot_info = Some(boot.info);
        let list = self.get_image_list(session.sca)?;
        session.peer_encrypted = list.peer_encrypted;
        session.image_table = list.entries;

        self.progress("Checking memory coverage...", 0);
        legacy_overlap(request, &session)?;
        check_encryption(request, &session)?;

        if request.mode().is_firmware() {
            self.progress("Arranging image list...", 5);
            let update =
                reconcile_image_table(request.image()?, session.boot_info()?, &session.image_table)?;
            for dropped in &update.dropped {
                self.logger.warning(
                    TAG,
                    format!(
                        "image table entry {:?} at 0x{:08X} overlaps the new image and is removed",
                        dropped.comment_str(),
                        dropped.load_addr
                    ),
                );
            }
            if update.changed {
                self.write_image_table(session.sca, &update.entries)?;
            }
        }

        self.progress(DOWNLOADING, 0);
        self.program_start(request, session.dfu_version)?;
        if let ControlFlow::Break(percent) = self.program_flash(request)? {
            return Ok(Outcome::Cancelled { percent });
        }
        self.program_end(request, session.dfu_version, false)?;
        self.progress("DFU Completed", 100);
        Ok(Outcome::Completed)
    }

    /// Write the enter signal to the control point.
    pub fn set_dfu_enter(&self) -> Result<()> {
        self.logger.debug(TAG, "setDfuEnter: start");
        self.link.send_ctrl(&DFU_ENTER_SIGNAL.to_le_bytes())
    }

    /// Write a caller-defined command to the control point, if any.
    pub fn write_control_point(&self, command: Option<&[u8]>) -> Result<()> {
        self.logger.debug(TAG, "writeCtrPoint: start");
        match command {
            Some(data) => self.link.send_ctrl(data),
            None => Ok(()),
        }
    }

    #[instrument(skip(self))]
    pub fn get_chip_info(&self) -> Result<ChipInfo> {
        self.logger.debug(TAG, "getChipInfo: start");
        let resp = self.link.transact(CMD_GET_INFO, &[])?;
        expect_success("getChipInfo", &resp)?;
        let svn = resp.reader(5).get_u32();
        let dfu_version = resp.data.get(17).copied().unwrap_or(0);
        debug!(
            svn = format_args!("0x{:08X}", svn),
            dfu_version, "chip info"
        );
        Ok(ChipInfo { svn, dfu_version })
    }

    #[instrument(skip(self))]
    pub fn get_boot_info(&self, sca: u32) -> Result<BootInfo> {
        self.logger.debug(TAG, "getBootInfo: start");
        let resp = self.link.transact(
            CMD_SYSTEM_CONFIG,
            &system_config_read(sca, crate::image::BOOT_INFO_SIZE as u16),
        )?;
        expect_success("getBootInfo", &resp)?;
        let mut cur = resp.reader(1);
        let op = cur.get_u8();
        if cur.get_u32() != sca {
            return Err(DfuError::protocol("getBootInfo: unexpected address"));
        }
        if usize::from(cur.get_u16()) != crate::image::BOOT_INFO_SIZE {
            return Err(DfuError::protocol("getBootInfo: unexpected data length"));
        }
        let info = ImageInfo::from_boot_info(resp.data.get(8..).unwrap_or_default())?;
        Ok(BootInfo {
            info,
            peer_encrypted: op & 0xF0 != 0,
        })
    }

    #[instrument(skip(self))]
    pub fn get_extra_info(&self) -> Result<ExtraInfo> {
        self.logger.debug(TAG, "getExtraInfo: start");
        let resp = self.link.transact(CMD_GET_FW_INFO, &[])?;
        expect_success("getExtraInfo", &resp)?;
        let mut cur = resp.reader(1);
        let save_address = cur.get_u32();
        let position = cur.get_u8();
        let app_info = resp
            .data
            .get(6..)
            .and_then(|data| ImageInfo::from_bytes(data).ok());
        debug!(position, save_address = format_args!("0x{:08X}", save_address), "extra info");
        Ok(ExtraInfo {
            save_address,
            position,
            app_info,
        })
    }

    #[instrument(skip(self))]
    pub fn get_image_list(&self, sca: u32) -> Result<ImageList> {
        self.logger.debug(TAG, "getImgList: start");
        let table_addr = sca + IMAGE_TABLE_OFFSET;
        let resp = self
            .link
            .transact(CMD_SYSTEM_CONFIG, &system_config_read(table_addr, IMAGE_TABLE_SIZE))?;
        expect_success("getImgList", &resp)?;
        let mut cur = resp.reader(1);
        let op = cur.get_u8();
        if cur.get_u32() != table_addr {
            return Err(DfuError::protocol("getImgList: unexpected address"));
        }
        if cur.get_u16() != IMAGE_TABLE_SIZE {
            return Err(DfuError::protocol("getImgList: Command response error."));
        }
        let table = resp
            .data
            .get(8..8 + usize::from(IMAGE_TABLE_SIZE))
            .ok_or_else(|| DfuError::protocol("getImgList: Command response error."))?;
        let entries = ImageInfo::parse_table(table)?;
        debug!(entries = entries.len(), "image table");
        Ok(ImageList {
            entries,
            peer_encrypted: op & 0xF0 != 0,
        })
    }

    /// Replace the resident image table; unused slots are erased to 0xFF.
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub fn write_image_table(&self, sca: u32, entries: &[ImageInfo]) -> Result<()> {
        self.logger.debug(TAG, "tidyImgList: start");
        if entries.len() > IMAGE_TABLE_ENTRIES {
            return Err(DfuError::protocol(format!(
                "image table holds at most {} entries",
                IMAGE_TABLE_ENTRIES
            )));
        }
        let table_size = usize::from(IMAGE_TABLE_SIZE);
        let mut cur = ByteCursor::new(7 + table_size);
        cur.put_byte(SYSTEM_CONFIG_WRITE)
            .put(4, (sca + IMAGE_TABLE_OFFSET).into())
            .put(2, IMAGE_TABLE_SIZE.into());
        for entry in entries {
            cur.put_bytes(IMAGE_INFO_SIZE, &entry.serialize(), 0);
        }
        let erased = [0xFFu8; IMAGE_INFO_SIZE];
        for _ in entries.len()..IMAGE_TABLE_ENTRIES {
            cur.put_bytes(IMAGE_INFO_SIZE, &erased, 0);
        }
        let resp = self.link.transact(CMD_SYSTEM_CONFIG, cur.as_slice())?;
        expect_success("tidyImgList", &resp)
    }

    /// Ask the device to switch mode. The device does not answer.
    pub fn set_dfu_mode(&self, mode: u8) -> Result<()> {
        self.logger.debug(TAG, "setDfuMode: start");
        self.link.send_cmd(CMD_SET_DFU_MODE, &[mode])
    }

    #[instrument(skip_all)]
    pub fn program_start(&self, request: &UpdateRequest, dfu_version: u8) -> Result<()> {
        self.logger.debug(TAG, "programStart: start");
        let payload = program_start_payload(request, dfu_version, false)?;
        let resp = self.link.transact(CMD_PROGRAM_START, &payload)?;
        expect_success("programStart", &resp)
    }

    /// Program-start in fast mode: the device erases first and streams its
    /// progress until it reports completion.
    #[instrument(skip_all)]
    pub fn program_start_fast(&self, request: &UpdateRequest, dfu_version: u8) -> Result<()> {
        self.logger.debug(TAG, "programStartFast: start");
        let payload = program_start_payload(request, dfu_version, true)?;
        self.link.send_cmd(CMD_PROGRAM_START, &payload)?;
        loop {
            let resp = self.link.recv(CMD_PROGRAM_START)?;
            expect_success("programStartFast", &resp)?;
            let code = resp
                .data
                .get(1)
                .copied()
                .ok_or_else(|| DfuError::protocol("programStartFast: missing erase state"))?;
            let state = EraseState::read(code, &mut resp.reader(2));
            match state {
                EraseState::Started => self.logger.debug(TAG, "programStartFast: Start Erasing."),
                EraseState::Progress(sectors) => {
                    self.logger
                        .debug(TAG, format!("programStartFast: Erasing:{}", sectors))
                }
                EraseState::Done => {
                    self.logger.debug(TAG, "programStartFast: Complete Erase.");
                    return Ok(());
                }
                other => {
                    let message = other
                        .failure()
                        .unwrap_or_else(|| format!("error code: {}", other.code()));
                    return Err(DfuError::protocol(format!("programStartFast: {}", message)));
                }
            }
        }
    }

    /// Send the payload in framed chunks, one response per chunk.
    ///
    /// Returns `Break(percent)` when cancelled between chunks.
    #[instrument(skip_all, fields(size = request.size()))]
    pub fn program_flash(&self, request: &UpdateRequest) -> Result<ControlFlow<u8>> {
        self.logger.debug(TAG, "programFlash: start");
        let data = request.data();
        let base = request.write_address();
        let flag = if request.external_flash() {
            FLASH_WRITE_EXTERNAL
        } else {
            FLASH_WRITE_INTERNAL
        };

        let mut written = 0usize;
        for chunk in data.chunks(FLASH_CHUNK_SIZE) {
            let mut cur = ByteCursor::new(7 + chunk.len());
            cur.put_byte(flag)
                .put(4, base.wrapping_add(written as u32).into())
                .put(2, chunk.len() as u64)
                .put_bytes(chunk.len(), chunk, 0);
            let resp = self.link.transact(CMD_PROGRAM_FLASH, cur.as_slice())?;
            expect_success("programFlash", &resp)?;

            written += chunk.len();
            let percent = percent_of(written, data.len());
            if self.reporter.report(DOWNLOADING, percent).is_break() {
                warn!(written, percent, "cancelled between chunks");
                return Ok(ControlFlow::Break(percent));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Stream the raw payload in one bulk write and wait for the flush ack.
    #[instrument(skip_all, fields(size = request.size()))]
    pub fn program_flash_fast(&self, request: &UpdateRequest) -> Result<ControlFlow<u8>> {
        self.logger.debug(TAG, "programFlashFast: start");
        let data = request.data();
        let mut progress = self.reporter.throttled(DOWNLOADING);
        let written = self.link.send_raw(data, Some(&mut progress))?;
        if written < data.len() {
            let percent = percent_of(written, data.len());
            warn!(written, percent, "cancelled during bulk write");
            return Ok(ControlFlow::Break(percent));
        }
        let resp = self.link.recv(CMD_PROGRAM_FLASH_FAST)?;
        expect_success("programFlashFast", &resp)?;
        Ok(ControlFlow::Continue(()))
    }

    /// Close the transfer with the payload checksum.
    ///
    /// The frame itself must be delivered. After that, no answer at all
    /// counts as success: the device may already be rebooting into the new
    /// image.
    #[instrument(skip_all)]
    pub fn program_end(&self, request: &UpdateRequest, dfu_version: u8, fast: bool) -> Result<()> {
        self.logger.debug(TAG, "programEnd: start");
        let kind = match request.mode() {
            UpdateMode::Resource {
                external_flash: true,
                ..
            } => END_RESOURCE_EXTERNAL,
            UpdateMode::Resource { .. } => END_RESOURCE_INTERNAL,
            _ => END_FIRMWARE,
        };
        let checksum = request.checksum();
        let mut cur = ByteCursor::new(5);
        cur.put_byte(kind).put(4, checksum.into());
        self.link.send_cmd(CMD_PROGRAM_END, cur.as_slice())?;
        let resp = match self.link.recv(CMD_PROGRAM_END) {
            Ok(resp) => resp,
            Err(err) if err.is_link_failure() => {
                info!(error = %err, "no program-end answer, device is restarting");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        expect_success("programEnd", &resp)?;

        if fast && dfu_version >= DFU_VERSION_ENCRYPTION_FLAGS {
            if resp.data.len() < 5 {
                return Err(DfuError::protocol("programEnd: Command response error."));
            }
            let echoed = resp.reader(1).get_u32();
            if echoed != checksum {
                return Err(DfuError::protocol(format!(
                    "programEnd: Checksum verification error: {} != {}",
                    echoed, checksum
                )));
            }
        }
        Ok(())
    }
}

fn system_config_read(address: u32, length: u16) -> Vec<u8> {
    let mut cur = ByteCursor::new(7);
    cur.put_byte(SYSTEM_CONFIG_READ)
        .put(4, address.into())
        .put(2, length.into());
    cur.into_inner()
}

/// PROGRAM_START payload.
///
/// Resources: `[type][address:4][size:4]`. Firmware: `[type][image info:40]`,
/// with the encryption state in the high nibble of `type` from protocol
/// version 2 on. Fast mode sets bit 1 of `type`.
pub fn program_start_payload(
    request: &UpdateRequest,
    dfu_version: u8,
    fast: bool,
) -> Result<Vec<u8>> {
    let fast_bit = if fast { 0x02 } else { 0x00 };
    match request.mode() {
        UpdateMode::Resource {
            address,
            external_flash,
        } => {
            let mut cur = ByteCursor::new(9);
            cur.put_byte(fast_bit | u8::from(external_flash))
                .put(4, address.into())
                .put(4, request.size().into());
            Ok(cur.into_inner())
        }
        UpdateMode::Firmware | UpdateMode::CopyFirmware { .. } => {
            let mut kind = fast_bit;
            if dfu_version >= DFU_VERSION_ENCRYPTION_FLAGS {
                kind |= request.blob().encryption().as_u8() << 4;
            }
            let info = request.announced_image()?.serialize();
            let mut cur = ByteCursor::new(1 + IMAGE_INFO_SIZE);
            cur.put_byte(kind).put_bytes(IMAGE_INFO_SIZE, &info, 0);
            Ok(cur.into_inner())
        }
    }
}

/// Drop the link and find the device again once it has switched mode.
///
/// `filter` wins over the configured reconnect name, which wins over
/// `default_name`.
pub fn reconnect<P: BlePlatform>(
    ble: &BlockingBle<P>,
    config: &SessionConfig,
    filter: Option<&Arc<ScanFilter>>,
    default_name: &str,
) -> Result<()> {
    thread::sleep(config.delays.mode_switch());
    ble.disconnect()?;
    thread::sleep(config.delays.mode_switch());

    let timeout = ble.timeouts().scan();
    let peripheral = match filter {
        Some(filter) => ble.connect_by_filter(filter.clone(), timeout)?,
        None => {
            let name = config.reconnect_name.as_deref().unwrap_or(default_name);
            ble.connect_by_name(name, timeout)?
        }
    };
    info!(peripheral = %peripheral, "reconnected");
    ble.discover_services()?;
    Ok(())
}

/// Send the enter signal on the control point and reconnect to the DFU boot.
#[instrument(skip_all)]
pub fn enter_dfu_boot<P: BlePlatform>(
    ble: &BlockingBle<P>,
    config: &SessionConfig,
    filter: Option<&Arc<ScanFilter>>,
) -> Result<()> {
    let ctrl = ble
        .find_characteristic(DFU_SERVICE_UUID, DFU_CONTROL_POINT_UUID)?
        .ok_or_else(|| {
            DfuError::protocol(format!(
                "DFU characteristic not found. Please check UUID: {}",
                DFU_CONTROL_POINT_UUID
            ))
        })?;
    ble.write_without_response(&ctrl, &DFU_ENTER_SIGNAL.to_le_bytes(), None)?;
    reconnect(ble, config, filter, DFU_BOOT_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::{sample_info, unsigned_firmware};

    #[test]
    fn test_program_start_payload_resource() {
        let req = UpdateRequest::new(
            UpdateMode::Resource {
                address: 0x0120_0000,
                external_flash: true,
            },
            vec![0u8; 300],
        )
        .unwrap();
        let payload = program_start_payload(&req, 2, false).unwrap();
        assert_eq!(payload, vec![0x01, 0x00, 0x00, 0x20, 0x01, 0x2C, 0x01, 0x00, 0x00]);
        let payload = program_start_payload(&req, 2, true).unwrap();
        assert_eq!(payload[0], 0x03);
    }

    #[test]
    fn test_program_start_payload_firmware() {
        let info = sample_info(0x0104_0000, 4048);
        let data = unsigned_firmware(4096, &info);

        let req = UpdateRequest::new(UpdateMode::Firmware, data.clone()).unwrap();
        let payload = program_start_payload(&req, 1, false).unwrap();
        assert_eq!(payload.len(), 41);
        assert_eq!(payload[0], 0x00);
        assert_eq!(&payload[1..], &info.serialize()[..]);
        assert_eq!(program_start_payload(&req, 2, true).unwrap()[0], 0x02);

        let req = UpdateRequest::new(
            UpdateMode::CopyFirmware {
                copy_address: 0x0108_0000,
            },
            data,
        )
        .unwrap();
        let payload = program_start_payload(&req, 2, false).unwrap();
        let announced = ImageInfo::from_bytes(&payload[1..]).unwrap();
        assert_eq!(announced.load_addr, 0x0108_0000);
        assert_eq!(announced.app_size, 4048);
    }

    #[test]
    fn test_system_config_read_layout() {
        assert_eq!(
            system_config_read(0x0100_0040, 400),
            vec![0x00, 0x40, 0x00, 0x00, 0x01, 0x90, 0x01]
        );
    }
}
