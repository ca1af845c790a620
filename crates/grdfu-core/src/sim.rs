//! Simulated GR5xxx peripherals for the mock BLE platform.
//!
//! [`StandardDevice`] speaks the framed standard protocol with either an
//! extended or a legacy control point; [`FastDevice`] speaks the fast
//! protocol. Both record what the host did in a [`Journal`] that stays
//! readable after the device has been handed to the platform.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::{CharProperties, Characteristic, MockDevice, MockReaction, Service};
use crate::codec::{ByteCursor, byte_sum};
use crate::config::PACKET_MAX_SIZE;
use crate::image::{
    IMAGE_FOOTER_SIZE, IMAGE_INFO_SIZE, IMAGE_TABLE_ENTRIES, ImageInfo, SIGNATURE_BLOCK_SIZE,
};
use crate::protocol::*;

/// Stack SVN reported by the simulated chip (configuration area at 0x0100_0000).
pub const SIM_SVN: u32 = 0x1EA8;
pub const SIM_DEVICE_NAME: &str = "GR5xxx_SIM";
pub const SIM_BOOT_ADDR: u32 = 0x0100_4000;
pub const SIM_BOOT_SIZE: u32 = 0x1_0000;
/// Where demo firmware is linked.
pub const SIM_APP_ADDR: u32 = 0x0104_0000;
/// A copy destination clear of everything above.
pub const SIM_COPY_ADDR: u32 = 0x0108_0000;
pub const SIM_SAVE_ADDR: u32 = 0x0108_0000;

/// What the host did to a simulated device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    /// Opcodes in arrival order (fast opcodes widened).
    pub commands: Vec<u16>,
    pub control_writes: Vec<Vec<u8>>,
    pub mode_switches: Vec<u8>,
    /// `(address, length)` of every PROGRAM_FLASH chunk.
    pub flash_writes: Vec<(u32, usize)>,
    /// Payload bytes received, framed or raw.
    pub payload: Vec<u8>,
    pub program_start: Option<Vec<u8>>,
    /// `(type, checksum)` carried by PROGRAM_END.
    pub program_end: Option<(u8, u32)>,
    pub table_writes: Vec<Vec<ImageInfo>>,
    pub erase: Option<(u32, u32)>,
    pub external_flash: Option<bool>,
    pub buffer_requests: usize,
    pub boot_written: Option<ImageInfo>,
    /// `(info, copy address, length)` carried by START_COPY.
    pub copy_started: Option<(ImageInfo, u32, u32)>,
}

/// Shared handle on a device's journal.
#[derive(Debug, Clone, Default)]
pub struct JournalHandle(Arc<Mutex<Journal>>);

impl JournalHandle {
    fn lock(&self) -> MutexGuard<'_, Journal> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Journal {
        self.lock().clone()
    }
}

/// Unsigned firmware of `len` bytes linked at `load_addr`.
pub fn demo_firmware(load_addr: u32, len: usize) -> Vec<u8> {
    let len = len.max(IMAGE_FOOTER_SIZE + 1);
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
    let code_len = len - IMAGE_FOOTER_SIZE;
    let info = ImageInfo::new(
        load_addr,
        code_len as u32,
        byte_sum(&data[..code_len]),
        "sim",
    );
    data[code_len..code_len + IMAGE_INFO_SIZE].copy_from_slice(&info.serialize());
    data[code_len + IMAGE_INFO_SIZE..].fill(0);
    data
}

fn characteristic(service: Uuid, uuid: Uuid, properties: CharProperties) -> Characteristic {
    Characteristic {
        service,
        uuid,
        properties,
    }
}

fn writable() -> CharProperties {
    CharProperties {
        write: true,
        write_without_response: true,
        ..Default::default()
    }
}

/// A standard response frame, split the way the link would carry it.
fn frame_reply(opcode: u16, data: Vec<u8>) -> Vec<MockReaction> {
    let frame = Response { opcode, data }.encode();
    frame
        .chunks(PACKET_MAX_SIZE)
        .map(|chunk| MockReaction::Notify {
            characteristic: DFU_TX_UUID,
            value: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndBehavior {
    Answer,
    WrongChecksum,
    Reboot,
    DropDuringWrite,
}

/// Peripheral speaking the standard protocol.
pub struct StandardDevice {
    name: String,
    extended: bool,
    dfu_version: u8,
    boot: ImageInfo,
    encrypted: bool,
    position: u8,
    app: Option<ImageInfo>,
    image_table: Vec<ImageInfo>,
    needs_boot_entry: bool,
    end_behavior: EndBehavior,
    fast_erase_failure: Option<u8>,
    rx: Vec<u8>,
    raw_remaining: usize,
    journal: JournalHandle,
}

impl StandardDevice {
    fn new(extended: bool) -> Self {
        Self {
            name: SIM_DEVICE_NAME.to_string(),
            extended,
            dfu_version: 2,
            boot: ImageInfo::new(SIM_BOOT_ADDR, SIM_BOOT_SIZE, 0x00B0_07B0, "boot"),
            encrypted: false,
            position: 0,
            app: None,
            image_table: Vec::new(),
            needs_boot_entry: false,
            end_behavior: EndBehavior::Answer,
            fast_erase_failure: None,
            rx: Vec::new(),
            raw_remaining: 0,
            journal: JournalHandle::default(),
        }
    }

    /// Control point with indications: the extended flow.
    pub fn extended() -> Self {
        Self::new(true)
    }

    pub fn legacy() -> Self {
        Self::new(false)
    }

    pub fn with_dfu_version(mut self, version: u8) -> Self {
        self.dfu_version = version;
        self
    }

    /// Report `app` as the running image, from slot `position`.
    pub fn with_running_app(mut self, app: ImageInfo, position: u8) -> Self {
        self.app = Some(app);
        self.position = position;
        self
    }

    pub fn with_image_table(mut self, entries: Vec<ImageInfo>) -> Self {
        self.image_table = entries;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Start in the application; the enter signal reboots into the DFU boot.
    pub fn in_application(mut self) -> Self {
        self.needs_boot_entry = true;
        self
    }

    /// Take PROGRAM_END, then reboot without answering.
    pub fn resetting_on_end(mut self) -> Self {
        self.end_behavior = EndBehavior::Reboot;
        self
    }

    /// Lose the link while PROGRAM_END is still being written.
    pub fn dropping_program_end(mut self) -> Self {
        self.end_behavior = EndBehavior::DropDuringWrite;
        self
    }

    /// Echo a checksum that differs from the received bytes.
    pub fn wrong_end_checksum(mut self) -> Self {
        self.end_behavior = EndBehavior::WrongChecksum;
        self
    }

    /// Report erase state `state` right after a fast program-start begins.
    pub fn failing_fast_erase(mut self, state: u8) -> Self {
        self.fast_erase_failure = Some(state);
        self
    }

    pub fn journal(&self) -> JournalHandle {
        self.journal.clone()
    }

    fn on_control(&mut self, data: &[u8]) {
        self.journal.lock().control_writes.push(data.to_vec());
        if self.needs_boot_entry && data == &DFU_ENTER_SIGNAL.to_le_bytes()[..] {
            debug!("simulated device rebooting into DFU boot");
            self.needs_boot_entry = false;
            self.name = DFU_BOOT_NAME.to_string();
        }
    }

    fn take_frame(&mut self) -> Option<(u16, Vec<u8>)> {
        let header = match FrameHeader::parse(&self.rx) {
            Ok(header) => header,
            Err(FrameError::ShortHead) => return None,
            Err(e) => {
                debug!(error = %e, "simulated device dropping garbage");
                self.rx.clear();
                return None;
            }
        };
        let total = FRAME_HEAD_SIZE + header.body_len();
        if self.rx.len() < total {
            return None;
        }
        let frame: Vec<u8> = self.rx.drain(..total).collect();
        match Response::decode(header, &frame[FRAME_HEAD_SIZE..], header.opcode) {
            Ok(command) => Some((command.opcode, command.data)),
            Err(e) => {
                debug!(error = %e, "simulated device dropping bad frame");
                None
            }
        }
    }

    fn handle(&mut self, opcode: u16, payload: &[u8]) -> Vec<MockReaction> {
        trace!(opcode = format_args!("0x{:02X}", opcode), len = payload.len(), "sim command");
        self.journal.lock().commands.push(opcode);
        match opcode {
            CMD_GET_INFO => {
                let mut data = vec![0u8; 18];
                data[0] = STATUS_SUCCESS;
                data[5..9].copy_from_slice(&SIM_SVN.to_le_bytes());
                data[17] = self.dfu_version;
                frame_reply(opcode, data)
            }
            CMD_SYSTEM_CONFIG => self.system_config(payload),
            CMD_GET_FW_INFO => {
                let mut cur = ByteCursor::new(6 + IMAGE_INFO_SIZE);
                cur.put_byte(STATUS_SUCCESS)
                    .put(4, SIM_SAVE_ADDR.into())
                    .put_byte(self.position);
                if let Some(app) = &self.app {
                    cur.put_bytes(IMAGE_INFO_SIZE, &app.serialize(), 0);
                }
                frame_reply(opcode, cur.into_inner())
            }
            CMD_SET_DFU_MODE => {
                let mode = payload.first().copied().unwrap_or(0);
                self.journal.lock().mode_switches.push(mode);
                if mode == DFU_MODE_RUNNING_SLOT {
                    self.name = BOOTLOADER_NAME.to_string();
                }
                Vec::new()
            }
            CMD_PROGRAM_START => self.program_start(payload),
            CMD_PROGRAM_FLASH => {
                let mut cur = ByteCursor::from_bytes(payload);
                let _kind = cur.get_u8();
                let address = cur.get_u32();
                let len = usize::from(cur.get_u16());
                let data = cur.get_bytes(len);
                let mut journal = self.journal.lock();
                journal.flash_writes.push((address, len));
                journal.payload.extend_from_slice(&data);
                drop(journal);
                frame_reply(opcode, vec![STATUS_SUCCESS])
            }
            CMD_PROGRAM_END => {
                let mut cur = ByteCursor::from_bytes(payload);
                let kind = cur.get_u8();
                let checksum = cur.get_u32();
                let received = {
                    let mut journal = self.journal.lock();
                    journal.program_end = Some((kind, checksum));
                    byte_sum(&journal.payload)
                };
                let echoed = match self.end_behavior {
                    EndBehavior::Answer => received,
                    EndBehavior::WrongChecksum => received.wrapping_add(1),
                    EndBehavior::Reboot => {
                        debug!("simulated device rebooting after program end");
                        return Vec::new();
                    }
                    EndBehavior::DropDuringWrite => return vec![MockReaction::Disconnect],
                };
                let mut out = ByteCursor::new(5);
                out.put_byte(STATUS_SUCCESS).put(4, echoed.into());
                frame_reply(opcode, out.into_inner())
            }
            _ => frame_reply(opcode, vec![0x00]),
        }
    }

    fn system_config(&mut self, payload: &[u8]) -> Vec<MockReaction> {
        let mut cur = ByteCursor::from_bytes(payload);
        let op = cur.get_u8();
        let address = cur.get_u32();
        let len = cur.get_u16();
        let sca = sca_for_svn(SIM_SVN);
        let table_address = sca + IMAGE_TABLE_OFFSET;

        let body = match op {
            SYSTEM_CONFIG_READ if address == sca => self.boot.serialize_boot_info(),
            SYSTEM_CONFIG_READ if address == table_address => self.table_bytes(),
            SYSTEM_CONFIG_WRITE if address == table_address => {
                match ImageInfo::parse_table(&cur.get_bytes(usize::from(len))) {
                    Ok(entries) => {
                        self.journal.lock().table_writes.push(entries.clone());
                        self.image_table = entries;
                    }
                    Err(_) => return frame_reply(CMD_SYSTEM_CONFIG, vec![0x00]),
                }
                Vec::new()
            }
            _ => return frame_reply(CMD_SYSTEM_CONFIG, vec![0x00]),
        };

        let echoed_op = if self.encrypted { op | 0x10 } else { op };
        let mut out = ByteCursor::new(8 + body.len());
        out.put_byte(STATUS_SUCCESS)
            .put_byte(echoed_op)
            .put(4, address.into())
            .put(2, len.into())
            .put_bytes(body.len(), &body, 0);
        frame_reply(CMD_SYSTEM_CONFIG, out.into_inner())
    }

    fn table_bytes(&self) -> Vec<u8> {
        let mut table = vec![0xFFu8; usize::from(IMAGE_TABLE_SIZE)];
        for (slot, entry) in self
            .image_table
            .iter()
            .take(IMAGE_TABLE_ENTRIES)
            .enumerate()
        {
            let at = slot * IMAGE_INFO_SIZE;
            table[at..at + IMAGE_INFO_SIZE].copy_from_slice(&entry.serialize());
        }
        table
    }

    /// Plain program-start is acknowledged at once. In fast mode the device
    /// erases first, streams its erase states, then takes the raw payload.
    fn program_start(&mut self, payload: &[u8]) -> Vec<MockReaction> {
        self.journal.lock().program_start = Some(payload.to_vec());
        let kind = payload.first().copied().unwrap_or(0);
        if kind & 0x02 == 0 {
            return frame_reply(CMD_PROGRAM_START, vec![STATUS_SUCCESS]);
        }

        let len = if payload.len() == 1 + IMAGE_INFO_SIZE {
            let Ok(info) = ImageInfo::from_bytes(&payload[1..]) else {
                return frame_reply(CMD_PROGRAM_START, vec![0x00]);
            };
            let signature = if kind >> 4 != 0 { SIGNATURE_BLOCK_SIZE } else { 0 };
            info.app_size as usize + IMAGE_FOOTER_SIZE + signature
        } else {
            let mut cur = ByteCursor::from_bytes(payload);
            cur.set_pos(5);
            cur.get_u32() as usize
        };

        let mut out = frame_reply(CMD_PROGRAM_START, vec![STATUS_SUCCESS, 0x01]);
        if let Some(state) = self.fast_erase_failure {
            out.extend(frame_reply(CMD_PROGRAM_START, vec![STATUS_SUCCESS, state]));
            return out;
        }
        let sectors = (len as u32).div_ceil(ERASE_SECTOR_SIZE);
        for done in 1..=sectors {
            let mut data = vec![STATUS_SUCCESS, 0x02];
            data.extend_from_slice(&(done as u16).to_le_bytes());
            out.extend(frame_reply(CMD_PROGRAM_START, data));
        }
        out.extend(frame_reply(CMD_PROGRAM_START, vec![STATUS_SUCCESS, 0x03]));
        self.raw_remaining = len;
        out
    }
}

impl MockDevice for StandardDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn services(&self) -> Vec<Service> {
        let svc = DFU_SERVICE_UUID;
        vec![Service {
            uuid: svc,
            characteristics: vec![
                characteristic(
                    svc,
                    DFU_TX_UUID,
                    CharProperties {
                        notify: true,
                        ..Default::default()
                    },
                ),
                characteristic(svc, DFU_RX_UUID, writable()),
                characteristic(
                    svc,
                    DFU_CONTROL_POINT_UUID,
                    CharProperties {
                        indicate: self.extended,
                        ..writable()
                    },
                ),
            ],
        }]
    }

    fn on_write(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<MockReaction> {
        if characteristic == DFU_CONTROL_POINT_UUID {
            self.on_control(data);
            return Vec::new();
        }
        if characteristic != DFU_RX_UUID {
            return Vec::new();
        }

        if self.raw_remaining > 0 {
            let n = data.len().min(self.raw_remaining);
            self.journal.lock().payload.extend_from_slice(&data[..n]);
            self.raw_remaining -= n;
            if self.raw_remaining == 0 {
                return frame_reply(CMD_PROGRAM_FLASH_FAST, vec![STATUS_SUCCESS]);
            }
            return Vec::new();
        }

        self.rx.extend_from_slice(data);
        let mut reactions = Vec::new();
        while let Some((opcode, payload)) = self.take_frame() {
            reactions.extend(self.handle(opcode, &payload));
        }
        reactions
    }

    fn on_disconnect(&mut self) {
        self.rx.clear();
        self.raw_remaining = 0;
    }
}

/// Peripheral speaking the fast protocol.
pub struct FastDevice {
    name: String,
    version: u8,
    buffer_size: u32,
    erase_failure: Option<u8>,
    pause_flow: bool,
    boot_entry: bool,
    needs_boot_entry: bool,
    expected: usize,
    received: usize,
    buffer_fill: usize,
    streaming: bool,
    journal: JournalHandle,
}

impl FastDevice {
    /// Devices before version 3 pull the payload in 1 KiB buffers.
    pub fn new(version: u8) -> Self {
        let buffer_size = if version >= FAST_BULK_MIN_VERSION {
            FAST_DEFAULT_BUFFER_SIZE
        } else {
            1024
        };
        Self {
            name: SIM_DEVICE_NAME.to_string(),
            version,
            buffer_size,
            erase_failure: None,
            pause_flow: false,
            boot_entry: false,
            needs_boot_entry: false,
            expected: 0,
            received: 0,
            buffer_fill: 0,
            streaming: false,
            journal: JournalHandle::default(),
        }
    }

    pub fn with_buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = size;
        self
    }

    /// Answer ERASE with the given terminal state.
    pub fn failing_erase(mut self, state: u8) -> Self {
        self.erase_failure = Some(state);
        self
    }

    /// Answer the first buffer request with FLOW_CTRL_PAUSE.
    pub fn pausing_flow(mut self) -> Self {
        self.pause_flow = true;
        self
    }

    /// Start in the application behind a standard control point.
    pub fn in_application(mut self) -> Self {
        self.boot_entry = true;
        self.needs_boot_entry = true;
        self
    }

    pub fn journal(&self) -> JournalHandle {
        self.journal.clone()
    }

    fn reply(value: Vec<u8>) -> MockReaction {
        MockReaction::Notify {
            characteristic: FAST_DFU_CMD_UUID,
            value,
        }
    }

    fn request_next(&mut self) -> Vec<MockReaction> {
        if self.received >= self.expected {
            self.streaming = false;
            return vec![Self::reply(vec![FAST_FLUSH])];
        }
        if self.pause_flow {
            return vec![Self::reply(vec![FAST_FLOW_CTRL_PAUSE])];
        }
        self.journal.lock().buffer_requests += 1;
        vec![Self::reply(vec![FAST_NEXT_BUFFER])]
    }

    fn on_command(&mut self, data: &[u8]) -> Vec<MockReaction> {
        let Some((opcode, args)) = parse_fast_command(data) else {
            debug!("simulated fast device ignoring unframed command");
            return Vec::new();
        };
        trace!(opcode, "sim fast command");
        self.journal.lock().commands.push(u16::from(opcode));

        match opcode {
            FAST_GET_VERSION => vec![Self::reply(vec![FAST_GET_VERSION, self.version])],
            FAST_SELECT_FLASH => {
                self.journal.lock().external_flash = Some(args.first() == Some(&1));
                vec![Self::reply(vec![FAST_SELECT_FLASH])]
            }
            FAST_ERASE => {
                let mut cur = ByteCursor::from_bytes(args);
                let start = cur.get_u32();
                let size = cur.get_u32();
                self.journal.lock().erase = Some((start, size));
                self.expected = size as usize;
                self.received = 0;
                if let Some(state) = self.erase_failure {
                    return vec![Self::reply(vec![FAST_ERASE, state])];
                }
                let mut out = vec![Self::reply(vec![FAST_ERASE, 0x01])];
                for done in 1..=size.div_ceil(ERASE_SECTOR_SIZE) {
                    let mut value = vec![FAST_ERASE, 0x02];
                    value.extend_from_slice(&(done as u16).to_le_bytes());
                    out.push(Self::reply(value));
                }
                out.push(Self::reply(vec![FAST_ERASE, 0x03]));
                out
            }
            FAST_GET_BUFFER_SIZE => {
                let mut value = vec![FAST_GET_BUFFER_SIZE];
                value.extend_from_slice(&self.buffer_size.to_le_bytes());
                vec![Self::reply(value)]
            }
            FAST_FLUSH if self.version >= FAST_BULK_MIN_VERSION => {
                vec![Self::reply(vec![FAST_FLUSH])]
            }
            FAST_FLUSH => {
                self.streaming = true;
                self.buffer_fill = 0;
                self.request_next()
            }
            FAST_CHECK_CHECKSUM => {
                let mut value = vec![FAST_CHECK_CHECKSUM];
                value.extend_from_slice(&byte_sum(&self.journal.lock().payload).to_le_bytes());
                vec![Self::reply(value)]
            }
            FAST_WRITE_BOOT => {
                self.journal.lock().boot_written = ImageInfo::from_bytes(args).ok();
                Vec::new()
            }
            FAST_START_COPY => {
                if let Ok(info) = ImageInfo::from_bytes(args) {
                    let mut cur = ByteCursor::from_bytes(args);
                    cur.set_pos(IMAGE_INFO_SIZE);
                    let address = cur.get_u32();
                    let len = cur.get_u32();
                    self.journal.lock().copy_started = Some((info, address, len));
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_data(&mut self, data: &[u8]) -> Vec<MockReaction> {
        self.journal.lock().payload.extend_from_slice(data);
        self.received += data.len();
        if !self.streaming {
            return Vec::new();
        }
        self.buffer_fill += data.len();
        if self.buffer_fill >= self.buffer_size as usize || self.received >= self.expected {
            self.buffer_fill = 0;
            return self.request_next();
        }
        Vec::new()
    }
}

impl MockDevice for FastDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn services(&self) -> Vec<Service> {
        let svc = FAST_DFU_SERVICE_UUID;
        let mut services = vec![Service {
            uuid: svc,
            characteristics: vec![
                characteristic(
                    svc,
                    FAST_DFU_CMD_UUID,
                    CharProperties {
                        notify: true,
                        ..writable()
                    },
                ),
                characteristic(svc, FAST_DFU_DATA_UUID, writable()),
            ],
        }];
        if self.boot_entry {
            services.push(Service {
                uuid: DFU_SERVICE_UUID,
                characteristics: vec![characteristic(
                    DFU_SERVICE_UUID,
                    DFU_CONTROL_POINT_UUID,
                    CharProperties {
                        indicate: true,
                        ..writable()
                    },
                )],
            });
        }
        services
    }

    fn on_write(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<MockReaction> {
        match characteristic {
            c if c == FAST_DFU_CMD_UUID => self.on_command(data),
            c if c == FAST_DFU_DATA_UUID => self.on_data(data),
            c if c == DFU_CONTROL_POINT_UUID => {
                self.journal.lock().control_writes.push(data.to_vec());
                if self.needs_boot_entry && data == &DFU_ENTER_SIGNAL.to_le_bytes()[..] {
                    self.needs_boot_entry = false;
                    self.name = DFU_BOOT_NAME.to_string();
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_disconnect(&mut self) {
        self.streaming = false;
        self.buffer_fill = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FirmwareBlob;

    fn notified(reactions: &[MockReaction]) -> Vec<u8> {
        reactions
            .iter()
            .flat_map(|r| match r {
                MockReaction::Notify { value, .. } => value.clone(),
                MockReaction::Disconnect => Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_demo_firmware_is_classified() {
        let data = demo_firmware(SIM_APP_ADDR, 4096);
        let blob = FirmwareBlob::classify(data);
        let info = blob.image().unwrap();
        assert_eq!(info.load_addr, SIM_APP_ADDR);
        assert_eq!(info.app_size, 4048);
    }

    #[test]
    fn test_standard_device_reassembles_split_frames() {
        let mut device = StandardDevice::legacy();
        let frame = encode_frame(CMD_GET_INFO, &[]);
        assert!(device.on_write(DFU_RX_UUID, &frame[..3]).is_empty());
        let reply = device.on_write(DFU_RX_UUID, &frame[3..]);

        let bytes = notified(&reply);
        let header = FrameHeader::parse(&bytes).unwrap();
        let resp = Response::decode(header, &bytes[FRAME_HEAD_SIZE..], CMD_GET_INFO).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.reader(5).get_u32(), SIM_SVN);
        assert_eq!(device.journal().snapshot().commands, vec![CMD_GET_INFO]);
    }

    #[test]
    fn test_image_table_reply_spans_notifications() {
        let mut device = StandardDevice::legacy();
        let read = [SYSTEM_CONFIG_READ, 0x40, 0x00, 0x00, 0x01, 0x90, 0x01];
        let reply = device.on_write(DFU_RX_UUID, &encode_frame(CMD_SYSTEM_CONFIG, &read));
        assert_eq!(reply.len(), 2);
        // status, op, address, length, 400 table bytes, framing
        assert_eq!(notified(&reply).len(), 8 + 400 + 8);
    }

    #[test]
    fn test_fast_device_flow_control() {
        let mut device = FastDevice::new(2).with_buffer_size(100);
        let mut erase = Vec::new();
        erase.extend_from_slice(&SIM_APP_ADDR.to_le_bytes());
        erase.extend_from_slice(&150u32.to_le_bytes());
        let states = device.on_write(FAST_DFU_CMD_UUID, &fast_command(FAST_ERASE, &erase));
        assert_eq!(states.len(), 3);

        let next = device.on_write(FAST_DFU_CMD_UUID, &fast_command(FAST_FLUSH, &[]));
        assert_eq!(notified(&next), vec![FAST_NEXT_BUFFER]);
        assert!(device.on_write(FAST_DFU_DATA_UUID, &[0u8; 60]).is_empty());
        let next = device.on_write(FAST_DFU_DATA_UUID, &[0u8; 40]);
        assert_eq!(notified(&next), vec![FAST_NEXT_BUFFER]);
        let done = device.on_write(FAST_DFU_DATA_UUID, &[0u8; 50]);
        assert_eq!(notified(&done), vec![FAST_FLUSH]);
        assert_eq!(device.journal().snapshot().buffer_requests, 2);
    }
}
