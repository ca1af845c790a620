//! Standard frame layout and fast command encoding.
//!
//! ```text
//! standard: [0x4744:2][opcode:2][len:2][payload:len][checksum:2]
//! fast:     [magic:4][opcode:1][args...]
//! ```
//!
//! The standard checksum is the 16-bit byte-sum of opcode, length and payload.

use thiserror::Error;

use super::constants::{FAST_CMD_MAGIC, FRAME_PATTERN, STATUS_SUCCESS};
use crate::codec::ByteCursor;

/// Pattern + opcode + length.
pub const FRAME_HEAD_SIZE: usize = 6;
pub const FRAME_CHECKSUM_SIZE: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Cmd head receive failed.")]
    ShortHead,
    #[error("Cmd head verification failed (pattern 0x{0:04X}).")]
    BadPattern(u16),
    #[error("Cmd body receive failed.")]
    ShortBody,
    #[error("Expected cmdCode 0x{expected:02X} not returned (got 0x{actual:02X}).")]
    UnexpectedOpcode { expected: u16, actual: u16 },
    #[error("Received instruction checksum verification failed (0x{received:04X} != 0x{computed:04X}).")]
    Checksum { received: u16, computed: u16 },
}

/// Frame a standard command.
pub fn encode_frame(opcode: u16, payload: &[u8]) -> Vec<u8> {
    let mut cur = ByteCursor::new(FRAME_HEAD_SIZE + payload.len() + FRAME_CHECKSUM_SIZE);
    cur.put(2, FRAME_PATTERN.into())
        .put(2, opcode.into())
        .put(2, payload.len() as u64)
        .put_bytes(payload.len(), payload, 0);
    let checksum = cur.checksum(4 + payload.len(), 2) & 0xFFFF;
    cur.put(2, checksum.into());
    cur.into_inner()
}

/// Decoded first six bytes of a standard frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u16,
    pub length: u16,
}

impl FrameHeader {
    pub fn parse(head: &[u8]) -> Result<Self, FrameError> {
        if head.len() < FRAME_HEAD_SIZE {
            return Err(FrameError::ShortHead);
        }
        let mut cur = ByteCursor::from_bytes(&head[..FRAME_HEAD_SIZE]);
        let pattern = cur.get_u16();
        if pattern != FRAME_PATTERN {
            return Err(FrameError::BadPattern(pattern));
        }
        Ok(Self {
            opcode: cur.get_u16(),
            length: cur.get_u16(),
        })
    }

    /// Bytes that follow the header: payload plus checksum.
    pub fn body_len(&self) -> usize {
        usize::from(self.length) + FRAME_CHECKSUM_SIZE
    }
}

/// A validated standard response. `data[0]` is the status byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u16,
    pub data: Vec<u8>,
}

impl Response {
    /// Check `body` (payload + checksum) against `header` and the expected opcode.
    pub fn decode(header: FrameHeader, body: &[u8], expected: u16) -> Result<Self, FrameError> {
        let len = usize::from(header.length);
        if body.len() != header.body_len() {
            return Err(FrameError::ShortBody);
        }
        if header.opcode != expected {
            return Err(FrameError::UnexpectedOpcode {
                expected,
                actual: header.opcode,
            });
        }
        let data = body[..len].to_vec();
        let received = u16::from_le_bytes([body[len], body[len + 1]]);
        let computed = Self::checksum_of(header.opcode, &data);
        if received != computed {
            return Err(FrameError::Checksum { received, computed });
        }
        Ok(Self {
            opcode: header.opcode,
            data,
        })
    }

    fn checksum_of(opcode: u16, data: &[u8]) -> u16 {
        let mut cur = ByteCursor::new(4 + data.len());
        cur.put(2, opcode.into())
            .put(2, data.len() as u64)
            .put_bytes(data.len(), data, 0);
        (cur.checksum(cur.len(), 0) & 0xFFFF) as u16
    }

    pub fn status(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        self.status() == STATUS_SUCCESS
    }

    /// Cursor over the response data positioned at `offset`.
    pub fn reader(&self, offset: usize) -> ByteCursor {
        let mut cur = ByteCursor::from_bytes(self.data.clone());
        cur.set_pos(offset);
        cur
    }

    /// Device-side encoding of this response.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.opcode, &self.data)
    }
}

/// `[magic:4][opcode][args]`
pub fn fast_command(opcode: u8, args: &[u8]) -> Vec<u8> {
    let mut cur = ByteCursor::new(5 + args.len());
    cur.put(4, FAST_CMD_MAGIC.into())
        .put_byte(opcode)
        .put_bytes(args.len(), args, 0);
    cur.into_inner()
}

/// Split a fast command into opcode and arguments. `None` without the magic.
pub fn parse_fast_command(data: &[u8]) -> Option<(u8, &[u8])> {
    if data.len() < 5 {
        return None;
    }
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    (magic == FAST_CMD_MAGIC).then(|| (data[4], &data[5..]))
}

/// Erase progress reported by program-start-fast and the fast erase command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseState {
    NotAligned,
    Started,
    /// Sectors erased so far.
    Progress(u16),
    Done,
    OverlapsRunning,
    Failed,
    MissingArea,
    Unknown(u8),
}

impl EraseState {
    /// Parse a state byte; `Progress` takes its count from `cur`.
    pub fn read(code: u8, cur: &mut ByteCursor) -> Self {
        match code {
            0x00 => EraseState::NotAligned,
            0x01 => EraseState::Started,
            0x02 => EraseState::Progress(cur.get_u16()),
            0x03 => EraseState::Done,
            0x04 => EraseState::OverlapsRunning,
            0x05 => EraseState::Failed,
            0x06 => EraseState::MissingArea,
            other => EraseState::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EraseState::NotAligned => 0x00,
            EraseState::Started => 0x01,
            EraseState::Progress(_) => 0x02,
            EraseState::Done => 0x03,
            EraseState::OverlapsRunning => 0x04,
            EraseState::Failed => 0x05,
            EraseState::MissingArea => 0x06,
            EraseState::Unknown(c) => *c,
        }
    }

    /// Failure description for terminal error states.
    pub fn failure(&self) -> Option<String> {
        match self {
            EraseState::NotAligned => {
                Some("The starting address of the flash to be erased is not 4K aligned.".into())
            }
            EraseState::OverlapsRunning => Some(
                "The erase area overlaps with the current running firmware area.".into(),
            ),
            EraseState::Failed => Some("Erase failed.".into()),
            EraseState::MissingArea => Some("The area to be erased does not exist.".into()),
            EraseState::Unknown(code) => Some(format!("unknown erase state 0x{:02X}", code)),
            EraseState::Started | EraseState::Progress(_) | EraseState::Done => None,
        }
    }
}
