//! Protocol module - wire definitions shared by both engines and the simulators.

pub mod constants;
pub mod frame;

pub use constants::*;
pub use frame::{
    EraseState, FRAME_CHECKSUM_SIZE, FRAME_HEAD_SIZE, FrameError, FrameHeader, Response,
    encode_frame, fast_command, parse_fast_command,
};
