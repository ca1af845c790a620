//! Wire constants for the standard and fast DFU protocols.

use uuid::Uuid;

// ============================================================================
// GATT Layout
// ============================================================================

/// Standard DFU service.
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0xa6ed0401_d344_460a_8075_b9e8ec90d71b);
/// Device -> host responses (notify).
pub const DFU_TX_UUID: Uuid = Uuid::from_u128(0xa6ed0402_d344_460a_8075_b9e8ec90d71b);
/// Host -> device commands (write without response).
pub const DFU_RX_UUID: Uuid = Uuid::from_u128(0xa6ed0403_d344_460a_8075_b9e8ec90d71b);
/// Control point. Indicate support selects the extended flow.
pub const DFU_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0xa6ed0404_d344_460a_8075_b9e8ec90d71b);

/// Fast DFU service.
pub const FAST_DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0xa6ed0701_d344_460a_8075_b9e8ec90d71b);
/// Fast DFU command/response characteristic.
pub const FAST_DFU_CMD_UUID: Uuid = Uuid::from_u128(0xa6ed0702_d344_460a_8075_b9e8ec90d71b);
/// Fast DFU bulk data characteristic.
pub const FAST_DFU_DATA_UUID: Uuid = Uuid::from_u128(0xa6ed0703_d344_460a_8075_b9e8ec90d71b);

// ============================================================================
// Magics
// ============================================================================

/// Leading pattern of every standard frame.
pub const FRAME_PATTERN: u16 = 0x4744;

/// DFU-enter signal written to the control point.
pub const DFU_ENTER_SIGNAL: u32 = 0x474F_4F44; // 'GOOD'

/// Prefix of every fast DFU command.
pub const FAST_CMD_MAGIC: u32 = 0x474F_4F44; // 'GOOD'

// ============================================================================
// Standard Opcodes
// ============================================================================

pub const CMD_GET_INFO: u16 = 0x01;
pub const CMD_PROGRAM_START: u16 = 0x23;
pub const CMD_PROGRAM_FLASH: u16 = 0x24;
pub const CMD_PROGRAM_END: u16 = 0x25;
pub const CMD_SYSTEM_CONFIG: u16 = 0x27;
pub const CMD_SET_DFU_MODE: u16 = 0x41;
pub const CMD_GET_FW_INFO: u16 = 0x42;
/// Response opcode after a raw fast-mode bulk write.
pub const CMD_PROGRAM_FLASH_FAST: u16 = 0xFF;

/// Status byte of a successful response.
pub const STATUS_SUCCESS: u8 = 0x01;

// SYSTEM_CONFIG operations
pub const SYSTEM_CONFIG_READ: u8 = 0x00;
pub const SYSTEM_CONFIG_WRITE: u8 = 0x01;

// SET_DFU_MODE arguments
/// Update the running slot: the device drops into its bootloader.
pub const DFU_MODE_RUNNING_SLOT: u8 = 0x02;
/// Stage the image for a later internal copy.
pub const DFU_MODE_COPY: u8 = 0x01;

// PROGRAM_FLASH type byte
pub const FLASH_WRITE_INTERNAL: u8 = 0x01;
pub const FLASH_WRITE_EXTERNAL: u8 = 0x11;

// PROGRAM_END type byte
pub const END_FIRMWARE: u8 = 0x01;
pub const END_RESOURCE_INTERNAL: u8 = 0x02;
pub const END_RESOURCE_EXTERNAL: u8 = 0x12;

/// Payload carried by one PROGRAM_FLASH command.
pub const FLASH_CHUNK_SIZE: usize = 1024;

/// First protocol version whose program-start carries the encryption state.
pub const DFU_VERSION_ENCRYPTION_FLAGS: u8 = 2;

/// Extra-info position value meaning the app runs from the slot being updated.
pub const POSITION_RUNNING_SLOT: u8 = 0x01;

// ============================================================================
// Configuration Area
// ============================================================================

/// SCA base for the chip families reporting one of [`SCA_HIGH_SVNS`].
pub const SCA_HIGH: u32 = 0x0100_0000;
/// SCA base for every other chip family.
pub const SCA_DEFAULT: u32 = 0x0020_0000;
/// Stack SVNs of chips whose SCA sits at [`SCA_HIGH`].
pub const SCA_HIGH_SVNS: &[u32] = &[0x0000_1EA8, 0x0000_0B88];
/// Size of the bootloader configuration area.
pub const SCA_AREA_SIZE: u32 = 0x2000;
/// Offset of the image table inside the SCA.
pub const IMAGE_TABLE_OFFSET: u32 = 0x40;
/// Image table length in bytes (10 entries of 40).
pub const IMAGE_TABLE_SIZE: u16 = 400;

// ============================================================================
// Fast DFU Opcodes
// ============================================================================

pub const FAST_ERASE: u8 = 0x01;
pub const FAST_FLUSH: u8 = 0x02;
pub const FAST_CHECK_CHECKSUM: u8 = 0x03;
pub const FAST_WRITE_BOOT: u8 = 0x04;
pub const FAST_SELECT_FLASH: u8 = 0x05;
pub const FAST_FLOW_CTRL_PAUSE: u8 = 0x06;
pub const FAST_FLOW_CTRL_RESUME: u8 = 0x07;
pub const FAST_START_COPY: u8 = 0x08;
pub const FAST_GET_BUFFER_SIZE: u8 = 0x09;
pub const FAST_NEXT_BUFFER: u8 = 0x0A;
pub const FAST_GET_VERSION: u8 = 0x0B;

/// From this version on the payload goes out in one bulk write.
pub const FAST_BULK_MIN_VERSION: u8 = 3;
/// Buffer size assumed by bulk-capable devices.
pub const FAST_DEFAULT_BUFFER_SIZE: u32 = 4096;
/// Flash erase granularity.
pub const ERASE_SECTOR_SIZE: u32 = 4096;

// ============================================================================
// Reconnect Names
// ============================================================================

/// Advertised by the bootloader after a running-slot mode switch.
pub const BOOTLOADER_NAME: &str = "Bootloader_OTA";
/// Advertised by the DFU boot after the enter signal.
pub const DFU_BOOT_NAME: &str = "Goodix_DFU";

/// Chip configuration area base for a reported stack SVN.
pub fn sca_for_svn(svn: u32) -> u32 {
    if SCA_HIGH_SVNS.contains(&svn) {
        SCA_HIGH
    } else {
        SCA_DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sca_lookup() {
        assert_eq!(sca_for_svn(0x1EA8), SCA_HIGH);
        assert_eq!(sca_for_svn(0x0B88), SCA_HIGH);
        assert_eq!(sca_for_svn(0xCA0F_33C7), SCA_DEFAULT);
        assert_eq!(sca_for_svn(0), SCA_DEFAULT);
    }

    #[test]
    fn test_uuids_share_suffix() {
        assert_eq!(
            DFU_SERVICE_UUID.to_string(),
            "a6ed0401-d344-460a-8075-b9e8ec90d71b"
        );
        assert_eq!(
            FAST_DFU_DATA_UUID.to_string(),
            "a6ed0703-d344-460a-8075-b9e8ec90d71b"
        );
    }

    #[test]
    fn test_enter_signal_bytes() {
        assert_eq!(&DFU_ENTER_SIGNAL.to_le_bytes(), b"DOOG");
    }
}
