//! Firmware image model.
//!
//! A firmware blob carries no container format: the only way to tell an
//! application image from an arbitrary resource file is to look for the image
//! pattern at fixed offsets from the end of the blob.
//!
//! Layouts recognised (offsets from the end):
//!
//! ```text
//! unsigned:           ... | info(40) | pad(8)                     <- pattern at len-48
//! signed:             ... | info(40) | pad(8) | signature(856)    <- pattern at len-904
//! signed-only marker: "SIGN" at len-784 inside the signature block
//! ```

use std::fmt;

use thiserror::Error;

use crate::codec::{ByteCursor, byte_sum};
use crate::memory::{self, MemoryArea};

/// Magic at the start of every valid image info record.
pub const IMAGE_PATTERN: u16 = 0x4744;
/// General image info record size.
pub const IMAGE_INFO_SIZE: usize = 40;
/// Boot-info record size (no pattern/version/comment).
pub const BOOT_INFO_SIZE: usize = 24;
/// Trailing footer holding the image info record.
pub const IMAGE_FOOTER_SIZE: usize = 48;
/// Signature block appended to signed images.
pub const SIGNATURE_BLOCK_SIZE: usize = 856;
/// Offset from the end at which the signed-only marker sits (256 + 520 + 8).
pub const SIGN_MARKER_OFFSET: usize = 784;
/// "SIGN" read little-endian.
pub const SIGNED_ONLY_MARKER: u32 = 0x4E47_4953;
/// Entries in the device's resident image table.
pub const IMAGE_TABLE_ENTRIES: usize = 10;
/// Bytes an image occupies in flash beyond its application code.
pub const IMAGE_OVERHEAD: u32 = (IMAGE_FOOTER_SIZE + SIGNATURE_BLOCK_SIZE) as u32;

const COMMENT_SIZE: usize = 12;
const BOOT_INFO_COMMENT: &[u8] = b"bootinfo";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("Can't find image information data.")]
    NotFirmware,
    #[error("Image info record too short: {actual} bytes, need {expected}")]
    TooShort { expected: usize, actual: usize },
    #[error("Image table size {0} is not a multiple of 40")]
    BadTableSize(usize),
}

/// Image metadata header.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub pattern: u16,
    pub version: u16,
    pub app_size: u32,
    pub checksum: u32,
    pub load_addr: u32,
    pub run_addr: u32,
    pub spi_access_mode: u32,
    pub boot_config: u32,
    /// Raw comment bytes, NUL padded.
    pub comment: [u8; COMMENT_SIZE],
}

impl ImageInfo {
    /// A valid record for an image of `app_size` bytes loaded and run at
    /// `load_addr`. `comment` is truncated to 12 bytes.
    pub fn new(load_addr: u32, app_size: u32, checksum: u32, comment: &str) -> Self {
        let mut buf = [0u8; COMMENT_SIZE];
        let n = comment.len().min(COMMENT_SIZE);
        buf[..n].copy_from_slice(&comment.as_bytes()[..n]);
        Self {
            pattern: IMAGE_PATTERN,
            version: 1,
            app_size,
            checksum,
            load_addr,
            run_addr: load_addr,
            spi_access_mode: 0,
            boot_config: 0,
            comment: buf,
        }
    }

    /// Parse the 24-byte boot-info form. The pattern is synthesized.
    pub fn from_boot_info(data: &[u8]) -> Result<Self, FirmwareError> {
        if data.len() < BOOT_INFO_SIZE {
            return Err(FirmwareError::TooShort {
                expected: BOOT_INFO_SIZE,
                actual: data.len(),
            });
        }
        let mut cur = ByteCursor::from_bytes(&data[..BOOT_INFO_SIZE]);
        let mut comment = [0u8; COMMENT_SIZE];
        comment[..BOOT_INFO_COMMENT.len()].copy_from_slice(BOOT_INFO_COMMENT);
        Ok(Self {
            pattern: IMAGE_PATTERN,
            version: 0,
            app_size: cur.get_u32(),
            checksum: cur.get_u32(),
            load_addr: cur.get_u32(),
            run_addr: cur.get_u32(),
            spi_access_mode: cur.get_u32(),
            boot_config: cur.get_u32(),
            comment,
        })
    }

    /// Parse the general 40-byte form (longer input is cut at 40 bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self, FirmwareError> {
        if data.len() < IMAGE_INFO_SIZE {
            return Err(FirmwareError::TooShort {
                expected: IMAGE_INFO_SIZE,
                actual: data.len(),
            });
        }
        let mut cur = ByteCursor::from_bytes(&data[..IMAGE_INFO_SIZE]);
        let pattern = cur.get_u16();
        let version = cur.get_u16();
        let app_size = cur.get_u32();
        let checksum = cur.get_u32();
        let load_addr = cur.get_u32();
        let run_addr = cur.get_u32();
        let spi_access_mode = cur.get_u32();
        let boot_config = cur.get_u32();
        let mut comment = [0u8; COMMENT_SIZE];
        comment.copy_from_slice(&cur.get_bytes(COMMENT_SIZE));
        Ok(Self {
            pattern,
            version,
            app_size,
            checksum,
            load_addr,
            run_addr,
            spi_access_mode,
            boot_config,
            comment,
        })
    }

    /// Split a resident image table into its valid entries.
    pub fn parse_table(data: &[u8]) -> Result<Vec<ImageInfo>, FirmwareError> {
        if data.len() % IMAGE_INFO_SIZE != 0 {
            return Err(FirmwareError::BadTableSize(data.len()));
        }
        let mut out = Vec::new();
        for chunk in data.chunks_exact(IMAGE_INFO_SIZE) {
            let info = Self::from_bytes(chunk)?;
            if info.is_available() {
                out.push(info);
            }
        }
        Ok(out)
    }

    pub fn is_available(&self) -> bool {
        self.pattern == IMAGE_PATTERN
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut cur = ByteCursor::new(IMAGE_INFO_SIZE);
        cur.put(2, self.pattern.into())
            .put(2, self.version.into())
            .put(4, self.app_size.into())
            .put(4, self.checksum.into())
            .put(4, self.load_addr.into())
            .put(4, self.run_addr.into())
            .put(4, self.spi_access_mode.into())
            .put(4, self.boot_config.into())
            .put_bytes(COMMENT_SIZE, &self.comment, 0);
        cur.into_inner()
    }

    /// The 24-byte boot-info form, as stored in the configuration area.
    pub fn serialize_boot_info(&self) -> Vec<u8> {
        let mut cur = ByteCursor::new(BOOT_INFO_SIZE);
        cur.put(4, self.app_size.into())
            .put(4, self.checksum.into())
            .put(4, self.load_addr.into())
            .put(4, self.run_addr.into())
            .put(4, self.spi_access_mode.into())
            .put(4, self.boot_config.into());
        cur.into_inner()
    }

    /// Copy re-targeted at another load address (copy mode).
    pub fn with_load_addr(&self, load_addr: u32) -> Self {
        Self {
            load_addr,
            ..self.clone()
        }
    }

    /// Flash span the image occupies: code plus footer plus signature block.
    pub fn footprint(&self) -> u32 {
        self.app_size.wrapping_add(IMAGE_OVERHEAD)
    }

    pub fn area(&self, label: &str) -> MemoryArea {
        MemoryArea::new(label, self.load_addr, self.footprint())
    }

    /// Whether the application code (without footer) intersects a range.
    pub fn has_overlap(&self, start: u32, size: u32) -> bool {
        memory::overlap(self.load_addr, self.app_size, start, size)
    }

    pub fn comment_str(&self) -> String {
        let end = self
            .comment
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMENT_SIZE);
        String::from_utf8_lossy(&self.comment[..end]).into_owned()
    }
}

impl fmt::Debug for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageInfo")
            .field("pattern", &format_args!("0x{:04X}", self.pattern))
            .field("version", &self.version)
            .field("app_size", &self.app_size)
            .field("checksum", &format_args!("0x{:08X}", self.checksum))
            .field("load_addr", &format_args!("0x{:08X}", self.load_addr))
            .field("run_addr", &format_args!("0x{:08X}", self.run_addr))
            .field("comment", &self.comment_str())
            .finish()
    }
}

/// Signature/encryption state of a firmware blob, as sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionState {
    #[default]
    None = 0,
    Signed = 1,
    SignedEncrypted = 2,
}

impl EncryptionState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionState::None => write!(f, "plain"),
            EncryptionState::Signed => write!(f, "signed"),
            EncryptionState::SignedEncrypted => write!(f, "signed+encrypted"),
        }
    }
}

/// Raw update payload plus what could be learned from it.
#[derive(Clone)]
pub struct FirmwareBlob {
    data: Vec<u8>,
    checksum: u32,
    image: Option<ImageInfo>,
    encryption: EncryptionState,
}

impl FirmwareBlob {
    /// Classify a blob as firmware (with embedded image info) or resource.
    pub fn classify(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let checksum = byte_sum(&data);
        let len = data.len();

        let mut header_at = None;
        let mut encryption = EncryptionState::None;

        if len > IMAGE_FOOTER_SIZE {
            let mut reader = ByteCursor::from_bytes(data.as_slice());
            reader.set_pos(len - IMAGE_FOOTER_SIZE);
            if reader.get_u16() == IMAGE_PATTERN {
                header_at = Some(len - IMAGE_FOOTER_SIZE);
            } else if len > IMAGE_FOOTER_SIZE + SIGNATURE_BLOCK_SIZE {
                let signed_at = len - IMAGE_FOOTER_SIZE - SIGNATURE_BLOCK_SIZE;
                reader.set_pos(signed_at);
                if reader.get_u16() == IMAGE_PATTERN {
                    reader.set_pos(len - SIGN_MARKER_OFFSET);
                    encryption = if reader.get_u32() == SIGNED_ONLY_MARKER {
                        EncryptionState::Signed
                    } else {
                        EncryptionState::SignedEncrypted
                    };
                    header_at = Some(signed_at);
                }
            }
        }

        let image = header_at.and_then(|at| ImageInfo::from_bytes(&data[at..]).ok());

        Self {
            data,
            checksum,
            image,
            encryption,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sum of every byte, mod 2^32.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn is_firmware(&self) -> bool {
        self.image.is_some()
    }

    pub fn image(&self) -> Option<&ImageInfo> {
        self.image.as_ref()
    }

    pub fn require_image(&self) -> Result<&ImageInfo, FirmwareError> {
        self.image.as_ref().ok_or(FirmwareError::NotFirmware)
    }

    pub fn encryption(&self) -> EncryptionState {
        self.encryption
    }
}

impl fmt::Debug for FirmwareBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareBlob")
            .field("len", &self.data.len())
            .field("checksum", &format_args!("0x{:08X}", self.checksum))
            .field("image", &self.image)
            .field("encryption", &self.encryption)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_info(load_addr: u32, app_size: u32) -> ImageInfo {
        ImageInfo::new(load_addr, app_size, 0x0001_2345, "demo")
    }

    /// Unsigned firmware of `len` bytes with its info footer at `len - 48`.
    pub(crate) fn unsigned_firmware(len: usize, info: &ImageInfo) -> Vec<u8> {
        let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
        let at = len - IMAGE_FOOTER_SIZE;
        data[at..at + IMAGE_INFO_SIZE].copy_from_slice(&info.serialize());
        data[at + IMAGE_INFO_SIZE..].fill(0);
        data
    }

    #[test]
    fn test_image_info_roundtrip() {
        let info = sample_info(0x0104_0000, 4048);
        let bytes = info.serialize();
        assert_eq!(bytes.len(), IMAGE_INFO_SIZE);
        let parsed = ImageInfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, info);
        assert!(parsed.is_available());
        assert_eq!(parsed.comment_str(), "demo");
    }

    #[test]
    fn test_boot_info_form_synthesizes_pattern() {
        let mut cur = ByteCursor::new(BOOT_INFO_SIZE);
        cur.put(4, 0x2000).put(4, 0xABCD).put(4, 0x0100_4000).put(4, 0x0100_4000);
        let info = ImageInfo::from_boot_info(cur.as_slice()).unwrap();
        assert!(info.is_available());
        assert_eq!(info.app_size, 0x2000);
        assert_eq!(info.load_addr, 0x0100_4000);
        assert_eq!(info.comment_str(), "bootinfo");
        assert_eq!(info.footprint(), 0x2000 + 904);
        assert_eq!(info.serialize_boot_info(), cur.as_slice());
    }

    #[test]
    fn test_general_form_without_pattern_is_unavailable() {
        let info = ImageInfo::from_bytes(&[0u8; 40]).unwrap();
        assert!(!info.is_available());
        assert!(matches!(
            ImageInfo::from_bytes(&[0u8; 39]),
            Err(FirmwareError::TooShort { expected: 40, actual: 39 })
        ));
    }

    #[test]
    fn test_with_load_addr_keeps_everything_else() {
        let info = sample_info(0x0104_0000, 100);
        let moved = info.with_load_addr(0x0120_0000);
        assert_eq!(moved.load_addr, 0x0120_0000);
        assert_eq!(moved.run_addr, info.run_addr);
        assert_eq!(moved.checksum, info.checksum);
    }

    #[test]
    fn test_has_overlap_uses_app_size() {
        let info = sample_info(0x0104_0000, 0x1000);
        assert!(info.has_overlap(0x0104_0FFF, 1));
        assert!(!info.has_overlap(0x0104_1000, 0x100));
        assert!(!info.has_overlap(0x0103_F000, 0x1000));
    }

    #[test]
    fn test_parse_table_keeps_valid_entries() {
        let mut table = vec![0xFFu8; IMAGE_INFO_SIZE * IMAGE_TABLE_ENTRIES];
        let a = sample_info(0x0104_0000, 100);
        let b = sample_info(0x0110_0000, 200);
        table[..40].copy_from_slice(&a.serialize());
        table[80..120].copy_from_slice(&b.serialize());
        let list = ImageInfo::parse_table(&table).unwrap();
        assert_eq!(list, vec![a, b]);

        assert!(ImageInfo::parse_table(&[0xFF; 400]).unwrap().is_empty());
        assert_eq!(
            ImageInfo::parse_table(&[0u8; 41]),
            Err(FirmwareError::BadTableSize(41))
        );
    }

    #[test]
    fn test_classify_unsigned_firmware() {
        let info = sample_info(0x0104_0000, 4048);
        let data = unsigned_firmware(4096, &info);
        let blob = FirmwareBlob::classify(data.clone());
        assert!(blob.is_firmware());
        assert_eq!(blob.encryption(), EncryptionState::None);
        assert_eq!(blob.image(), Some(&info));
        assert_eq!(blob.checksum(), byte_sum(&data));
    }

    fn signed_firmware(marker: u32) -> (Vec<u8>, ImageInfo) {
        let info = sample_info(0x0104_0000, 2000);
        let len = 2000 + IMAGE_FOOTER_SIZE + SIGNATURE_BLOCK_SIZE;
        let mut data = vec![0u8; len];
        let at = len - IMAGE_FOOTER_SIZE - SIGNATURE_BLOCK_SIZE;
        data[at..at + IMAGE_INFO_SIZE].copy_from_slice(&info.serialize());
        let m = len - SIGN_MARKER_OFFSET;
        data[m..m + 4].copy_from_slice(&marker.to_le_bytes());
        (data, info)
    }

    #[test]
    fn test_classify_signed_only() {
        let (data, info) = signed_firmware(SIGNED_ONLY_MARKER);
        let blob = FirmwareBlob::classify(data);
        assert_eq!(blob.encryption(), EncryptionState::Signed);
        assert_eq!(blob.image(), Some(&info));
    }

    #[test]
    fn test_classify_signed_and_encrypted() {
        let (data, _) = signed_firmware(0x1234_5678);
        let blob = FirmwareBlob::classify(data);
        assert!(blob.is_firmware());
        assert_eq!(blob.encryption(), EncryptionState::SignedEncrypted);
        assert_eq!(blob.encryption().as_u8(), 2);
    }

    #[test]
    fn test_classify_resource() {
        let blob = FirmwareBlob::classify(vec![0x5Au8; 2048]);
        assert!(!blob.is_firmware());
        assert_eq!(blob.encryption(), EncryptionState::None);
        assert_eq!(blob.require_image(), Err(FirmwareError::NotFirmware));
        assert_eq!(blob.checksum(), 0x5A * 2048);

        // Too short to hold a footer at all.
        let blob = FirmwareBlob::classify(vec![0x44, 0x47]);
        assert!(!blob.is_firmware());
    }
}
