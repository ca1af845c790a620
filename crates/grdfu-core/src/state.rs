//! Per-update request and device context.
//!
//! An [`UpdateRequest`] is what the caller asked for, validated on the host
//! before any I/O. A [`DeviceSession`] accumulates what the device reported
//! while the flow runs and is dropped with it.

use std::fmt;

use crate::error::{DfuError, Result};
use crate::image::{FirmwareBlob, ImageInfo};
use crate::memory::MemoryArea;
use crate::protocol::{SCA_AREA_SIZE, sca_for_svn};

/// What the payload is and where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Replace the firmware at the image's own load address.
    Firmware,
    /// Stage the firmware at `copy_address` for a later internal copy.
    CopyFirmware { copy_address: u32 },
    /// Write an opaque resource at `address`.
    Resource { address: u32, external_flash: bool },
}

impl UpdateMode {
    pub fn is_firmware(&self) -> bool {
        !matches!(self, UpdateMode::Resource { .. })
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::Firmware => write!(f, "firmware"),
            UpdateMode::CopyFirmware { copy_address } => {
                write!(f, "firmware (copy to 0x{:08X})", copy_address)
            }
            UpdateMode::Resource {
                address,
                external_flash,
            } => write!(
                f,
                "resource at 0x{:08X} ({} flash)",
                address,
                if *external_flash { "external" } else { "internal" }
            ),
        }
    }
}

/// A validated update: mode plus classified payload.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    mode: UpdateMode,
    blob: FirmwareBlob,
}

impl UpdateRequest {
    /// Classify `data` and run the host-side checks.
    ///
    /// Firmware modes need an embedded image info record; copy mode also
    /// needs the image's flash footprint to stay clear of the copy area.
    pub fn new(mode: UpdateMode, data: impl Into<Vec<u8>>) -> Result<Self> {
        let blob = FirmwareBlob::classify(data);
        if blob.is_empty() {
            return Err(DfuError::Config("update payload is empty".into()));
        }
        if u32::try_from(blob.len()).is_err() {
            return Err(DfuError::Config(format!(
                "update payload of {} bytes does not fit the address space",
                blob.len()
            )));
        }
        let request = Self { mode, blob };
        if mode.is_firmware() {
            let image = request.blob.require_image()?;
            if let Some(copy) = request.copy_area() {
                image.area("sourceArea").check_no_overlap(&copy)?;
            }
        }
        Ok(request)
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn blob(&self) -> &FirmwareBlob {
        &self.blob
    }

    pub fn data(&self) -> &[u8] {
        self.blob.data()
    }

    /// Payload length in bytes.
    pub fn size(&self) -> u32 {
        self.blob.len() as u32
    }

    pub fn checksum(&self) -> u32 {
        self.blob.checksum()
    }

    /// The embedded image info; present for every firmware mode.
    pub fn image(&self) -> Result<&ImageInfo> {
        Ok(self.blob.require_image()?)
    }

    pub fn external_flash(&self) -> bool {
        matches!(
            self.mode,
            UpdateMode::Resource {
                external_flash: true,
                ..
            }
        )
    }

    /// Flash address of the first payload byte.
    pub fn write_address(&self) -> u32 {
        match self.mode {
            UpdateMode::Firmware => self.blob.image().map_or(0, |i| i.load_addr),
            UpdateMode::CopyFirmware { copy_address } => copy_address,
            UpdateMode::Resource { address, .. } => address,
        }
    }

    /// Where the payload is meant to live: the image's load address for
    /// firmware, the requested address for resources.
    pub fn target_area(&self) -> MemoryArea {
        let start = match self.mode {
            UpdateMode::Resource { address, .. } => address,
            _ => self.blob.image().map_or(0, |i| i.load_addr),
        };
        MemoryArea::new("targetArea", start, self.size())
    }

    pub fn copy_area(&self) -> Option<MemoryArea> {
        match self.mode {
            UpdateMode::CopyFirmware { copy_address } => {
                Some(MemoryArea::new("copyArea", copy_address, self.size()))
            }
            _ => None,
        }
    }

    /// Image info announced by program-start, re-targeted in copy mode.
    pub fn announced_image(&self) -> Result<ImageInfo> {
        let image = self.image()?;
        Ok(match self.mode {
            UpdateMode::CopyFirmware { copy_address } => image.with_load_addr(copy_address),
            _ => image.clone(),
        })
    }
}

/// Protocol variant, fixed once the engine is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Standard protocol, control point indicates.
    Extended,
    /// Standard protocol without indications on the control point.
    Legacy,
    Fast,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Extended => write!(f, "standard-extended"),
            Flow::Legacy => write!(f, "standard-legacy"),
            Flow::Fast => write!(f, "fast"),
        }
    }
}

/// Everything learned from the device during one update.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub flow: Flow,
    /// Start of the configuration area.
    pub sca: u32,
    pub dfu_version: u8,
    pub boot_info: Option<ImageInfo>,
    pub peer_encrypted: bool,
    /// Active image slot flag from the extra info.
    pub position: u8,
    pub save_address: u32,
    pub app_info: Option<ImageInfo>,
    /// Resident image table (legacy flow).
    pub image_table: Vec<ImageInfo>,
    /// Fast protocol version.
    pub fast_version: u8,
    pub buffer_size: u32,
}

impl DeviceSession {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            sca: 0,
            dfu_version: 0,
            boot_info: None,
            peer_encrypted: false,
            position: 0,
            save_address: 0,
            app_info: None,
            image_table: Vec::new(),
            fast_version: 0,
            buffer_size: 0,
        }
    }

    /// Record a chip-info answer.
    pub fn set_chip(&mut self, svn: u32, dfu_version: u8) {
        self.sca = sca_for_svn(svn);
        self.dfu_version = dfu_version;
    }

    pub fn sca_area(&self) -> MemoryArea {
        MemoryArea::new("scaArea", self.sca, SCA_AREA_SIZE)
    }

    pub fn boot_info(&self) -> Result<&ImageInfo> {
        self.boot_info
            .as_ref()
            .ok_or_else(|| DfuError::protocol("boot info has not been read"))
    }

    pub fn boot_area(&self) -> Result<MemoryArea> {
        Ok(self.boot_info()?.area("bootArea"))
    }

    /// The running application's footprint, when the device reported one.
    pub fn app_area(&self) -> Option<MemoryArea> {
        self.app_info
            .as_ref()
            .filter(|i| i.is_available())
            .map(|i| i.area("appArea"))
    }
}

/// How an update that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Stopped between chunks at `percent`.
    Cancelled { percent: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FirmwareError;
    use crate::image::tests::{sample_info, unsigned_firmware};

    #[test]
    fn test_firmware_mode_rejects_resource_blob() {
        let err = UpdateRequest::new(UpdateMode::Firmware, vec![0xAB; 512]).unwrap_err();
        assert!(matches!(err, DfuError::Firmware(FirmwareError::NotFirmware)));

        let ok = UpdateRequest::new(
            UpdateMode::Resource {
                address: 0x0110_0000,
                external_flash: true,
            },
            vec![0xAB; 512],
        )
        .unwrap();
        assert!(ok.external_flash());
        assert_eq!(ok.write_address(), 0x0110_0000);
        assert_eq!(ok.target_area(), MemoryArea::new("targetArea", 0x0110_0000, 512));
        assert!(ok.copy_area().is_none());
    }

    #[test]
    fn test_copy_mode_precheck() {
        let info = sample_info(0x0104_0000, 4048);
        let data = unsigned_firmware(4096, &info);

        // Footprint runs to 0x0104_0000 + 4048 + 904.
        let err = UpdateRequest::new(
            UpdateMode::CopyFirmware {
                copy_address: 0x0104_1000,
            },
            data.clone(),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sourceArea(0x01040000-0x01041358)"), "{msg}");
        assert!(msg.contains("copyArea(0x01041000-0x01042000)"), "{msg}");

        let req = UpdateRequest::new(
            UpdateMode::CopyFirmware {
                copy_address: 0x0108_0000,
            },
            data,
        )
        .unwrap();
        assert_eq!(req.write_address(), 0x0108_0000);
        assert_eq!(req.target_area().start, 0x0104_0000);
        assert_eq!(req.announced_image().unwrap().load_addr, 0x0108_0000);
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let err = UpdateRequest::new(
            UpdateMode::Resource {
                address: 0,
                external_flash: false,
            },
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DfuError::Config(_)));
    }

    #[test]
    fn test_device_session_areas() {
        let mut session = DeviceSession::new(Flow::Extended);
        session.set_chip(0x1EA8, 2);
        assert_eq!(session.sca_area(), MemoryArea::new("scaArea", 0x0100_0000, 0x2000));
        assert!(session.boot_area().is_err());

        session.boot_info = Some(sample_info(0x0100_4000, 0x1000));
        assert_eq!(session.boot_area().unwrap().size, 0x1000 + 904);

        session.app_info = Some(ImageInfo::from_bytes(&[0u8; 40]).unwrap());
        assert!(session.app_area().is_none());
        session.app_info = Some(sample_info(0x0102_0000, 0x2000));
        assert_eq!(session.app_area().unwrap().start, 0x0102_0000);
    }
}
