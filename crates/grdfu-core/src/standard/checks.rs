//! Device-side validation for the standard flows.
//!
//! Pure functions over the request and what the device reported; nothing
//! here talks to the link.

use crate::error::{DfuError, Result};
use crate::image::{EncryptionState, IMAGE_TABLE_ENTRIES, ImageInfo};
use crate::memory::{MemoryArea, check_all, overlap};
use crate::state::{DeviceSession, UpdateMode, UpdateRequest};

/// Overlap checks of the extended flow.
///
/// The target never touches the configuration area or the boot image. A copy
/// destination must also avoid the target, the running app and both of the
/// above. An internal resource must not land on the running app.
pub fn extended_overlap(request: &UpdateRequest, session: &DeviceSession) -> Result<()> {
    let target = request.target_area();
    let sca = session.sca_area();
    let boot = session.boot_area()?;
    let app = session.app_area();

    check_all([(&sca, &target), (&boot, &target)])?;

    match request.mode() {
        UpdateMode::CopyFirmware { .. } => {
            let copy = copy_area(request)?;
            check_all([(&target, &copy), (&sca, &copy), (&boot, &copy)])?;
            if let Some(app) = &app {
                app.check_no_overlap(&copy)?;
            }
        }
        UpdateMode::Resource {
            external_flash: false,
            ..
        } => {
            if let Some(app) = &app {
                app.check_no_overlap(&target)?;
            }
        }
        UpdateMode::Firmware | UpdateMode::Resource { .. } => {}
    }
    Ok(())
}

/// Overlap checks of the legacy flow, which knows the resident image table
/// instead of the running app.
pub fn legacy_overlap(request: &UpdateRequest, session: &DeviceSession) -> Result<()> {
    let target = request.target_area();
    let sca = session.sca_area();
    let boot = session.boot_area()?;
    let images: Vec<MemoryArea> = session
        .image_table
        .iter()
        .map(|i| i.area("imageTableArea"))
        .collect();

    sca.check_no_overlap(&target)?;

    match request.mode() {
        UpdateMode::Firmware => boot.check_no_overlap(&target)?,
        UpdateMode::CopyFirmware { .. } => {
            let copy = copy_area(request)?;
            check_all([(&target, &copy), (&sca, &copy), (&boot, &copy)])?;
            check_all(images.iter().map(|image| (image, &copy)))?;
        }
        UpdateMode::Resource { .. } => {
            boot.check_no_overlap(&target)?;
            check_all(images.iter().map(|image| (image, &target)))?;
        }
    }
    Ok(())
}

fn copy_area(request: &UpdateRequest) -> Result<MemoryArea> {
    request
        .copy_area()
        .ok_or_else(|| DfuError::Config("copy mode without a copy address".into()))
}

/// Firmware must be encrypted exactly when the device runs encrypted.
pub fn check_encryption(request: &UpdateRequest, session: &DeviceSession) -> Result<()> {
    if !request.mode().is_firmware() {
        return Ok(());
    }
    let encrypted = request.blob().encryption() == EncryptionState::SignedEncrypted;
    if session.peer_encrypted != encrypted {
        return Err(DfuError::protocol(
            "The new firmware and target device encryption status do not match.",
        ));
    }
    Ok(())
}

/// Result of reconciling the resident image table with a new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUpdate {
    /// Entries to keep, in order.
    pub entries: Vec<ImageInfo>,
    /// Entries removed because the new image covers them.
    pub dropped: Vec<ImageInfo>,
    /// Whether the device table must be rewritten.
    pub changed: bool,
}

/// Drop every table entry the new image would overwrite and make sure the
/// boot image is listed. Dropped entries are returned for the caller to report.
///
/// An empty table is left alone. A rewrite that would need more than
/// [`IMAGE_TABLE_ENTRIES`] entries is an error rather than being truncated.
pub fn reconcile_image_table(
    target: &ImageInfo,
    boot: &ImageInfo,
    table: &[ImageInfo],
) -> Result<TableUpdate> {
    if table.is_empty() {
        return Ok(TableUpdate {
            entries: Vec::new(),
            dropped: Vec::new(),
            changed: false,
        });
    }

    let covers = |info: &ImageInfo| {
        overlap(
            info.load_addr,
            info.footprint(),
            target.load_addr,
            target.footprint(),
        )
    };

    let (dropped, mut entries): (Vec<ImageInfo>, Vec<ImageInfo>) =
        table.iter().cloned().partition(|info| covers(info));

    let boot_listed = table.iter().any(|info| info.checksum == boot.checksum);
    if !boot_listed && !covers(boot) {
        entries.push(boot.clone());
    }

    let expected = table.len() + usize::from(!boot_listed);
    let changed = entries.len() != expected;
    if changed && entries.len() > IMAGE_TABLE_ENTRIES {
        return Err(DfuError::protocol(format!(
            "image table full: {} entries, the device holds at most {}",
            entries.len(),
            IMAGE_TABLE_ENTRIES
        )));
    }
    Ok(TableUpdate {
        entries,
        dropped,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::{sample_info, unsigned_firmware};
    use crate::state::Flow;

    fn session_with_boot() -> DeviceSession {
        let mut session = DeviceSession::new(Flow::Extended);
        session.set_chip(0x1EA8, 2);
        session.boot_info = Some(sample_info(0x0100_4000, 0x1_0000));
        session
    }

    fn firmware(load_addr: u32, mode: UpdateMode) -> UpdateRequest {
        let info = sample_info(load_addr, 4048);
        UpdateRequest::new(mode, unsigned_firmware(4096, &info)).unwrap()
    }

    #[test]
    fn test_extended_accepts_clear_layout() {
        let session = session_with_boot();
        let req = firmware(0x0104_0000, UpdateMode::Firmware);
        assert!(extended_overlap(&req, &session).is_ok());
    }

    #[test]
    fn test_extended_rejects_target_on_boot_image() {
        let session = session_with_boot();
        let req = firmware(0x0100_8000, UpdateMode::Firmware);
        let msg = extended_overlap(&req, &session).unwrap_err().to_string();
        assert!(msg.starts_with("bootArea("), "{msg}");
        assert!(msg.contains("targetArea(0x01008000-0x01009000)"), "{msg}");
    }

    #[test]
    fn test_extended_copy_checks_running_app() {
        let mut session = session_with_boot();
        session.app_info = Some(sample_info(0x0108_0000, 0x8000));
        let req = firmware(
            0x0104_0000,
            UpdateMode::CopyFirmware {
                copy_address: 0x0108_4000,
            },
        );
        let msg = extended_overlap(&req, &session).unwrap_err().to_string();
        assert!(msg.contains("appArea") && msg.contains("copyArea"), "{msg}");

        session.app_info = None;
        assert!(extended_overlap(&req, &session).is_ok());
    }

    #[test]
    fn test_extended_external_resource_skips_app() {
        let mut session = session_with_boot();
        session.app_info = Some(sample_info(0x0108_0000, 0x8000));
        let data = vec![0x5A; 1000];
        let internal = UpdateRequest::new(
            UpdateMode::Resource {
                address: 0x0108_1000,
                external_flash: false,
            },
            data.clone(),
        )
        .unwrap();
        assert!(extended_overlap(&internal, &session).is_err());

        let external = UpdateRequest::new(
            UpdateMode::Resource {
                address: 0x0108_1000,
                external_flash: true,
            },
            data,
        )
        .unwrap();
        assert!(extended_overlap(&external, &session).is_ok());
    }

    #[test]
    fn test_legacy_resource_checks_image_table() {
        let mut session = session_with_boot();
        session.flow = Flow::Legacy;
        session.image_table = vec![sample_info(0x0106_0000, 0x4000)];
        let req = UpdateRequest::new(
            UpdateMode::Resource {
                address: 0x0106_2000,
                external_flash: false,
            },
            vec![0u8; 256],
        )
        .unwrap();
        let msg = legacy_overlap(&req, &session).unwrap_err().to_string();
        assert!(msg.contains("imageTableArea"), "{msg}");
    }

    #[test]
    fn test_legacy_firmware_ignores_image_table() {
        let mut session = session_with_boot();
        session.flow = Flow::Legacy;
        // The new image replaces this entry; reconciliation handles it.
        session.image_table = vec![sample_info(0x0104_0000, 0x4000)];
        let req = firmware(0x0104_0000, UpdateMode::Firmware);
        assert!(legacy_overlap(&req, &session).is_ok());
    }

    #[test]
    fn test_sca_overlap_is_always_checked() {
        let session = session_with_boot();
        let req = UpdateRequest::new(
            UpdateMode::Resource {
                address: 0x0100_1000,
                external_flash: true,
            },
            vec![0u8; 16],
        )
        .unwrap();
        assert!(extended_overlap(&req, &session).is_err());
        assert!(legacy_overlap(&req, &session).is_err());
    }

    #[test]
    fn test_encryption_must_match() {
        let mut session = session_with_boot();
        let req = firmware(0x0104_0000, UpdateMode::Firmware);
        assert!(check_encryption(&req, &session).is_ok());

        session.peer_encrypted = true;
        let msg = check_encryption(&req, &session).unwrap_err().to_string();
        assert_eq!(
            msg,
            "The new firmware and target device encryption status do not match."
        );
    }

    #[test]
    fn test_reconcile_empty_table_is_untouched() {
        let target = sample_info(0x0104_0000, 4048);
        let boot = sample_info(0x0100_4000, 0x1_0000);
        let update = reconcile_image_table(&target, &boot, &[]).unwrap();
        assert!(!update.changed);
        assert!(update.entries.is_empty());
    }

    #[test]
    fn test_reconcile_drops_covered_entries() {
        let target = sample_info(0x0104_0000, 4048);
        let mut boot = sample_info(0x0100_4000, 0x1_0000);
        boot.checksum = 0xB007;
        let mut old = sample_info(0x0104_0800, 0x1000);
        old.checksum = 0x0AD0;
        let mut other = sample_info(0x0106_0000, 0x1000);
        other.checksum = 0x0111;

        let update = reconcile_image_table(&target, &boot, &[old.clone(), other.clone()]).unwrap();
        assert!(update.changed);
        assert_eq!(update.dropped, vec![old]);
        assert_eq!(update.entries, vec![other.clone(), boot.clone()]);

        // Nothing covered: the boot image is appended but no rewrite needed.
        let update = reconcile_image_table(&target, &boot, &[other.clone()]).unwrap();
        assert!(!update.changed);
        assert_eq!(update.entries, vec![other, boot]);
    }

    #[test]
    fn test_reconcile_rejects_overfull_table() {
        let target = sample_info(0x0110_0000, 0x800);
        let mut boot = sample_info(0x0100_4000, 0x1_0000);
        boot.checksum = 0xB007;
        let table: Vec<ImageInfo> = (0..11u32)
            .map(|i| {
                let mut info = sample_info(0x0110_0000 + i * 0x1_0000, 0x1000);
                info.checksum = i;
                info
            })
            .collect();
        let err = reconcile_image_table(&target, &boot, &table).unwrap_err();
        assert!(err.to_string().contains("image table full: 11 entries"));

        // Unchanged tables are never rewritten, whatever their size.
        let target = sample_info(0x0200_0000, 0x800);
        let update = reconcile_image_table(&target, &boot, &table).unwrap();
        assert!(!update.changed);
    }
}
