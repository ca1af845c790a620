//! Flash area bookkeeping and overlap checks.

use std::fmt;

use crate::error::{DfuError, Result};

/// Half-open interval test on `[start, start + size)`.
///
/// Sums are widened to 64 bits; callers still guarantee that real flash
/// ranges do not wrap the 32-bit address space.
pub fn overlap(a_start: u32, a_size: u32, b_start: u32, b_size: u32) -> bool {
    let a_end = u64::from(a_start) + u64::from(a_size);
    let b_end = u64::from(b_start) + u64::from(b_size);
    a_end > u64::from(b_start) && u64::from(a_start) < b_end
}

/// A named flash region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryArea {
    pub label: String,
    pub start: u32,
    pub size: u32,
}

impl MemoryArea {
    pub fn new(label: impl Into<String>, start: u32, size: u32) -> Self {
        Self {
            label: label.into(),
            start,
            size,
        }
    }

    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.size)
    }

    pub fn overlaps(&self, other: &MemoryArea) -> bool {
        overlap(self.start, self.size, other.start, other.size)
    }

    /// Fail with a protocol error naming both areas when they intersect.
    pub fn check_no_overlap(&self, other: &MemoryArea) -> Result<()> {
        if self.overlaps(other) {
            return Err(DfuError::protocol(format!(
                "{} and {} overlap",
                self, other
            )));
        }
        Ok(())
    }
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:08X}-0x{:08X})",
            self.label,
            self.start,
            self.end()
        )
    }
}

/// Run every check in order, stopping at the first intersection.
pub fn check_all<'a, I>(pairs: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a MemoryArea, &'a MemoryArea)>,
{
    for (a, b) in pairs {
        a.check_no_overlap(b)?;
    }
    Ok(())
}
