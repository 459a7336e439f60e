//! Genomic regions and record classification against them.

use crate::errors::{BamlineError, Result};
use crate::header::RefSeq;
use crate::record::Record;

/// A zero-based half-open genomic interval on one reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    /// Reference sequence id.
    pub ref_id: i32,
    /// Zero-based inclusive start.
    pub begin: i32,
    /// Zero-based exclusive end.
    pub end: i32,
}

impl Region {
    /// Create a region.
    #[must_use]
    pub const fn new(ref_id: i32, begin: i32, end: i32) -> Self {
        Self { ref_id, begin, end }
    }

    /// Validate the region against a reference directory.
    pub fn validate(&self, refs: &[RefSeq]) -> Result<()> {
        if self.ref_id < 0 || self.ref_id as usize >= refs.len() {
            return Err(BamlineError::index(format!(
                "region reference {} out of range (have {} references)",
                self.ref_id,
                refs.len()
            )));
        }
        let ref_len = refs[self.ref_id as usize].len as i32;
        if self.begin < 0 || self.begin >= self.end || self.begin > ref_len {
            return Err(BamlineError::index(format!(
                "invalid region interval [{}, {}) on reference of length {ref_len}",
                self.begin, self.end
            )));
        }
        Ok(())
    }
}

/// Where a record falls relative to a region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionState {
    /// The record ends left of the region; keep scanning.
    BeforeRegion,
    /// The record overlaps the region; emit it.
    OverlapsRegion,
    /// The record starts right of the region; the scan is done.
    AfterRegion,
}

impl Region {
    /// Classify a record against this region.
    ///
    /// Unmapped records and records on earlier references sort before the
    /// region; records on later references sort after it. Within the
    /// reference, overlap means `position < end` and
    /// `position + reference_span > begin`.
    #[must_use]
    pub fn classify(&self, record: &Record) -> RegionState {
        if record.ref_id() < 0 || record.ref_id() < self.ref_id {
            return RegionState::BeforeRegion;
        }
        if record.ref_id() > self.ref_id {
            return RegionState::AfterRegion;
        }
        if record.position() >= self.end {
            return RegionState::AfterRegion;
        }
        if record.alignment_end() > self.begin {
            RegionState::OverlapsRegion
        } else {
            RegionState::BeforeRegion
        }
    }
}
