//! Segment sizing rule
//!
//! Splits a splitfile's block lists into segments. Inserter and fetcher use
//! the same rule, so a fetcher can recover segment boundaries from the
//! limits recorded in the metadata.

use std::ops::Range;

use super::codec::{CodecKind, CodecShape};
use crate::error::{Error, Result};

/// Per-segment limits a splitfile was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLimits {
    pub codec: CodecKind,
    pub data_blocks: usize,
    pub check_blocks: usize,
}

impl SegmentLimits {
    /// Check blocks assigned to a segment holding `data` data blocks.
    ///
    /// A full segment gets the full complement; a short one gets the same
    /// ratio rounded up.
    pub fn check_blocks_for(&self, data: usize) -> usize {
        match self.codec {
            CodecKind::NonRedundant => 0,
            CodecKind::ReedSolomon if data >= self.data_blocks => self.check_blocks,
            CodecKind::ReedSolomon => (data * self.check_blocks).div_ceil(self.data_blocks),
        }
    }
}

/// Block ranges and shape of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpan {
    pub index: usize,
    pub shape: CodecShape,
    /// Range into the splitfile's data block list
    pub data: Range<usize>,
    /// Range into the splitfile's check block list
    pub check: Range<usize>,
}

/// All segments of one splitfile, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    segments: Vec<SegmentSpan>,
}

impl SegmentLayout {
    /// Lay out `total_data` data blocks.
    ///
    /// The non-redundant codec is never segmented.
    pub fn compute(total_data: usize, limits: SegmentLimits) -> Result<Self> {
        if total_data == 0 {
            return Err(Error::InvalidFecConfig(
                "a splitfile needs at least one data block".to_string(),
            ));
        }
        if limits.data_blocks == 0 {
            return Err(Error::InvalidFecConfig(
                "segment data block limit must be greater than 0".to_string(),
            ));
        }

        if limits.codec == CodecKind::NonRedundant {
            return Ok(Self {
                segments: vec![SegmentSpan {
                    index: 0,
                    shape: CodecShape::non_redundant(total_data)?,
                    data: 0..total_data,
                    check: 0..0,
                }],
            });
        }

        let mut segments = Vec::with_capacity(total_data.div_ceil(limits.data_blocks));
        let mut data_start = 0;
        let mut check_start = 0;
        while data_start < total_data {
            let data = limits.data_blocks.min(total_data - data_start);
            let check = limits.check_blocks_for(data);
            segments.push(SegmentSpan {
                index: segments.len(),
                shape: CodecShape::new(limits.codec, data, check)?,
                data: data_start..data_start + data,
                check: check_start..check_start + check,
            });
            data_start += data;
            check_start += check;
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[SegmentSpan] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_check_blocks(&self) -> usize {
        self.segments.last().map_or(0, |s| s.check.end)
    }

    pub fn total_data_blocks(&self) -> usize {
        self.segments.last().map_or(0, |s| s.data.end)
    }
}
