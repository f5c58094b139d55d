//! Typed views for moving one node's share of a request between the caller's
//! buffer and a contiguous transfer buffer.
//!
//! The client gathers a node's segments into one buffer before sending a
//! write, and scatters a read response back the same way. Every range is
//! checked against the buffer lengths when the region is built.

use crate::error::FsError;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BulkError {
    #[error("segment [{offset}, {offset}+{len}) exceeds origin buffer of {origin_len} bytes")]
    OriginOutOfBounds {
        offset: u64,
        len: u64,
        origin_len: u64,
    },
    #[error("segment at local offset {actual} does not follow previous segment ending at {expected}")]
    NotContiguous { expected: u64, actual: u64 },
    #[error("transfer buffer has {actual} bytes, region expects {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

impl From<BulkError> for FsError {
    fn from(_: BulkError) -> Self {
        FsError::InvalidArgument
    }
}

/// `len` bytes at `origin_offset` of the caller buffer, stored at
/// `local_offset` of the transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub origin_offset: u64,
    pub local_offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct BulkRegion {
    origin_len: u64,
    local_len: u64,
    segments: Vec<Segment>,
}

impl BulkRegion {
    /// Segments must be laid out back to back in the transfer buffer, starting
    /// at local offset 0.
    pub fn new(origin_len: u64, segments: Vec<Segment>) -> Result<Self, BulkError> {
        let mut local_len = 0u64;
        for segment in &segments {
            if segment.local_offset != local_len {
                return Err(BulkError::NotContiguous {
                    expected: local_len,
                    actual: segment.local_offset,
                });
            }
            let in_bounds = segment
                .origin_offset
                .checked_add(segment.len)
                .is_some_and(|end| end <= origin_len);
            if !in_bounds {
                return Err(BulkError::OriginOutOfBounds {
                    offset: segment.origin_offset,
                    len: segment.len,
                    origin_len,
                });
            }
            local_len += segment.len;
        }
        Ok(Self {
            origin_len,
            local_len,
            segments,
        })
    }

    pub fn local_len(&self) -> u64 {
        self.local_len
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn check_origin(&self, origin_len: usize) -> Result<(), BulkError> {
        if origin_len as u64 != self.origin_len {
            return Err(BulkError::LengthMismatch {
                expected: self.origin_len,
                actual: origin_len as u64,
            });
        }
        Ok(())
    }

    fn check_local(&self, local_len: usize) -> Result<(), BulkError> {
        if local_len as u64 != self.local_len {
            return Err(BulkError::LengthMismatch {
                expected: self.local_len,
                actual: local_len as u64,
            });
        }
        Ok(())
    }

    /// Pulls the region out of `origin` into a new contiguous buffer.
    pub fn gather(&self, origin: &[u8]) -> Result<Vec<u8>, BulkError> {
        self.check_origin(origin.len())?;
        let mut local = Vec::with_capacity(self.local_len as usize);
        for segment in &self.segments {
            let start = segment.origin_offset as usize;
            local.extend_from_slice(&origin[start..start + segment.len as usize]);
        }
        Ok(local)
    }

    /// Pushes a contiguous buffer back into `origin`.
    pub fn scatter(&self, local: &[u8], origin: &mut [u8]) -> Result<(), BulkError> {
        self.check_origin(origin.len())?;
        self.check_local(local.len())?;
        for segment in &self.segments {
            let src = segment.local_offset as usize;
            let dst = segment.origin_offset as usize;
            let len = segment.len as usize;
            origin[dst..dst + len].copy_from_slice(&local[src..src + len]);
        }
        Ok(())
    }

    /// Splits a received transfer buffer into one zero-copy slice per segment.
    pub fn split(&self, local: &Bytes) -> Result<Vec<Bytes>, BulkError> {
        self.check_local(local.len())?;
        Ok(self
            .segments
            .iter()
            .map(|s| local.slice(s.local_offset as usize..(s.local_offset + s.len) as usize))
            .collect())
    }
}
