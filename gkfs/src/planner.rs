//! Decomposition of a `(path, offset, size)` request into per-host chunk work.
//!
//! Client and daemon both call [`segments_for_target`], so the byte layout of
//! a transfer is derived independently on each side from the same inputs.

use crate::arithmetic::{ChunkId, block_index, block_overrun, is_power_of_2};
use crate::bulk::{BulkError, BulkRegion, Segment};
use crate::distributor::{Distributor, HostId};
use crate::error::FsError;
use std::collections::HashMap;
use thiserror::Error;

/// Most bytes a single host transfers in one data request.
pub const MAX_HOST_TRANSFER: u64 = 1 << 30;

/// Upper bound on the chunks a daemon walks for one request, whatever the
/// cluster size it announces.
pub const MAX_SPAN_CHUNKS: u64 = 1 << 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("empty I/O request")]
    EmptyRange,
    #[error("range at offset {offset} with size {size} exceeds the maximum file offset")]
    Overflow { offset: u64, size: u64 },
    #[error("chunk size {0} is not a power of two")]
    BadChunkSize(u64),
    #[error("chunk range {chunk_start}..={chunk_end} is inverted")]
    InvertedRange { chunk_start: ChunkId, chunk_end: ChunkId },
    #[error("chunk range {chunk_start}..={chunk_end} spans more than {limit} chunks")]
    SpanTooLarge {
        chunk_start: ChunkId,
        chunk_end: ChunkId,
        limit: u64,
    },
    #[error("host {host} derived {derived} bytes for its chunks, request says {expected}")]
    SizeMismatch {
        host: HostId,
        derived: u64,
        expected: u64,
    },
    #[error("host {host} owns {derived} chunks in range, request says {expected}")]
    CountMismatch {
        host: HostId,
        derived: u64,
        expected: u64,
    },
    #[error(transparent)]
    Bulk(#[from] BulkError),
}

impl From<PlanError> for FsError {
    fn from(_: PlanError) -> Self {
        FsError::InvalidArgument
    }
}

/// One chunk's share of a request on a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSegment {
    pub chunk_id: ChunkId,
    /// Offset inside the chunk. Only the globally first chunk starts past 0.
    pub chunk_offset: u64,
    /// Offset in the caller's buffer.
    pub origin_offset: u64,
    /// Offset in the host's contiguous transfer buffer.
    pub local_offset: u64,
    pub len: u64,
}

/// Chunk layout of one host, as sent in its RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlan {
    pub host: HostId,
    pub chunk_ids: Vec<ChunkId>,
    pub total_chunk_size: u64,
}

#[derive(Debug, Clone)]
pub struct IoPlan {
    pub path: String,
    pub offset: u64,
    pub size: u64,
    pub chunk_size: u64,
    pub chunk_start: ChunkId,
    pub chunk_end: ChunkId,
    /// Hosts in the order their first chunk appears.
    pub targets: Vec<TargetPlan>,
}

impl IoPlan {
    pub fn new(
        distributor: &dyn Distributor,
        path: &str,
        offset: u64,
        size: u64,
        chunk_size: u64,
    ) -> Result<Self, PlanError> {
        if !is_power_of_2(chunk_size) {
            return Err(PlanError::BadChunkSize(chunk_size));
        }
        if size == 0 {
            return Err(PlanError::EmptyRange);
        }
        let last_byte = offset
            .checked_add(size - 1)
            .ok_or(PlanError::Overflow { offset, size })?;

        let chunk_start = block_index(offset, chunk_size);
        let chunk_end = block_index(last_byte, chunk_size);

        let mut targets: Vec<TargetPlan> = Vec::new();
        let mut index: HashMap<HostId, usize> = HashMap::new();
        for chunk_id in chunk_start..=chunk_end {
            let host = distributor.locate_data(path, chunk_id);
            let slot = *index.entry(host).or_insert_with(|| {
                targets.push(TargetPlan {
                    host,
                    chunk_ids: Vec::new(),
                    total_chunk_size: 0,
                });
                targets.len() - 1
            });
            targets[slot].chunk_ids.push(chunk_id);
        }

        let lpad = block_overrun(offset, chunk_size);
        let rpad = tail_padding(last_byte, chunk_size);
        let start_host = distributor.locate_data(path, chunk_start);
        let end_host = distributor.locate_data(path, chunk_end);
        for target in &mut targets {
            let mut total = target.chunk_ids.len() as u128 * chunk_size as u128;
            if target.host == start_host {
                total -= lpad as u128;
            }
            if target.host == end_host {
                total -= rpad as u128;
            }
            target.total_chunk_size = total as u64;
        }

        Ok(Self {
            path: path.to_string(),
            offset,
            size,
            chunk_size,
            chunk_start,
            chunk_end,
            targets,
        })
    }

    /// Offset inside the first chunk, sent to every host.
    pub fn lpad(&self) -> u64 {
        block_overrun(self.offset, self.chunk_size)
    }

    pub fn segments(
        &self,
        distributor: &dyn Distributor,
        target: &TargetPlan,
    ) -> Result<Vec<ChunkSegment>, PlanError> {
        segments_for_target(
            distributor,
            &self.path,
            target.host,
            SegmentRequest {
                offset: self.lpad(),
                chunk_start: self.chunk_start,
                chunk_end: self.chunk_end,
                chunk_count: target.chunk_ids.len() as u64,
                total_chunk_size: target.total_chunk_size,
                chunk_size: self.chunk_size,
            },
        )
    }

    /// Typed view of one host's share of a caller buffer of `self.size` bytes.
    pub fn bulk_region(
        &self,
        distributor: &dyn Distributor,
        target: &TargetPlan,
    ) -> Result<BulkRegion, PlanError> {
        let segments = self.segments(distributor, target)?;
        Ok(to_bulk_region(self.size, &segments)?)
    }
}

/// Unused bytes at the end of the last chunk, zero when the range ends on a
/// chunk boundary. This equals `block_underrun(offset + size)` for unaligned
/// ends, but is computed from the last byte so that ranges ending at `2^64`
/// do not overflow.
fn tail_padding(last_byte: u64, chunk_size: u64) -> u64 {
    chunk_size - 1 - block_overrun(last_byte, chunk_size)
}

/// Fields of a chunk I/O request needed to rebuild a host's segments.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRequest {
    pub offset: u64,
    pub chunk_start: ChunkId,
    pub chunk_end: ChunkId,
    pub chunk_count: u64,
    pub total_chunk_size: u64,
    pub chunk_size: u64,
}

/// Chunks a request may span when no host transfers more than
/// [`MAX_HOST_TRANSFER`] bytes.
fn span_limit(hosts_size: u64, chunk_size: u64) -> u64 {
    (MAX_HOST_TRANSFER / chunk_size + 1)
        .saturating_mul(hosts_size)
        .saturating_add(1)
        .min(MAX_SPAN_CHUNKS)
}

/// Derives the segments `host` is responsible for.
///
/// Every chunk but the host's last must be served in full. The last one gets
/// whatever is left of `total_chunk_size`, which must then be exhausted.
pub fn segments_for_target(
    distributor: &dyn Distributor,
    path: &str,
    host: HostId,
    req: SegmentRequest,
) -> Result<Vec<ChunkSegment>, PlanError> {
    if !is_power_of_2(req.chunk_size) {
        return Err(PlanError::BadChunkSize(req.chunk_size));
    }
    if req.chunk_start > req.chunk_end {
        return Err(PlanError::InvertedRange {
            chunk_start: req.chunk_start,
            chunk_end: req.chunk_end,
        });
    }
    let limit = span_limit(distributor.hosts_size(), req.chunk_size);
    if req.chunk_end - req.chunk_start >= limit || req.total_chunk_size > MAX_HOST_TRANSFER {
        return Err(PlanError::SpanTooLarge {
            chunk_start: req.chunk_start,
            chunk_end: req.chunk_end,
            limit,
        });
    }
    let lpad = req.offset;
    if lpad >= req.chunk_size {
        return Err(PlanError::SizeMismatch {
            host,
            derived: lpad,
            expected: req.chunk_size,
        });
    }

    let owned: Vec<ChunkId> = (req.chunk_start..=req.chunk_end)
        .filter(|chunk_id| distributor.locate_data(path, *chunk_id) == host)
        .collect();
    if owned.len() as u64 != req.chunk_count {
        return Err(PlanError::CountMismatch {
            host,
            derived: owned.len() as u64,
            expected: req.chunk_count,
        });
    }

    let mut segments = Vec::with_capacity(owned.len());
    let mut remaining = req.total_chunk_size;
    let mut local_offset = 0u64;
    for (idx, chunk_id) in owned.iter().copied().enumerate() {
        let is_last = idx + 1 == owned.len();
        let (chunk_offset, origin_offset) = if chunk_id == req.chunk_start {
            (lpad, 0)
        } else {
            let skipped = (chunk_id - req.chunk_start - 1) as u128 * req.chunk_size as u128;
            (0, (req.chunk_size - lpad) as u128 + skipped)
        };
        let full = req.chunk_size - chunk_offset;
        let len = if is_last { remaining } else { full };
        if len == 0 || len > full || len > remaining {
            return Err(PlanError::SizeMismatch {
                host,
                derived: req.total_chunk_size - remaining + len,
                expected: req.total_chunk_size,
            });
        }
        // only the very last chunk of the request may be cut short
        if len < full && chunk_id != req.chunk_end {
            return Err(PlanError::SizeMismatch {
                host,
                derived: req.total_chunk_size,
                expected: req.total_chunk_size - len + full,
            });
        }
        segments.push(ChunkSegment {
            chunk_id,
            chunk_offset,
            origin_offset: u64::try_from(origin_offset).map_err(|_| PlanError::Overflow {
                offset: req.offset,
                size: req.total_chunk_size,
            })?,
            local_offset,
            len,
        });
        local_offset += len;
        remaining -= len;
    }

    if remaining != 0 {
        return Err(PlanError::SizeMismatch {
            host,
            derived: req.total_chunk_size - remaining,
            expected: req.total_chunk_size,
        });
    }
    Ok(segments)
}

pub fn to_bulk_region(origin_len: u64, segments: &[ChunkSegment]) -> Result<BulkRegion, BulkError> {
    BulkRegion::new(
        origin_len,
        segments
            .iter()
            .map(|s| Segment {
                origin_offset: s.origin_offset,
                local_offset: s.local_offset,
                len: s.len,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::{ForwarderDistributor, LocalOnlyDistributor, SimpleHashDistributor};

    const CHUNK_SIZE: u64 = 65536;

    fn check_invariants(distributor: &dyn Distributor, plan: &IoPlan) {
        let total: u64 = plan.targets.iter().map(|t| t.total_chunk_size).sum();
        assert_eq!(total, plan.size, "plan = {:?}", plan);

        // every byte of the caller buffer is covered exactly once
        let mut covered = vec![0u8; plan.size as usize];
        for target in &plan.targets {
            let segments = plan.segments(distributor, target).unwrap();
            let sum: u64 = segments.iter().map(|s| s.len).sum();
            assert_eq!(sum, target.total_chunk_size);
            for s in &segments {
                assert!(s.chunk_offset + s.len <= plan.chunk_size);
                let file_offset = s.chunk_id * plan.chunk_size + s.chunk_offset;
                assert_eq!(file_offset - plan.offset, s.origin_offset);
                for b in &mut covered[s.origin_offset as usize..(s.origin_offset + s.len) as usize]
                {
                    *b += 1;
                }
            }
            assert_eq!(
                plan.bulk_region(distributor, target).unwrap().local_len(),
                target.total_chunk_size
            );
        }
        assert!(covered.iter().all(|c| *c == 1));
    }

    #[test]
    fn test_single_full_chunk() {
        let distributor = SimpleHashDistributor::new(0, 3);
        let plan = IoPlan::new(&distributor, "/file", 0, CHUNK_SIZE, CHUNK_SIZE).unwrap();
        assert_eq!(plan.chunk_start, 0);
        assert_eq!(plan.chunk_end, 0);
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].chunk_ids, vec![0]);
        assert_eq!(plan.targets[0].total_chunk_size, CHUNK_SIZE);
        check_invariants(&distributor, &plan);
    }

    #[test]
    fn test_leading_offset_spans_two_chunks() {
        let distributor = SimpleHashDistributor::new(0, 3);
        let plan = IoPlan::new(&distributor, "/file", 100, CHUNK_SIZE, CHUNK_SIZE).unwrap();
        assert_eq!((plan.chunk_start, plan.chunk_end), (0, 1));
        assert_eq!(plan.lpad(), 100);

        let owner0 = distributor.locate_data("/file", 0);
        let owner1 = distributor.locate_data("/file", 1);
        let total_of = |host| {
            plan.targets
                .iter()
                .find(|t| t.host == host)
                .unwrap()
                .total_chunk_size
        };
        if owner0 == owner1 {
            assert_eq!(plan.targets.len(), 1);
            assert_eq!(total_of(owner0), CHUNK_SIZE);
        } else {
            assert_eq!(total_of(owner0), CHUNK_SIZE - 100);
            assert_eq!(total_of(owner1), 100);
        }
        check_invariants(&distributor, &plan);
    }

    #[test]
    fn test_partial_last_chunk() {
        let distributor = SimpleHashDistributor::new(0, 3);
        let plan = IoPlan::new(&distributor, "/file", 0, 200000, CHUNK_SIZE).unwrap();
        assert_eq!((plan.chunk_start, plan.chunk_end), (0, 3));
        let chunks: usize = plan.targets.iter().map(|t| t.chunk_ids.len()).sum();
        assert_eq!(chunks, 4);

        let last = plan
            .targets
            .iter()
            .flat_map(|t| plan.segments(&distributor, t).unwrap())
            .find(|s| s.chunk_id == 3)
            .unwrap();
        assert_eq!(last.len, 200000 - 3 * CHUNK_SIZE);
        assert_eq!(last.len, 3392);
        check_invariants(&distributor, &plan);
    }

    #[test]
    fn test_request_inside_one_chunk() {
        let distributor = LocalOnlyDistributor::new(0);
        let plan = IoPlan::new(&distributor, "/f", 70000, 10, CHUNK_SIZE).unwrap();
        assert_eq!((plan.chunk_start, plan.chunk_end), (1, 1));
        let segments = plan.segments(&distributor, &plan.targets[0]).unwrap();
        assert_eq!(
            segments,
            vec![ChunkSegment {
                chunk_id: 1,
                chunk_offset: 70000 - CHUNK_SIZE,
                origin_offset: 0,
                local_offset: 0,
                len: 10,
            }]
        );
    }

    #[test]
    fn test_sum_invariant_across_layouts() {
        let offsets = [0, 1, 100, CHUNK_SIZE - 1, CHUNK_SIZE, 3 * CHUNK_SIZE + 17];
        let sizes = [1, 10, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 150000, 200000, 5 * CHUNK_SIZE];
        for hosts in 1..=5 {
            let distributor = SimpleHashDistributor::new(0, hosts);
            for &offset in &offsets {
                for &size in &sizes {
                    let plan =
                        IoPlan::new(&distributor, "/sum/invariant", offset, size, CHUNK_SIZE)
                            .unwrap();
                    check_invariants(&distributor, &plan);
                }
            }
        }
    }

    #[test]
    fn test_range_ending_at_u64_max() {
        let distributor = ForwarderDistributor::new(0, 2);
        let offset = u64::MAX - 99;
        let plan = IoPlan::new(&distributor, "/end", offset, 100, CHUNK_SIZE).unwrap();
        assert_eq!(plan.targets[0].total_chunk_size, 100);
        assert_eq!(plan.chunk_end, u64::MAX / CHUNK_SIZE);

        assert_eq!(
            IoPlan::new(&distributor, "/end", offset, 101, CHUNK_SIZE).unwrap_err(),
            PlanError::Overflow { offset, size: 101 }
        );
    }

    #[test]
    fn test_rejects_empty_and_bad_chunk_size() {
        let distributor = LocalOnlyDistributor::new(0);
        assert_eq!(
            IoPlan::new(&distributor, "/f", 0, 0, CHUNK_SIZE).unwrap_err(),
            PlanError::EmptyRange
        );
        assert_eq!(
            IoPlan::new(&distributor, "/f", 0, 10, 1000).unwrap_err(),
            PlanError::BadChunkSize(1000)
        );
    }

    #[test]
    fn test_daemon_rejects_inconsistent_request() {
        let distributor = LocalOnlyDistributor::new(0);
        let good = SegmentRequest {
            offset: 100,
            chunk_start: 0,
            chunk_end: 1,
            chunk_count: 2,
            total_chunk_size: CHUNK_SIZE,
            chunk_size: CHUNK_SIZE,
        };
        assert!(segments_for_target(&distributor, "/f", 0, good).is_ok());

        let too_small = SegmentRequest {
            total_chunk_size: 1000,
            ..good
        };
        assert!(segments_for_target(&distributor, "/f", 0, too_small).is_err());

        let too_large = SegmentRequest {
            total_chunk_size: 2 * CHUNK_SIZE,
            ..good
        };
        assert!(segments_for_target(&distributor, "/f", 0, too_large).is_err());

        let wrong_count = SegmentRequest {
            chunk_count: 3,
            ..good
        };
        assert!(matches!(
            segments_for_target(&distributor, "/f", 0, wrong_count),
            Err(PlanError::CountMismatch { .. })
        ));

        let inverted = SegmentRequest {
            chunk_start: 2,
            ..good
        };
        assert!(segments_for_target(&distributor, "/f", 0, inverted).is_err());
    }

    #[test]
    fn test_daemon_rejects_oversized_span() {
        let distributor = LocalOnlyDistributor::new(0);
        let endless = SegmentRequest {
            offset: 0,
            chunk_start: 0,
            chunk_end: u64::MAX,
            chunk_count: 1,
            total_chunk_size: 1,
            chunk_size: CHUNK_SIZE,
        };
        assert!(matches!(
            segments_for_target(&distributor, "/f", 0, endless),
            Err(PlanError::SpanTooLarge { .. })
        ));

        let oversized = SegmentRequest {
            chunk_end: 0,
            total_chunk_size: MAX_HOST_TRANSFER + 1,
            ..endless
        };
        assert!(matches!(
            segments_for_target(&distributor, "/f", 0, oversized),
            Err(PlanError::SpanTooLarge { .. })
        ));

        assert_eq!(span_limit(1, CHUNK_SIZE), MAX_HOST_TRANSFER / CHUNK_SIZE + 2);
        assert_eq!(span_limit(u64::MAX, CHUNK_SIZE), MAX_SPAN_CHUNKS);

        // a full transfer buffer on one host still plans
        let chunks = MAX_HOST_TRANSFER / CHUNK_SIZE;
        let full = SegmentRequest {
            chunk_end: chunks - 1,
            chunk_count: chunks,
            total_chunk_size: MAX_HOST_TRANSFER,
            ..endless
        };
        let segments = segments_for_target(&distributor, "/f", 0, full).unwrap();
        assert_eq!(segments.len() as u64, chunks);
    }
}
