//! Offset/length arithmetic over power-of-two block sizes.
//!
//! Every function here works on `u64` offsets and must stay correct for
//! offsets up to `u64::MAX`. Block sizes are required to be powers of two so
//! that alignment can be computed with masks.

pub type ChunkId = u64;

pub fn is_power_of_2(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

pub fn is_aligned(offset: u64, block_size: u64) -> bool {
    debug_assert!(is_power_of_2(block_size));
    offset & (block_size - 1) == 0
}

/// Largest multiple of `block_size` that is `<= offset`.
pub fn align_left(offset: u64, block_size: u64) -> u64 {
    debug_assert!(is_power_of_2(block_size));
    offset & !(block_size - 1)
}

/// Right boundary of the block containing `offset`.
///
/// This is always `align_left(offset) + block_size`, also when `offset` is
/// already aligned. Overflows for offsets inside the last block of the `u64`
/// range.
pub fn align_right(offset: u64, block_size: u64) -> u64 {
    align_left(offset, block_size) + block_size
}

/// Distance from the left block boundary. Zero when aligned.
pub fn block_overrun(offset: u64, block_size: u64) -> u64 {
    debug_assert!(is_power_of_2(block_size));
    offset & (block_size - 1)
}

/// Distance to the next block boundary. Equals `block_size` when aligned.
pub fn block_underrun(offset: u64, block_size: u64) -> u64 {
    block_size - block_overrun(offset, block_size)
}

pub fn block_index(offset: u64, block_size: u64) -> ChunkId {
    debug_assert!(is_power_of_2(block_size));
    offset >> block_size.trailing_zeros()
}

/// Number of blocks touched by `[offset, offset + size)`.
pub fn block_count(offset: u64, size: u64, block_size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    // last byte of the range; ranges ending past u64::MAX are clamped
    let last = offset.saturating_add(size - 1);
    block_index(last, block_size) - block_index(offset, block_size) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZES: &[u64] = &[1, 2, 4, 512, 4096, 65536, 524288, 1 << 20, 1 << 32];

    fn sample_offsets(bs: u64) -> Vec<u64> {
        let mut offsets = vec![0, 1, bs - 1, bs, bs + 1, 2 * bs - 1, 2 * bs, 7 * bs + 3];
        offsets.extend([1 << 63, (1 << 63) - 1, u64::MAX - bs, u64::MAX - 1, u64::MAX]);
        offsets
    }

    fn expected_count(offset: u64, size: u64, bs: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let end = offset as u128 + size as u128;
        (end.div_ceil(bs as u128) - (offset as u128 / bs as u128)) as u64
    }

    #[test]
    fn test_is_power_of_2() {
        assert!(!is_power_of_2(0));
        for shift in 0..64 {
            assert!(is_power_of_2(1u64 << shift));
        }
        for n in [3u64, 5, 6, 7, 12, 1000, 65535, 65537, u64::MAX] {
            let mut m = n;
            while m > 1 && m % 2 == 0 {
                m /= 2;
            }
            assert_eq!(is_power_of_2(n), m == 1, "n = {}", n);
        }
    }

    #[test]
    fn test_alignment() {
        for &bs in BLOCK_SIZES {
            assert_eq!(align_left(0, bs), 0);
            for offset in sample_offsets(bs) {
                assert_eq!(is_aligned(offset, bs), offset % bs == 0);
                assert_eq!(align_left(offset, bs), (offset / bs) * bs);
                if offset < bs {
                    assert_eq!(align_left(offset, bs), 0);
                }
                if offset <= u64::MAX - bs {
                    assert_eq!(align_right(offset, bs), align_left(offset, bs) + bs);
                    assert!(align_right(offset, bs) > offset);
                }
            }
        }
    }

    #[test]
    fn test_align_right_on_boundary() {
        assert_eq!(align_right(0, 4096), 4096);
        assert_eq!(align_right(4096, 4096), 8192);
        assert_eq!(align_right(4095, 4096), 4096);
    }

    #[test]
    fn test_overrun_and_underrun() {
        for &bs in BLOCK_SIZES {
            for offset in sample_offsets(bs) {
                let overrun = block_overrun(offset, bs);
                let underrun = block_underrun(offset, bs);
                assert_eq!(overrun, offset - align_left(offset, bs));
                assert_eq!(overrun == 0, is_aligned(offset, bs));
                assert_eq!(overrun + underrun, bs);
                if is_aligned(offset, bs) {
                    assert_eq!(underrun, bs);
                }
                if offset <= u64::MAX - bs {
                    assert_eq!(underrun, align_right(offset, bs) - offset);
                }
            }
        }
    }

    #[test]
    fn test_block_index_near_u64_max() {
        for &bs in BLOCK_SIZES {
            for offset in [0, bs - 1, bs, 1 << 63, u64::MAX] {
                assert_eq!(block_index(offset, bs), offset / bs);
            }
        }
        assert_eq!(block_index(u64::MAX, 1), u64::MAX);
        assert_eq!(block_index(1 << 63, 1 << 20), 1 << 43);
    }

    #[test]
    fn test_block_count_edges() {
        let bs = 65536;
        assert_eq!(block_count(0, 0, bs), 0);
        assert_eq!(block_count(12345, 0, bs), 0);
        assert_eq!(block_count(0, 1, bs), 1);
        assert_eq!(block_count(0, bs, bs), 1);
        assert_eq!(block_count(bs - 1, 1, bs), 1);
        assert_eq!(block_count(bs - 1, 2, bs), 2);
        assert_eq!(block_count(100, bs, bs), 2);
        assert_eq!(block_count(0, 3 * bs, bs), 3);
        assert_eq!(block_count(1, 3 * bs - 1, bs), 3);
        assert_eq!(block_count(bs, 2 * bs, bs), 2);
        assert_eq!(block_count(0, 200000, bs), 4);
        assert_eq!(block_count(u64::MAX - 1, 1, bs), 1);
        assert_eq!(block_count(u64::MAX - bs, bs, bs), 2);
        assert_eq!(block_count(u64::MAX - bs + 1, bs - 1, bs), 1);
    }

    #[test]
    fn test_block_count_matches_reference() {
        for &bs in BLOCK_SIZES {
            for offset in sample_offsets(bs) {
                for size in [0, 1, bs - 1, bs, bs + 1, 3 * bs, 5 * bs + 7] {
                    if offset as u128 + size as u128 > u64::MAX as u128 {
                        continue;
                    }
                    assert_eq!(
                        block_count(offset, size, bs),
                        expected_count(offset, size, bs),
                        "offset = {}, size = {}, bs = {}",
                        offset,
                        size,
                        bs
                    );
                }
            }
        }
    }
}
