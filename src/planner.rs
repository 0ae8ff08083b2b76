// src/planner.rs

use crate::models::ChunkDescriptor;

/// Splits a file of `total_size` bytes into an ordered, contiguous,
/// non-overlapping chunk layout. Every chunk is `chunk_size` bytes except
/// the last, which holds the remainder.
///
/// Zero inputs are a programmer error and panic.
pub fn plan_chunks(total_size: u64, chunk_size: u32) -> Vec<ChunkDescriptor> {
    assert!(total_size > 0, "cannot plan chunks for an empty file");
    assert!(chunk_size > 0, "chunk size must be positive");

    let chunk = chunk_size as u64;
    let count = total_size.div_ceil(chunk) as usize;
    (0..count)
        .map(|index| {
            let offset = index as u64 * chunk;
            let length = (total_size - offset).min(chunk) as u32;
            ChunkDescriptor {
                index,
                offset,
                length,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_sum_to_total_and_only_last_differs() {
        for (total, chunk) in [(1u64, 256u32), (255, 256), (256, 256), (257, 256), (10_000, 300)]
        {
            let plan = plan_chunks(total, chunk);
            assert_eq!(plan.len() as u64, total.div_ceil(chunk as u64));
            let sum: u64 = plan.iter().map(|c| c.length as u64).sum();
            assert_eq!(sum, total);
            for c in &plan[..plan.len() - 1] {
                assert_eq!(c.length, chunk);
            }
            for pair in plan.windows(2) {
                assert_eq!(pair[0].offset + pair[0].length as u64, pair[1].offset);
            }
        }
    }

    #[test]
    fn ten_mib_file_with_256_kib_chunks_yields_forty() {
        let plan = plan_chunks(10 * 1024 * 1024, 256 * 1024);
        assert_eq!(plan.len(), 40);
        assert_eq!(plan[39].offset, 39 * 256 * 1024);
        assert_eq!(plan[39].length, 256 * 1024);
    }

    #[test]
    fn exact_multiple_has_full_final_chunk() {
        let plan = plan_chunks(1024, 256);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[3].length, 256);
    }

    #[test]
    #[should_panic]
    fn zero_total_size_panics() {
        plan_chunks(0, 256);
    }

    #[test]
    #[should_panic]
    fn zero_chunk_size_panics() {
        plan_chunks(1024, 0);
    }
}
