// src/utils.rs
// Block sampling helpers

/// Blocks produced in `window_secs` at one block every `block_time_secs`.
pub fn blocks_in_window(window_secs: u64, block_time_secs: u64) -> u64 {
    window_secs / block_time_secs.max(1)
}

/// `points` block numbers evenly spaced over the last `window_secs`, ending at `head`.
///
/// Ascending and deduplicated; never goes below block 0, so a young chain yields fewer points.
pub fn sample_blocks(head: u64, window_secs: u64, block_time_secs: u64, points: usize) -> Vec<u64> {
    if points == 0 {
        return Vec::new();
    }
    if points == 1 {
        return vec![head];
    }
    let span = blocks_in_window(window_secs, block_time_secs);
    let step = (span / (points as u64 - 1)).max(1);
    let mut blocks: Vec<u64> = (0..points as u64)
        .rev()
        .filter_map(|k| head.checked_sub(k * step))
        .collect();
    blocks.dedup();
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_end_at_head() {
        // one day of 12s blocks, 5 points
        let blocks = sample_blocks(1_000_000, 86_400, 12, 5);
        assert_eq!(blocks, vec![992_800, 994_600, 996_400, 998_200, 1_000_000]);
    }

    #[test]
    fn young_chain_yields_fewer_points() {
        let blocks = sample_blocks(10, 86_400, 12, 5);
        assert_eq!(blocks, vec![10]);
        assert_eq!(sample_blocks(5, 60, 12, 10), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn degenerate_inputs() {
        assert!(sample_blocks(100, 60, 12, 0).is_empty());
        assert_eq!(sample_blocks(100, 60, 12, 1), vec![100]);
        assert_eq!(blocks_in_window(60, 0), 60);
    }
}
