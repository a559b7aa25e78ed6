//! Launch geometry.
//!
//! Grid/block sizing for the named kernels. Elementwise kernels cover every
//! element with a bounded block width; row kernels use one block per row.

/// Grid, block and shared-memory sizing for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    /// Total number of blocks in the grid.
    pub fn blocks(&self) -> usize {
        self.grid_dim.0 as usize * self.grid_dim.1 as usize * self.grid_dim.2 as usize
    }

    /// Threads per block.
    pub fn block_threads(&self) -> usize {
        self.block_dim.0 as usize * self.block_dim.1 as usize * self.block_dim.2 as usize
    }

    /// Total number of threads launched.
    pub fn threads(&self) -> usize {
        self.blocks() * self.block_threads()
    }
}

/// Compute 1D launch dimensions covering `n` elements with at most
/// `max_block` threads per block.
///
/// Lengths shorter than `max_block` get a single block of exactly `n`
/// threads. Callers skip the launch entirely when `n == 0`.
pub fn grid_1d(n: usize, max_block: usize) -> LaunchConfig {
    let block = n.min(max_block).max(1);
    let grid = (n + block - 1) / block;
    LaunchConfig {
        grid_dim: (grid.max(1) as u32, 1, 1),
        block_dim: (block as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// One block per row with `block` threads and `f32` shared scratch per thread.
pub fn grid_rows(rows: usize, block: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (rows as u32, 1, 1),
        block_dim: (block as u32, 1, 1),
        shared_mem_bytes: (block * 4) as u32,
    }
}

/// Block width for a row reduction over `cols` columns: the smallest power of
/// two covering `cols`, capped at `width`.
pub fn reduction_block(cols: usize, width: usize) -> usize {
    cols.max(1).next_power_of_two().min(width)
}

/// Whether repeated-operand kernels can index with a mask instead of `%`.
pub fn is_power_of_two(n: usize) -> bool {
    n.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_grid_1d_short_vector() {
        let cfg = grid_1d(5, 128);
        assert_eq!(cfg.grid_dim, (1, 1, 1));
        assert_eq!(cfg.block_dim, (5, 1, 1));
    }

    #[test]
    fn test_grid_1d_rounds_up() {
        let cfg = grid_1d(300, 128);
        assert_eq!(cfg.grid_dim.0, 3);
        assert_eq!(cfg.block_dim.0, 128);
        assert!(cfg.threads() >= 300);
    }

    #[test]
    fn test_grid_1d_exact_multiple() {
        let cfg = grid_1d(256, 128);
        assert_eq!(cfg.grid_dim.0, 2);
        assert_eq!(cfg.threads(), 256);
    }

    #[test]
    fn test_reduction_block() {
        assert_eq!(reduction_block(3, 256), 4);
        assert_eq!(reduction_block(256, 256), 256);
        assert_eq!(reduction_block(1000, 256), 256);
        assert_eq!(reduction_block(0, 256), 1);
    }

    #[test]
    fn test_power_of_two() {
        for p in 0..20 {
            assert!(is_power_of_two(1 << p));
        }
        for n in [0usize, 3, 5, 6, 7, 12, 100, 1023] {
            assert!(!is_power_of_two(n), "{n}");
        }
    }

    proptest! {
        #[test]
        fn prop_grid_1d_covers_without_extra_block(n in 1usize..1_000_000, block in 1usize..1025) {
            let cfg = grid_1d(n, block);
            prop_assert!(cfg.threads() >= n);
            prop_assert!(cfg.threads() - n < cfg.block_threads());
            prop_assert!(cfg.block_threads() <= block);
        }
    }
}
