//! Engine-wide tunables.
//!
//! Everything spec.md leaves implementation-defined (tile size, the
//! pool's soft byte cap, page-lock opt-in, the async-fsync worker
//! count, the large-array soft-open limit) lives here as a plain
//! struct with a `Default` impl, matching the teacher crate's
//! `Config`/`BufferPoolConfig` shape. There is no file-based config
//! parser: construct a `StoreConfig` directly in Rust.

use std::sync::Arc;

use crate::common::{default_tile_size, DEFAULT_LARGE_FILE_SOFT_LIMIT};
use crate::sabotage::Sabotage;

/// Environment variable read by [`StoreConfig::default`] to arm the
/// deterministic fault injector (spec.md §6): `countdown:errno`.
pub const SABOTAGE_ENV_VAR: &str = "GDB_STORE_SABOTAGE";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Size of one tile, in bytes. Must be a multiple of the OS page
    /// size; defaults to 16 pages.
    pub tile_size: usize,
    /// Soft cap on bytes mapped by the process-wide tile pool.
    pub pool_max_bytes: u64,
    /// Whether newly materialized tiles should be `mlock`'d.
    pub lock_pages: bool,
    /// Number of threads in the shared async-fsync worker pool.
    /// `None` defaults to the host's CPU count.
    pub fsync_workers: Option<usize>,
    /// How many large-array file handles may be open at once before
    /// the soft-LRU cache starts closing clean ones.
    pub large_file_soft_limit: usize,
    /// Deterministic fault injector threaded into every backup log's
    /// write path. `Default` parses it from [`SABOTAGE_ENV_VAR`];
    /// `None` means sabotage is permanently disarmed.
    pub sabotage: Option<Arc<Sabotage>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            pool_max_bytes: 256 * 1024 * 1024,
            lock_pages: false,
            fsync_workers: None,
            large_file_soft_limit: DEFAULT_LARGE_FILE_SOFT_LIMIT,
            sabotage: Sabotage::from_env_var(SABOTAGE_ENV_VAR).map(Arc::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tile_size_is_a_multiple_of_page_size() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.tile_size % crate::common::os_page_size(), 0);
    }
}
