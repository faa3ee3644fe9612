//! Tiled storage: copy-on-write paging over large backing files,
//! shared through a process-wide eviction pool.

pub mod file;
pub mod pool;
pub mod refs;
pub mod tile;

pub use file::TiledFile;
pub use pool::TilePool;
pub use refs::{AccessMode, TileRef};
