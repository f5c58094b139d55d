pub mod chunk;

pub use chunk::{ChunkStat, ChunkStorage, ChunkStorageError};
