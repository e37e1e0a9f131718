//! Language-aware chunking: extension-dispatched strategies over a shared
//! token budgeter.

pub mod budget;
pub mod config;
pub mod error;
pub mod language;
pub mod strategy;

pub use budget::{pack_blocks, Block, BlockKind, PackedChunk};
pub use config::{estimate_tokens, ChunkConfig};
pub use error::{ChunkerError, Result};
pub use language::Language;
pub use strategy::{chunk_file, Strategy};
