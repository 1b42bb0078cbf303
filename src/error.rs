use std::io;

use thiserror::Error;

/// Errors surfaced by the delta engine.
///
/// Input bytes themselves are never an error: every pair of byte sequences
/// has a valid delta. What can fail is resource acquisition and the sinks.
#[derive(Debug, Error)]
pub enum Error {
    /// A match index could not reserve its working memory.
    #[error("out of memory while building the match index")]
    OutOfMemory,

    /// The mode word does not name an installed match index.
    #[error("unsupported delta mode {0:#x}")]
    Unsupported(u32),

    /// The reference exceeds what the hash index can address.
    #[error("reference of {0} bytes is too large for the hash index")]
    InputTooLarge(usize),

    /// The block compressor rejected a write or finish.
    #[error("block sink failure")]
    Sink(#[from] io::Error),
}
