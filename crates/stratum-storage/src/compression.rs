//! Payload compression
//!
//! The allocator asks its [`Codec`] to shrink a payload and keeps the
//! result only when it is strictly smaller. The compressed flag in the
//! chunk tag records which payloads went through the codec, so a store
//! must always be opened with the codec that wrote it.

use std::fmt;

/// A payload compression strategy
pub trait Codec: fmt::Debug + Send + Sync {
    /// Short name for logs and stats
    fn name(&self) -> &'static str;

    /// Compress `input`; `None` if the codec cannot handle it
    fn compress(&self, input: &[u8]) -> Option<Vec<u8>>;

    /// Reverse [`compress`](Codec::compress)
    fn decompress(&self, input: &[u8]) -> std::result::Result<Vec<u8>, String>;
}

/// Snappy raw-format compression (the default)
#[derive(Debug, Clone, Copy, Default)]
pub struct Snappy;

impl Codec for Snappy {
    fn name(&self) -> &'static str {
        "snappy"
    }

    fn compress(&self, input: &[u8]) -> Option<Vec<u8>> {
        snap::raw::Encoder::new().compress_vec(input).ok()
    }

    fn decompress(&self, input: &[u8]) -> std::result::Result<Vec<u8>, String> {
        snap::raw::Decoder::new()
            .decompress_vec(input)
            .map_err(|e| e.to_string())
    }
}
