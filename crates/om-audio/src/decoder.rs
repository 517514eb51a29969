//! Decoder seam
//!
//! Channels drive decoders through these traits so the bridge does not
//! depend on a particular codec library.

use om_core::error::AudioError;
use std::path::Path;

/// A stream of interleaved 16-bit samples
pub trait AudioDecoder: Send {
    /// Fill `out` with interleaved samples, returning how many were written
    ///
    /// Returns `Ok(0)` at end of stream.
    fn read(&mut self, out: &mut [i16]) -> Result<usize, AudioError>;

    /// Move the play position
    fn seek(&mut self, position_ms: u32) -> Result<(), AudioError>;

    /// Current play position in milliseconds
    fn position_ms(&self) -> u32;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Release codec resources; called once when the channel stops
    fn close(&mut self);
}

/// Opens decoders for play requests
pub trait DecoderFactory: Send + Sync {
    fn open_bytes(&self, data: &[u8]) -> Result<Box<dyn AudioDecoder>, AudioError>;

    fn open_file(&self, path: &Path) -> Result<Box<dyn AudioDecoder>, AudioError>;
}
