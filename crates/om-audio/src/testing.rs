//! Scripted decoders
//!
//! Produce a fixed number of samples at 1 kHz mono, so one sample is one
//! millisecond. Useful for tests and for hosts running without codecs.

use crate::decoder::{AudioDecoder, DecoderFactory};
use om_core::error::AudioError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ProbeState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_seeks: AtomicBool,
}

/// Observes every decoder created from the same source
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inner: Arc<ProbeState>,
}

impl MockProbe {
    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Make subsequent reads fail
    pub fn fail_reads(&self) {
        self.inner.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn fail_seeks(&self) {
        self.inner.fail_seeks.store(true, Ordering::SeqCst);
    }
}

/// Decoder yielding a ramp of `len` samples
#[derive(Debug)]
pub struct MockDecoder {
    len: usize,
    pos: usize,
    probe: MockProbe,
}

impl MockDecoder {
    pub fn new(len: usize) -> (Self, MockProbe) {
        let probe = MockProbe::default();
        (Self::with_probe(len, probe.clone()), probe)
    }

    pub fn with_probe(len: usize, probe: MockProbe) -> Self {
        probe.inner.opens.fetch_add(1, Ordering::SeqCst);
        Self { len, pos: 0, probe }
    }
}

impl AudioDecoder for MockDecoder {
    fn read(&mut self, out: &mut [i16]) -> Result<usize, AudioError> {
        if self.probe.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(AudioError::Decode("scripted failure".into()));
        }

        let n = out.len().min(self.len - self.pos);
        for (i, sample) in out[..n].iter_mut().enumerate() {
            *sample = (self.pos + i) as i16;
        }
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, position_ms: u32) -> Result<(), AudioError> {
        if self.probe.inner.fail_seeks.load(Ordering::SeqCst) {
            return Err(AudioError::Decode("scripted seek failure".into()));
        }
        self.pos = (position_ms as usize).min(self.len);
        Ok(())
    }

    fn position_ms(&self) -> u32 {
        self.pos as u32
    }

    fn sample_rate(&self) -> u32 {
        1000
    }

    fn channels(&self) -> u16 {
        1
    }

    fn close(&mut self) {
        self.probe.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing [`MockDecoder`]s
///
/// Sources starting with `BAD` fail to open.
#[derive(Debug, Clone)]
pub struct MockDecoderFactory {
    pub samples: usize,
    pub probe: MockProbe,
}

impl MockDecoderFactory {
    pub fn new(samples: usize) -> Self {
        Self {
            samples,
            probe: MockProbe::default(),
        }
    }
}

impl DecoderFactory for MockDecoderFactory {
    fn open_bytes(&self, data: &[u8]) -> Result<Box<dyn AudioDecoder>, AudioError> {
        if data.starts_with(b"BAD") {
            return Err(AudioError::InitializationFailure("unrecognised stream".into()));
        }
        Ok(Box::new(MockDecoder::with_probe(self.samples, self.probe.clone())))
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn AudioDecoder>, AudioError> {
        let data = std::fs::read(path)
            .map_err(|e| AudioError::InitializationFailure(format!("{}: {}", path.display(), e)))?;
        self.open_bytes(&data)
    }
}
