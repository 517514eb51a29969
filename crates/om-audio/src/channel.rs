//! Audio channel state machine
//!
//! ```text
//! Constructing -> Playing <-> Paused -> Stopped
//!       \
//!        -> Error
//! ```
//!
//! Control calls and the mixer's pull callback both go through the
//! channel's own lock, never the handle table's.

use crate::decoder::AudioDecoder;
use crate::source::SourceKey;
use om_core::error::AudioError;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Constructing,
    Playing,
    Paused,
    Stopped,
    Error,
}

/// Notification for the guest's playback callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEvent {
    /// Playback reached the end with no repeats left
    End,
    /// Decoding failed mid-stream
    Error,
}

/// Result of one pull from the mixer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// `n` samples were produced; keep pulling
    Continue(usize),
    /// The channel has nothing more to play
    Done,
}

struct ChannelState {
    status: ChannelStatus,
    decoder: Option<Box<dyn AudioDecoder>>,
    repeat: u32,
    pending_event: Option<AudioEvent>,
}

/// One playing source
pub struct AudioChannel {
    key: SourceKey,
    state: Mutex<ChannelState>,
}

impl AudioChannel {
    /// Build a channel from the outcome of opening its decoder
    ///
    /// A failed open leaves the channel in `Error`; such a channel must
    /// not be given a handle.
    pub fn new(key: SourceKey, decoder: Result<Box<dyn AudioDecoder>, AudioError>) -> Self {
        let channel = Self {
            key,
            state: Mutex::new(ChannelState {
                status: ChannelStatus::Constructing,
                decoder: None,
                repeat: 0,
                pending_event: None,
            }),
        };

        {
            let mut state = channel.state.lock();
            match decoder {
                Ok(decoder) => state.decoder = Some(decoder),
                Err(e) => {
                    warn!("Audio channel for {:?} failed to initialize: {}", channel.key, e);
                    state.status = ChannelStatus::Error;
                }
            }
        }

        channel
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn status(&self) -> ChannelStatus {
        self.state.lock().status
    }

    pub fn repeat(&self) -> u32 {
        self.state.lock().repeat
    }

    /// Begin playback from `start_ms` with `repeat` extra passes
    pub fn start(&self, start_ms: u32, repeat: u32) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if state.status != ChannelStatus::Constructing {
            return Err(AudioError::InitializationFailure(format!(
                "Channel cannot start from {:?}",
                state.status
            )));
        }

        let Some(decoder) = state.decoder.as_mut() else {
            return Err(AudioError::InitializationFailure("No decoder".into()));
        };
        if start_ms > 0 {
            decoder.seek(start_ms)?;
        }

        state.repeat = repeat;
        state.status = ChannelStatus::Playing;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        match state.status {
            ChannelStatus::Playing | ChannelStatus::Paused => {
                state.status = ChannelStatus::Paused;
                Ok(())
            }
            status => Err(AudioError::Decode(format!("Cannot pause a {:?} channel", status))),
        }
    }

    pub fn resume(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        match state.status {
            ChannelStatus::Paused | ChannelStatus::Playing => {
                state.status = ChannelStatus::Playing;
                Ok(())
            }
            status => Err(AudioError::Decode(format!("Cannot resume a {:?} channel", status))),
        }
    }

    pub fn seek(&self, position_ms: u32) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        match state.decoder.as_mut() {
            Some(decoder) => decoder.seek(position_ms),
            None => Err(AudioError::Decode("Channel has no decoder".into())),
        }
    }

    pub fn position_ms(&self) -> Option<u32> {
        self.state.lock().decoder.as_ref().map(|d| d.position_ms())
    }

    /// Stop playback and release the decoder
    ///
    /// Idempotent: returns `true` only for the call that actually stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();

        let had_decoder = match state.decoder.take() {
            Some(mut decoder) => {
                decoder.close();
                true
            }
            None => false,
        };

        let was_live = matches!(
            state.status,
            ChannelStatus::Constructing | ChannelStatus::Playing | ChannelStatus::Paused
        );
        if was_live {
            state.status = ChannelStatus::Stopped;
        }

        if had_decoder || was_live {
            trace!("Audio channel {:?} stopped", self.key);
        }
        had_decoder || was_live
    }

    /// Produce the next chunk of samples into `out`
    ///
    /// Paused channels yield silence. At end of stream a positive repeat
    /// counter is decremented and playback restarts from the beginning.
    pub fn pull(&self, out: &mut [i16]) -> PullStatus {
        let mut state = self.state.lock();
        let state = &mut *state;

        match state.status {
            ChannelStatus::Playing => {}
            ChannelStatus::Paused => {
                out.fill(0);
                return PullStatus::Continue(0);
            }
            _ => return PullStatus::Done,
        }

        let Some(decoder) = state.decoder.as_mut() else {
            return PullStatus::Done;
        };

        let result = match decoder.read(out) {
            Ok(0) if state.repeat > 0 => {
                state.repeat -= 1;
                debug!("Audio channel {:?} looping, {} repeats left", self.key, state.repeat);
                decoder.seek(0).and_then(|_| decoder.read(out))
            }
            other => other,
        };

        match result {
            Ok(0) => {
                state.status = ChannelStatus::Stopped;
                state.pending_event = Some(AudioEvent::End);
                if let Some(mut decoder) = state.decoder.take() {
                    decoder.close();
                }
                PullStatus::Done
            }
            Ok(n) => PullStatus::Continue(n),
            Err(e) => {
                warn!("Audio channel {:?} decode failure: {}", self.key, e);
                state.status = ChannelStatus::Error;
                state.pending_event = Some(AudioEvent::Error);
                if let Some(mut decoder) = state.decoder.take() {
                    decoder.close();
                }
                PullStatus::Done
            }
        }
    }

    /// Take the completion event raised by the last pull, if any
    pub fn take_event(&self) -> Option<AudioEvent> {
        self.state.lock().pending_event.take()
    }
}

impl Drop for AudioChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioChannel")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDecoder, MockProbe};

    fn channel(samples: usize) -> (AudioChannel, MockProbe) {
        let (decoder, probe) = MockDecoder::new(samples);
        let channel = AudioChannel::new(SourceKey::buffer(0x100, b"data"), Ok(Box::new(decoder)));
        (channel, probe)
    }

    #[test]
    fn test_lifecycle() {
        let (ch, probe) = channel(8);
        assert_eq!(ch.status(), ChannelStatus::Constructing);

        ch.start(0, 0).unwrap();
        assert_eq!(ch.status(), ChannelStatus::Playing);

        ch.pause().unwrap();
        assert_eq!(ch.status(), ChannelStatus::Paused);
        let mut buf = [1i16; 4];
        assert_eq!(ch.pull(&mut buf), PullStatus::Continue(0));
        assert_eq!(buf, [0; 4]);

        ch.resume().unwrap();
        assert!(ch.stop());
        assert!(!ch.stop());
        assert_eq!(ch.status(), ChannelStatus::Stopped);
        assert_eq!(probe.closes(), 1);
        assert!(ch.pause().is_err());
        assert_eq!(ch.pull(&mut buf), PullStatus::Done);
    }

    #[test]
    fn test_failed_decoder_is_error() {
        let ch = AudioChannel::new(
            SourceKey::buffer(0, b""),
            Err(AudioError::InitializationFailure("bad header".into())),
        );
        assert_eq!(ch.status(), ChannelStatus::Error);
        assert!(ch.start(0, 0).is_err());
        assert_eq!(ch.pull(&mut [0i16; 4]), PullStatus::Done);
    }

    #[test]
    fn test_repeat_counter() {
        let (ch, probe) = channel(4);
        ch.start(0, 1).unwrap();

        let mut buf = [0i16; 4];
        assert_eq!(ch.pull(&mut buf), PullStatus::Continue(4));
        // End of first pass, one repeat left
        assert_eq!(ch.pull(&mut buf), PullStatus::Continue(4));
        assert_eq!(ch.repeat(), 0);
        assert_eq!(ch.take_event(), None);

        assert_eq!(ch.pull(&mut buf), PullStatus::Done);
        assert_eq!(ch.take_event(), Some(AudioEvent::End));
        assert_eq!(ch.take_event(), None);
        assert_eq!(ch.status(), ChannelStatus::Stopped);
        assert_eq!(probe.closes(), 1);

        // Stopping after natural completion does not close again
        assert!(!ch.stop());
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_decode_failure_mid_stream() {
        let (decoder, probe) = MockDecoder::new(16);
        probe.fail_reads();
        let ch = AudioChannel::new(SourceKey::buffer(0, b"x"), Ok(Box::new(decoder)));
        ch.start(0, 3).unwrap();

        assert_eq!(ch.pull(&mut [0i16; 4]), PullStatus::Done);
        assert_eq!(ch.status(), ChannelStatus::Error);
        assert_eq!(ch.take_event(), Some(AudioEvent::Error));
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_drop_closes_decoder() {
        let (ch, probe) = channel(8);
        drop(ch);
        assert_eq!(probe.closes(), 1);

        let (ch, probe) = channel(8);
        ch.start(0, 0).unwrap();
        ch.stop();
        drop(ch);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_failed_start_offset_closes_on_drop() {
        let (ch, probe) = channel(100);
        probe.fail_seeks();
        assert!(ch.start(40, 0).is_err());
        assert_eq!(ch.status(), ChannelStatus::Constructing);
        drop(ch);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_start_offset_and_seek() {
        let (ch, _probe) = channel(100);
        ch.start(20, 0).unwrap();
        assert_eq!(ch.position_ms(), Some(20));
        ch.seek(5).unwrap();
        assert_eq!(ch.position_ms(), Some(5));
    }
}
