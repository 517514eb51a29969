//! Audio channel handles (vm_midi_* / vm_audio_*)
//!
//! The table holds shared channels. A pull clones its channel out of the
//! table before decoding, so guest calls that change the table never wait
//! on a decode in progress.

use crate::channel::{AudioChannel, AudioEvent, ChannelStatus, PullStatus};
use crate::decoder::DecoderFactory;
use crate::source::SourceKey;
use om_core::error::{AudioError, KernelError};
use om_kernel::{Handle, HandleTable};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Per-app table of audio channels
pub struct AudioBridge {
    factory: Arc<dyn DecoderFactory>,
    channels: HandleTable<Arc<AudioChannel>, SourceKey>,
    events: Mutex<Vec<(Handle, AudioEvent)>>,
}

impl AudioBridge {
    pub fn new(factory: Arc<dyn DecoderFactory>, max_channels: usize) -> Self {
        Self {
            factory,
            channels: HandleTable::with_limit("audio", max_channels),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Play a guest buffer located at `addr`
    pub fn play_bytes(
        &self,
        addr: u32,
        data: &[u8],
        start_ms: u32,
        repeat: u32,
    ) -> Result<Handle, AudioError> {
        let key = SourceKey::buffer(addr, data);
        let decoder = self.factory.open_bytes(data);
        self.play(AudioChannel::new(key, decoder), start_ms, repeat)
    }

    /// Play a host file
    pub fn play_file(&self, path: &Path, start_ms: u32, repeat: u32) -> Result<Handle, AudioError> {
        let key = SourceKey::file(path);
        let decoder = self.factory.open_file(path);
        self.play(AudioChannel::new(key, decoder), start_ms, repeat)
    }

    fn play(&self, channel: AudioChannel, start_ms: u32, repeat: u32) -> Result<Handle, AudioError> {
        if channel.status() == ChannelStatus::Error {
            return Err(AudioError::InitializationFailure(format!(
                "Could not open {:?}",
                channel.key()
            )));
        }

        channel.start(start_ms, repeat)?;

        let key = channel.key().clone();
        let (handle, displaced) = match self.channels.replace_or_push(key, Arc::new(channel)) {
            Ok(result) => result,
            Err(e) => {
                debug!("No free audio channel: {}", e);
                return Err(e.into());
            }
        };

        if let Some(old) = displaced {
            old.stop();
            self.discard_events(handle);
            debug!("Audio handle {} restarted with {:?}", handle, old.key());
        } else {
            info!("Audio handle {} playing", handle);
        }

        Ok(handle)
    }

    pub fn pause(&self, handle: Handle) -> Result<(), AudioError> {
        self.channels.access(handle)?.pause()
    }

    pub fn resume(&self, handle: Handle) -> Result<(), AudioError> {
        self.channels.access(handle)?.resume()
    }

    pub fn seek(&self, handle: Handle, position_ms: u32) -> Result<(), AudioError> {
        self.channels.access(handle)?.seek(position_ms)
    }

    /// Current play position of a channel
    pub fn time_ms(&self, handle: Handle) -> Result<u32, AudioError> {
        self.channels
            .access(handle)?
            .position_ms()
            .ok_or(AudioError::Kernel(KernelError::InvalidHandle(handle)))
    }

    pub fn status(&self, handle: Handle) -> Option<ChannelStatus> {
        self.channels.access(handle).ok().map(|ch| ch.status())
    }

    pub fn is_active(&self, handle: Handle) -> bool {
        self.channels.is_active(handle)
    }

    /// Stop a channel and free its handle
    ///
    /// Inactive handles are ignored.
    pub fn stop(&self, handle: Handle) {
        if let Some(channel) = self.channels.remove(handle) {
            channel.stop();
            self.discard_events(handle);
            trace!("Audio handle {} stopped", handle);
        }
    }

    /// Stop every channel, invalidating all handles
    pub fn stop_all(&self) -> usize {
        let channels = self.channels.reset_all();
        for channel in &channels {
            channel.stop();
        }
        self.events.lock().clear();
        if !channels.is_empty() {
            debug!("Stopped {} audio channels", channels.len());
        }
        channels.len()
    }

    /// Mixer callback: fill `out` from a channel
    ///
    /// Pulls against handles that were stopped or reset report `Done`.
    pub fn pull(&self, handle: Handle, out: &mut [i16]) -> PullStatus {
        let Ok(channel) = self.channels.access(handle).map(|ch| Arc::clone(&*ch)) else {
            return PullStatus::Done;
        };

        let status = channel.pull(out);
        if let Some(event) = channel.take_event() {
            let mut events = self.events.lock();
            // Drop events from a channel stopped or replaced mid-pull
            let current = self
                .channels
                .access(handle)
                .is_ok_and(|ch| Arc::ptr_eq(&*ch, &channel));
            if current {
                events.push((handle, event));
            }
        }
        status
    }

    fn discard_events(&self, handle: Handle) {
        self.events.lock().retain(|(h, _)| *h != handle);
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.channels.handles()
    }

    pub fn active_count(&self) -> usize {
        self.channels.active_count()
    }

    /// Drain completion events for the guest callback
    pub fn take_events(&self) -> Vec<(Handle, AudioEvent)> {
        std::mem::take(&mut *self.events.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDecoderFactory;

    fn bridge(samples: usize) -> (AudioBridge, MockDecoderFactory) {
        let factory = MockDecoderFactory::new(samples);
        (AudioBridge::new(Arc::new(factory.clone()), 4), factory)
    }

    #[test]
    fn test_same_source_keeps_handle() {
        let (audio, factory) = bridge(64);

        let h1 = audio.play_bytes(0x8000, b"MThd-song", 0, 0).unwrap();
        let h2 = audio.play_bytes(0x8000, b"MThd-song", 0, 0).unwrap();

        assert_eq!(h1, h2);
        assert_eq!(audio.active_count(), 1);
        assert_eq!(factory.probe.opens(), 2);
        assert_eq!(factory.probe.closes(), 1);
        assert_eq!(audio.status(h2), Some(ChannelStatus::Playing));
    }

    #[test]
    fn test_distinct_sources_get_distinct_handles() {
        let (audio, _) = bridge(64);
        let a = audio.play_bytes(0x8000, b"one", 0, 0).unwrap();
        let b = audio.play_bytes(0x9000, b"two", 0, 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_init_failure_rejected() {
        let (audio, factory) = bridge(64);
        let err = audio.play_bytes(0x8000, b"BAD data", 0, 0).unwrap_err();
        assert!(matches!(err, AudioError::InitializationFailure(_)));
        assert_eq!(om_kernel::to_guest(audio.play_bytes(0, b"BAD", 0, 0).map_err(|_| ())), -1);
        assert_eq!(audio.active_count(), 0);
        assert_eq!(factory.probe.opens(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (audio, factory) = bridge(64);
        let h = audio.play_bytes(0x8000, b"x", 0, 0).unwrap();

        audio.stop(h);
        audio.stop(h);
        audio.stop(-1);
        assert!(!audio.is_active(h));
        assert_eq!(factory.probe.closes(), 1);
        assert!(audio.pause(h).is_err());
        assert_eq!(audio.pull(h, &mut [0i16; 8]), PullStatus::Done);
    }

    #[test]
    fn test_stop_all_invalidates_handles() {
        let (audio, factory) = bridge(64);
        let handles: Vec<_> = (0..3)
            .map(|i| audio.play_bytes(0x1000 * i, &[i as u8], 0, 0).unwrap())
            .collect();

        assert_eq!(audio.stop_all(), 3);
        assert!(handles.iter().all(|&h| !audio.is_active(h)));
        assert!(handles
            .iter()
            .all(|&h| audio.pull(h, &mut [0i16; 8]) == PullStatus::Done));
        assert_eq!(factory.probe.closes(), 3);
    }

    #[test]
    fn test_pull_to_completion_raises_end() {
        let (audio, _) = bridge(10);
        let h = audio.play_bytes(0x8000, b"x", 0, 1).unwrap();

        let mut buf = [0i16; 8];
        let mut produced = 0;
        while let PullStatus::Continue(n) = audio.pull(h, &mut buf) {
            produced += n;
        }

        assert_eq!(produced, 20);
        assert_eq!(audio.take_events(), vec![(h, AudioEvent::End)]);
        // The handle stays issued until the guest stops it
        assert!(audio.is_active(h));
        assert_eq!(audio.status(h), Some(ChannelStatus::Stopped));
    }

    fn drain(audio: &AudioBridge, h: Handle) {
        let mut buf = [0i16; 8];
        while audio.pull(h, &mut buf) != PullStatus::Done {}
    }

    #[test]
    fn test_stop_discards_pending_events() {
        let (audio, _) = bridge(10);
        let h1 = audio.play_bytes(0x8000, b"first", 0, 0).unwrap();
        drain(&audio, h1);
        audio.stop(h1);

        // The freed slot is reissued to the next source
        let h2 = audio.play_bytes(0x9000, b"second", 0, 0).unwrap();
        assert_eq!(h1, h2);
        assert!(audio.take_events().is_empty());
        assert_eq!(audio.status(h2), Some(ChannelStatus::Playing));
    }

    #[test]
    fn test_restart_discards_pending_events() {
        let (audio, _) = bridge(10);
        let h1 = audio.play_bytes(0x8000, b"song", 0, 0).unwrap();
        drain(&audio, h1);

        let h2 = audio.play_bytes(0x8000, b"song", 0, 0).unwrap();
        assert_eq!(h1, h2);
        assert!(audio.take_events().is_empty());
        assert_eq!(audio.status(h2), Some(ChannelStatus::Playing));

        drain(&audio, h2);
        assert_eq!(audio.take_events(), vec![(h2, AudioEvent::End)]);
    }

    #[test]
    fn test_stop_keeps_other_handles_events() {
        let (audio, _) = bridge(10);
        let a = audio.play_bytes(0x8000, b"a", 0, 0).unwrap();
        let b = audio.play_bytes(0x9000, b"b", 0, 0).unwrap();
        drain(&audio, a);
        drain(&audio, b);

        audio.stop(a);
        assert_eq!(audio.take_events(), vec![(b, AudioEvent::End)]);
    }

    #[test]
    fn test_failed_start_closes_decoder() {
        let (audio, factory) = bridge(1000);
        factory.probe.fail_seeks();

        assert!(audio.play_bytes(0x8000, b"x", 500, 0).is_err());
        assert_eq!(audio.active_count(), 0);
        assert_eq!(factory.probe.opens(), 1);
        assert_eq!(factory.probe.closes(), 1);
    }

    #[test]
    fn test_controls() {
        let (audio, _) = bridge(1000);
        let h = audio.play_bytes(0x8000, b"x", 250, 0).unwrap();
        assert_eq!(audio.time_ms(h).unwrap(), 250);

        audio.pause(h).unwrap();
        assert_eq!(audio.pull(h, &mut [0i16; 8]), PullStatus::Continue(0));
        audio.resume(h).unwrap();
        audio.seek(h, 10).unwrap();
        assert_eq!(audio.time_ms(h).unwrap(), 10);

        assert_eq!(
            audio.time_ms(7).unwrap_err(),
            AudioError::Kernel(KernelError::InvalidHandle(7))
        );
    }

    #[test]
    fn test_channel_limit() {
        let (audio, _) = bridge(8);
        for i in 0..4u32 {
            audio.play_bytes(i, b"x", 0, 0).unwrap();
        }
        assert_eq!(
            audio.play_bytes(99, b"x", 0, 0).unwrap_err(),
            AudioError::Kernel(KernelError::ResourceLimit)
        );
    }
}
