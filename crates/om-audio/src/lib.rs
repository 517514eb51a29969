//! Audio playback for oxidized-mre guests
//!
//! Guests start playback of a buffer or file and get back a channel
//! handle. The host mixer pulls PCM from live channels.

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod decoder;
pub mod source;
pub mod testing;

pub use bridge::AudioBridge;
pub use channel::{AudioChannel, AudioEvent, ChannelStatus, PullStatus};
pub use codec::{SymphoniaDecoder, SymphoniaDecoderFactory};
pub use decoder::{AudioDecoder, DecoderFactory};
pub use source::SourceKey;
