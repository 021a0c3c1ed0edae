//! audio - PCM format description and the device endpoints of the relay
//!
//! Uses ALSA for blocking capture/playback in the one fixed encoding
//! (S16LE interleaved). In-memory endpoints stand in for hardware when the
//! relay is driven without a sound card.

pub mod alsa_device;
pub mod device;
pub mod format;

pub use alsa_device::{AlsaParams, PcmRequest};
pub use device::{
    AlsaCapture, AlsaPlayback, CaptureDevice, MemoryCapture, MemoryPlayback, PlaybackDevice,
};
pub use format::{PcmFormat, SampleEncoding};
