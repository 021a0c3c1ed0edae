//! PCM format descriptor shared with the lambda process.
//!
//! The bridge supports exactly one sample encoding (16-bit signed little
//! endian). The descriptor is derived once from what the device negotiated
//! and handed to the lambda through `PA_LAMBDA_*` environment variables.
//! The lambda's output is never checked against it.

use std::fmt;
use std::time::Duration;

use super::alsa_device::AlsaParams;

/// Sample encodings the bridge can relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    S16Le,
}

impl SampleEncoding {
    /// Parse an encoding name as accepted in module arguments.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "s16le" => Some(Self::S16Le),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::S16Le => "s16le",
        }
    }

    pub fn bytes_per_sample(self) -> u32 {
        match self {
            Self::S16Le => 2,
        }
    }

    pub fn bits_per_sample(self) -> u32 {
        self.bytes_per_sample() * 8
    }

    pub fn is_signed(self) -> bool {
        match self {
            Self::S16Le => true,
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable description of the PCM stream flowing through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per device period, i.e. per relay cycle
    pub buffer_frames: usize,
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    pub fn s16le(sample_rate: u32, channels: u32, buffer_frames: usize) -> Self {
        Self {
            sample_rate,
            channels,
            buffer_frames,
            encoding: SampleEncoding::S16Le,
        }
    }

    /// Derive the descriptor from the parameters the capture PCM settled on.
    pub fn negotiated(params: &AlsaParams) -> Self {
        Self::s16le(params.sample_rate, params.channels, params.period_size)
    }

    pub fn bytes_per_sample(&self) -> u32 {
        self.encoding.bytes_per_sample()
    }

    pub fn bits_per_sample(&self) -> u32 {
        self.encoding.bits_per_sample()
    }

    pub fn bytes_per_frame(&self) -> usize {
        (self.bytes_per_sample() * self.channels) as usize
    }

    /// Size of the relay window in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_frames * self.bytes_per_frame()
    }

    /// Wall-clock length of one device period.
    pub fn period(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.buffer_frames as u64 * 1_000_000 / self.sample_rate as u64)
    }

    /// Environment assignments describing this format to the lambda.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("PA_LAMBDA_SAMPLE_RATE", self.sample_rate.to_string()),
            ("PA_LAMBDA_CHANNELS", self.channels.to_string()),
            ("PA_LAMBDA_BUFFER_SIZE", self.buffer_frames.to_string()),
            ("PA_LAMBDA_SAMPLE_FORMAT", self.encoding.name().to_string()),
            ("PA_LAMBDA_BYTES_PER_SAMPLE", self.bytes_per_sample().to_string()),
            ("PA_LAMBDA_BYTES_PER_FRAME", self.bytes_per_frame().to_string()),
            (
                "PA_LAMBDA_SIGNED",
                if self.encoding.is_signed() { "signed" } else { "unsigned" }.to_string(),
            ),
            ("PA_LAMBDA_BITS", self.bits_per_sample().to_string()),
        ]
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}Hz, {} channels, {} frames buffer",
            self.encoding, self.sample_rate, self.channels, self.buffer_frames
        )
    }
}
