//! Real-time PCM relay through an external "lambda" process.
//!
//! Audio captured from a device is written to the lambda's stdin; whatever
//! the lambda writes to stdout is played back. The format travels to the
//! lambda as `PA_LAMBDA_*` environment variables.
//!
//! Two host integrations share the same relay:
//!   - [`standalone`]: the bridge owns an ALSA capture and playback PCM
//!   - [`embedded`]: the bridge is a virtual sink/source pair inside a host
//!     audio server

pub mod audio;
pub mod config;
pub mod embedded;
pub mod error;
pub mod lambda;
pub mod relay;
pub mod standalone;
