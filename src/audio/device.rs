//! Device endpoints driven by the relay.
//!
//! Capture is a blocking read of exactly one period and acts as the relay's
//! pacing clock. Playback is a blocking write of whatever the lambda produced.

use std::thread;
use std::time::Duration;

use alsa::pcm::PCM;
use nix::errno::Errno;

use super::alsa_device::AlsaParams;
use crate::error::{BridgeError, Result};

/// Underrun recoveries tolerated for one playback write before giving up.
const MAX_PLAYBACK_RECOVERIES: u32 = 3;

pub trait CaptureDevice {
    /// Block until `buf` holds one full period.
    ///
    /// Returns `Ok(false)` once the source has no more audio to deliver;
    /// hardware sources never do.
    fn read_period(&mut self, buf: &mut [u8]) -> Result<bool>;
}

pub trait PlaybackDevice {
    /// Block until all of `data` has been queued on the device.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
}

// ======================== ALSA ========================

pub struct AlsaCapture {
    name: String,
    pcm: PCM,
    bytes_per_frame: usize,
}

impl AlsaCapture {
    pub fn new(name: &str, pcm: PCM, params: &AlsaParams) -> Self {
        Self {
            name: name.to_string(),
            pcm,
            bytes_per_frame: params.channels as usize * 2,
        }
    }
}

impl CaptureDevice for AlsaCapture {
    fn read_period(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let io = self.pcm.io_bytes();
            match io.readi(&mut buf[filled..]) {
                Ok(frames) => filled += frames * self.bytes_per_frame,
                Err(e) if e.errno() == Errno::EPIPE as i32 => {
                    log::warn!("ALSA capture overrun on {}, recovering...", self.name);
                    self.pcm
                        .prepare()
                        .map_err(|e2| BridgeError::device(&self.name, e2))?;
                }
                Err(e) => return Err(BridgeError::device(&self.name, e)),
            }
        }
        Ok(true)
    }
}

pub struct AlsaPlayback {
    name: String,
    pcm: PCM,
    bytes_per_frame: usize,
    // Tail of an incomplete frame, queued in front of the next write.
    carry: Vec<u8>,
}

impl AlsaPlayback {
    pub fn new(name: &str, pcm: PCM, params: &AlsaParams) -> Self {
        Self {
            name: name.to_string(),
            pcm,
            bytes_per_frame: params.channels as usize * 2,
            carry: Vec::new(),
        }
    }
}

impl PlaybackDevice for AlsaPlayback {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let staged;
        let data = if self.carry.is_empty() {
            data
        } else {
            self.carry.extend_from_slice(data);
            staged = std::mem::take(&mut self.carry);
            &staged[..]
        };

        // writei only takes whole frames; the remainder waits for the next call.
        let whole = data.len() - data.len() % self.bytes_per_frame;
        let mut written = 0;
        let mut retry_count = 0u32;

        while written < whole {
            let io = self.pcm.io_bytes();
            match io.writei(&data[written..whole]) {
                Ok(frames) => {
                    written += frames * self.bytes_per_frame;
                    retry_count = 0;
                }
                Err(e) if e.errno() == Errno::EPIPE as i32 => {
                    retry_count += 1;
                    if retry_count > MAX_PLAYBACK_RECOVERIES {
                        return Err(BridgeError::device(
                            &self.name,
                            format!("underrun persisted after {} recoveries", MAX_PLAYBACK_RECOVERIES),
                        ));
                    }
                    log::warn!("ALSA playback underrun on {}, recovering...", self.name);
                    self.pcm
                        .prepare()
                        .map_err(|e2| BridgeError::device(&self.name, e2))?;
                }
                Err(e) => return Err(BridgeError::device(&self.name, e)),
            }
        }
        self.carry.extend_from_slice(&data[whole..]);
        Ok(())
    }
}

// ======================== In-memory ========================

/// Capture endpoint replaying a byte buffer, optionally paced like hardware.
pub struct MemoryCapture {
    data: Vec<u8>,
    pos: usize,
    pacing: Option<Duration>,
    endless: bool,
}

impl MemoryCapture {
    /// Deliver `data` as fast as the relay asks for it, then end.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            pacing: None,
            endless: false,
        }
    }

    /// Deliver `data` one period every `period`, then end.
    pub fn paced(data: Vec<u8>, period: Duration) -> Self {
        Self {
            pacing: Some(period),
            ..Self::new(data)
        }
    }

    /// Deliver silence forever, one period every `period`.
    pub fn silence(period: Duration) -> Self {
        Self {
            pacing: Some(period),
            endless: true,
            ..Self::new(Vec::new())
        }
    }
}

impl CaptureDevice for MemoryCapture {
    fn read_period(&mut self, buf: &mut [u8]) -> Result<bool> {
        if let Some(period) = self.pacing {
            thread::sleep(period);
        }
        if self.endless {
            buf.fill(0);
            return Ok(true);
        }
        if self.pos >= self.data.len() {
            return Ok(false);
        }

        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        // Pad the final short period with silence.
        buf[n..].fill(0);
        self.pos += n;
        Ok(true)
    }
}

/// Playback endpoint collecting everything written to it.
#[derive(Default)]
pub struct MemoryPlayback {
    pub received: Vec<u8>,
    pub writes: usize,
    fail_after: Option<usize>,
}

impl MemoryPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that accepts `writes` writes and then fails hard.
    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Self::default()
        }
    }
}

impl PlaybackDevice for MemoryPlayback {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_after.is_some_and(|limit| self.writes >= limit) {
            return Err(BridgeError::device("memory", "device unplugged"));
        }
        self.received.extend_from_slice(data);
        self.writes += 1;
        Ok(())
    }
}
