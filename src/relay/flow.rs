//! The duplex relay between the devices and the lambda.
//!
//! One cycle: a blocking capture read paces the loop, the period is pushed
//! into the lambda's stdin (retrying on would-block), then a single
//! non-blocking read forwards whatever the lambda has ready to playback.
//! Output is not lock-stepped with input, so a lambda that buffers several
//! periods before emitting never stalls the relay. While the lambda's stdin
//! is full its stdout is drained as well, since it may be blocked on it.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Instant;

use crate::audio::{CaptureDevice, PcmFormat, PlaybackDevice};
use crate::config::RelaySettings;
use crate::error::{BridgeError, Result};
use crate::lambda::LambdaPipes;

use super::{RelayStats, SessionState};

/// Outcome of one non-blocking read from the lambda.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// This many bytes were read into the window
    Data(usize),
    /// Nothing available yet; routine while the lambda buffers
    Pending,
    /// The lambda closed its stdout
    Eof,
}

/// Outcome of pushing a window into the lambda.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The lambda closed its stdin (broken pipe)
    LambdaGone,
}

/// Outcome of one non-blocking push into the lambda.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// This many bytes went in; fewer than offered means the pipe is full
    Accepted(usize),
    LambdaGone,
}

/// Why the relay stopped accepting input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    LambdaExited,
    SourceEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Continue,
    Drain(DrainReason),
}

pub struct FlowController {
    format: PcmFormat,
    settings: RelaySettings,
    // One device period, reused every cycle.
    buffer: Vec<u8>,
    // Output read while a write is stalled.
    spill: Vec<u8>,
    state: SessionState,
    stats: RelayStats,
    output_closed: bool,
}

impl FlowController {
    pub fn new(format: PcmFormat, settings: RelaySettings) -> Self {
        Self {
            buffer: vec![0u8; format.buffer_bytes()],
            spill: vec![0u8; format.buffer_bytes()],
            format,
            settings,
            state: SessionState::Starting,
            stats: RelayStats::default(),
            output_closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        if next > self.state {
            log::debug!("Relay state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Write all of `data` into the lambda's stdin.
    ///
    /// The endpoint is non-blocking: short writes continue with the
    /// remainder and would-block pauses briefly before retrying.
    pub fn deliver<W: Write + ?Sized>(&mut self, input: &mut W, data: &[u8]) -> Result<Delivery> {
        self.deliver_with(input, data, |_| Ok(()))
    }

    /// Like [`FlowController::deliver`], calling `relieve` each time the
    /// write would block so the caller can drain the lambda's output.
    pub fn deliver_with<W, F>(&mut self, input: &mut W, data: &[u8], mut relieve: F) -> Result<Delivery>
    where
        W: Write + ?Sized,
        F: FnMut(&mut Self) -> Result<()>,
    {
        let mut written = 0;
        loop {
            match self.push(input, &data[written..])? {
                Push::Accepted(n) => written += n,
                Push::LambdaGone => return Ok(Delivery::LambdaGone),
            }
            if written == data.len() {
                return Ok(Delivery::Delivered);
            }
            relieve(self)?;
            thread::sleep(self.settings.retry_pause);
        }
    }

    /// Write as much of `data` as the lambda's stdin takes right now,
    /// stopping at the first would-block.
    pub fn push<W: Write + ?Sized>(&mut self, input: &mut W, data: &[u8]) -> Result<Push> {
        let mut written = 0;
        while written < data.len() {
            match input.write(&data[written..]) {
                Ok(0) => return Err(BridgeError::Pipe(ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.stats.stalled_writes += 1;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    self.stats.bytes_in += written as u64;
                    log::info!("Lambda closed its input after {} bytes", self.stats.bytes_in);
                    return Ok(Push::LambdaGone);
                }
                Err(e) => {
                    log::error!("Failed to write to lambda: {}", e);
                    return Err(BridgeError::Pipe(e));
                }
            }
        }
        self.stats.bytes_in += written as u64;
        Ok(Push::Accepted(written))
    }

    /// One non-blocking read from the lambda's stdout into `window`.
    pub fn collect<R: Read + ?Sized>(&mut self, output: &mut R, window: &mut [u8]) -> Result<Pull> {
        loop {
            match output.read(window) {
                Ok(0) => {
                    self.output_closed = true;
                    return Ok(Pull::Eof);
                }
                Ok(n) => {
                    self.count_output(n);
                    return Ok(Pull::Data(n));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.stats.empty_reads += 1;
                    return Ok(Pull::Pending);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("Failed to read from lambda: {}", e);
                    return Err(BridgeError::Pipe(e));
                }
            }
        }
    }

    // Partial frames are passed through untouched; they are only counted.
    fn count_output(&mut self, n: usize) {
        let frame = self.format.bytes_per_frame();
        if frame > 0 && n % frame != 0 {
            self.stats.partial_frames += 1;
            log::debug!("Lambda emitted {} bytes, not a multiple of the {}-byte frame", n, frame);
        }
        self.stats.bytes_out += n as u64;
    }

    /// Run one relay cycle.
    pub fn cycle<C, P>(
        &mut self,
        capture: &mut C,
        playback: &mut P,
        pipes: &mut LambdaPipes,
    ) -> Result<Cycle>
    where
        C: CaptureDevice + ?Sized,
        P: PlaybackDevice + ?Sized,
    {
        let mut buffer = std::mem::take(&mut self.buffer);
        let result = self.run_cycle(&mut buffer, capture, playback, pipes);
        self.buffer = buffer;
        result
    }

    fn run_cycle<C, P>(
        &mut self,
        buffer: &mut [u8],
        capture: &mut C,
        playback: &mut P,
        pipes: &mut LambdaPipes,
    ) -> Result<Cycle>
    where
        C: CaptureDevice + ?Sized,
        P: PlaybackDevice + ?Sized,
    {
        self.transition(SessionState::Running);

        if !capture.read_period(buffer)? {
            log::info!("Capture source ended");
            self.transition(SessionState::Draining);
            return Ok(Cycle::Drain(DrainReason::SourceEnded));
        }

        let (input, output) = pipes.split();
        let Some(input) = input else {
            self.transition(SessionState::Draining);
            return Ok(Cycle::Drain(DrainReason::LambdaExited));
        };
        let mut spill = std::mem::take(&mut self.spill);
        let delivery = self.deliver_with(input, buffer, |flow| {
            if let Pull::Data(n) = flow.collect(&mut *output, &mut spill)? {
                playback.write_all(&spill[..n])?;
            }
            Ok(())
        });
        self.spill = spill;
        if delivery? == Delivery::LambdaGone {
            self.transition(SessionState::Draining);
            return Ok(Cycle::Drain(DrainReason::LambdaExited));
        }

        self.stats.cycles += 1;
        match self.collect(pipes.output(), buffer)? {
            Pull::Data(n) => playback.write_all(&buffer[..n])?,
            Pull::Pending => {}
            Pull::Eof => {
                log::info!("Lambda process ended");
                self.transition(SessionState::Draining);
                return Ok(Cycle::Drain(DrainReason::LambdaExited));
            }
        }
        Ok(Cycle::Continue)
    }

    /// Stop feeding the lambda and forward whatever it still emits, until
    /// it closes stdout or the drain timeout passes.
    pub fn drain<P>(&mut self, playback: &mut P, pipes: &mut LambdaPipes) -> Result<()>
    where
        P: PlaybackDevice + ?Sized,
    {
        self.transition(SessionState::Draining);
        pipes.close_input();
        if self.output_closed {
            return Ok(());
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        let result = self.run_drain(&mut buffer, playback, pipes);
        self.buffer = buffer;
        result
    }

    fn run_drain<P>(&mut self, buffer: &mut [u8], playback: &mut P, pipes: &mut LambdaPipes) -> Result<()>
    where
        P: PlaybackDevice + ?Sized,
    {
        let deadline = Instant::now() + self.settings.drain_timeout;
        let before = self.stats.bytes_out;
        loop {
            match self.collect(pipes.output(), buffer)? {
                Pull::Data(n) => playback.write_all(&buffer[..n])?,
                Pull::Eof => break,
                Pull::Pending if Instant::now() < deadline => thread::sleep(self.settings.retry_pause),
                Pull::Pending => {
                    log::warn!(
                        "Lambda still open after {:?} of draining, giving up",
                        self.settings.drain_timeout
                    );
                    break;
                }
            }
        }
        log::debug!("Drained {} bytes from lambda", self.stats.bytes_out - before);
        Ok(())
    }

    /// Mark the relay as fully torn down.
    pub fn finish(&mut self) {
        self.transition(SessionState::Stopped);
    }
}
