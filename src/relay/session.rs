use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::audio::{CaptureDevice, PcmFormat, PlaybackDevice};
use crate::config::RelaySettings;
use crate::error::{BridgeError, Result};
use crate::lambda::{LambdaProcess, Reaper};

use super::{Cycle, DrainReason, FlowController, RelayStats, SessionState};

/// Shutdown context shared between the relay and whoever delivers
/// process-level signals. It is the only state the signal side touches.
#[derive(Default)]
pub struct Shutdown {
    requested: AtomicBool,
    reaper: OnceLock<Arc<Reaper>>,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown and tear down the lambda if one is attached.
    ///
    /// Returns `true` for the first request only. Blocks for at most the
    /// lambda's reap timeout.
    pub fn trigger(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        if let Some(reaper) = self.reaper.get() {
            reaper.terminate();
        }
        first
    }

    /// Register the running lambda. A request that raced ahead of the
    /// registration is honoured immediately.
    pub fn attach(&self, reaper: Arc<Reaper>) {
        if self.reaper.set(reaper.clone()).is_err() {
            log::warn!("Shutdown context already has a lambda attached");
            return;
        }
        if self.is_requested() {
            reaper.terminate();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    LambdaExited,
    SourceEnded,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub format: PcmFormat,
    pub pid: u32,
    pub end: SessionEnd,
    pub state: SessionState,
    pub stats: RelayStats,
}

/// Spawn the lambda for `format` and relay between the two devices until
/// the lambda exits, the capture source ends, or `shutdown` is triggered.
///
/// The lambda is always reaped and its pipes closed before returning,
/// whether the session ended normally or on a fatal error.
pub fn run_session<C, P>(
    capture: &mut C,
    playback: &mut P,
    format: PcmFormat,
    command: &str,
    settings: RelaySettings,
    shutdown: &Shutdown,
) -> Result<SessionReport>
where
    C: CaptureDevice + ?Sized,
    P: PlaybackDevice + ?Sized,
{
    let mut process = LambdaProcess::spawn(command, &format, settings.reap_timeout)?;
    shutdown.attach(process.reaper());
    let pid = process.pid();

    let mut flow = FlowController::new(format, settings);
    let pipes = process
        .pipes_mut()
        .ok_or_else(|| BridgeError::Setup("lambda pipes unavailable".to_string()))?;

    log::info!(
        "Bridge running - {} bytes per cycle ({})",
        format.buffer_bytes(),
        format
    );

    let outcome = loop {
        if shutdown.is_requested() {
            break Ok(SessionEnd::Shutdown);
        }
        match flow.cycle(capture, playback, pipes) {
            Ok(Cycle::Continue) => {}
            // A lambda killed by the shutdown path looks like an exit.
            Ok(Cycle::Drain(_)) if shutdown.is_requested() => break Ok(SessionEnd::Shutdown),
            Ok(Cycle::Drain(DrainReason::LambdaExited)) => break Ok(SessionEnd::LambdaExited),
            Ok(Cycle::Drain(DrainReason::SourceEnded)) => break Ok(SessionEnd::SourceEnded),
            Err(e) => break Err(e),
        }
    };

    let result = match outcome {
        Ok(end) => flow.drain(playback, pipes).map(|_| end),
        Err(e) => {
            log::error!("Relay aborted: {}", e);
            Err(e)
        }
    };

    process.terminate();
    flow.finish();

    let end = result?;
    let stats = flow.stats().clone();
    log::info!(
        "Bridge stopped ({:?}): {} cycles, {} bytes in, {} bytes out",
        end,
        stats.cycles,
        stats.bytes_in,
        stats.bytes_out
    );

    Ok(SessionReport {
        format,
        pid,
        end,
        state: flow.state(),
        stats,
    })
}
