//! relay - moves PCM from the capture side through the lambda and back
//!
//! `flow` holds the per-cycle algorithm both host integrations share;
//! `session` drives it against a pair of devices until the lambda exits,
//! the source ends, or shutdown is requested.

mod flow;
mod session;

pub use flow::{Cycle, Delivery, DrainReason, FlowController, Pull, Push};
pub use session::{run_session, SessionEnd, SessionReport, Shutdown};

/// Lifecycle of one bridge instance. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Device and lambda setup; any failure aborts here
    Starting,
    /// Steady-state relay
    Running,
    /// No new input accepted, remaining lambda output flushed
    Draining,
    /// All resources released
    Stopped,
}

/// Counters kept by the flow controller.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub cycles: u64,
    /// Bytes delivered to the lambda
    pub bytes_in: u64,
    /// Bytes read back from the lambda
    pub bytes_out: u64,
    /// Write attempts that hit a full pipe
    pub stalled_writes: u64,
    /// Reads that found nothing available
    pub empty_reads: u64,
    /// Reads whose size was not a whole number of frames
    pub partial_frames: u64,
}
