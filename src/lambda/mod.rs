//! lambda - the external transform process
//!
//! Spawns the user's command behind `/bin/sh -c`, wires its stdin/stdout to
//! non-blocking pipes and owns its teardown.

mod process;

pub use process::{LambdaPipes, LambdaProcess, Reaper};
