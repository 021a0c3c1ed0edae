//! Lambda process lifecycle: spawn behind a shell, hand out the two pipe
//! endpoints, and tear everything down exactly once.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::audio::PcmFormat;
use crate::error::{BridgeError, Result};

const SHELL: &str = "/bin/sh";
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(5);
const REAP_GRACE: Duration = Duration::from_secs(1);

/// The bridge's ends of the lambda's stdin and stdout, both non-blocking.
pub struct LambdaPipes {
    input: Option<ChildStdin>,
    output: ChildStdout,
}

impl LambdaPipes {
    /// Bridge → lambda endpoint, `None` once input has been closed.
    pub fn input(&mut self) -> Option<&mut ChildStdin> {
        self.input.as_mut()
    }

    /// Lambda → bridge endpoint.
    pub fn output(&mut self) -> &mut ChildStdout {
        &mut self.output
    }

    /// Both endpoints at once, for writing while draining output.
    pub fn split(&mut self) -> (Option<&mut ChildStdin>, &mut ChildStdout) {
        (self.input.as_mut(), &mut self.output)
    }

    pub fn output_fd(&self) -> BorrowedFd<'_> {
        self.output.as_fd()
    }

    pub fn input_fd(&self) -> Option<BorrowedFd<'_>> {
        self.input.as_ref().map(|input| input.as_fd())
    }

    /// Close the lambda's stdin so it sees end-of-stream. Returns whether
    /// the endpoint was still open.
    pub fn close_input(&mut self) -> bool {
        self.input.take().is_some()
    }
}

/// Signals and reaps the lambda at most once, from whichever side gets
/// there first: the relay's normal exit path or an asynchronous shutdown.
pub struct Reaper {
    pid: Pid,
    child: Mutex<Child>,
    cleaned_up: AtomicBool,
    reaped: AtomicBool,
    timeout: Duration,
}

impl Reaper {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    /// SIGTERM the lambda's process group and wait up to the configured
    /// timeout for it to be reaped, escalating to SIGKILL after that.
    ///
    /// Returns `true` only for the call that actually did the teardown.
    /// A later call returns once that teardown has finished reaping.
    pub fn terminate(&self) -> bool {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            log::debug!("Lambda {} already cleaned up", self.pid);
            self.await_reap();
            return false;
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);

        match child.try_wait() {
            Ok(Some(status)) => {
                log::info!("Lambda {} had already exited ({})", self.pid, status);
                self.reaped.store(true, Ordering::SeqCst);
                return true;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to query lambda {}: {}", self.pid, e),
        }

        // The lambda leads its own process group, so a pipeline under the
        // shell goes down with it.
        if let Err(e) = killpg(self.pid, Signal::SIGTERM) {
            if e != Errno::ESRCH {
                log::warn!("Failed to signal lambda {}: {}", self.pid, e);
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("Lambda {} terminated ({})", self.pid, status);
                    self.reaped.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL_INTERVAL),
                Ok(None) => {
                    log::warn!(
                        "Lambda {} ignored SIGTERM for {:?}, killing",
                        self.pid,
                        self.timeout
                    );
                    let _ = killpg(self.pid, Signal::SIGKILL);
                    match child.wait() {
                        Ok(status) => {
                            log::info!("Lambda {} killed ({})", self.pid, status);
                            self.reaped.store(true, Ordering::SeqCst);
                        }
                        Err(e) => log::error!("Failed to reap lambda {}: {}", self.pid, e),
                    }
                    break;
                }
                Err(e) => {
                    log::error!("Failed to reap lambda {}: {}", self.pid, e);
                    break;
                }
            }
        }
        true
    }

    // Another caller owns the teardown; it may not have taken the lock yet.
    fn await_reap(&self) {
        let deadline = Instant::now() + self.timeout + REAP_GRACE;
        while !self.is_reaped() && Instant::now() < deadline {
            drop(self.child.lock().unwrap_or_else(PoisonError::into_inner));
            if self.is_reaped() {
                break;
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }
    }
}

/// A running lambda: `/bin/sh -c <command>` with the PCM format in its
/// environment, stdin and stdout wired to the bridge.
pub struct LambdaProcess {
    pipes: Option<LambdaPipes>,
    reaper: Arc<Reaper>,
}

impl LambdaProcess {
    pub fn spawn(command: &str, format: &PcmFormat, reap_timeout: Duration) -> Result<Self> {
        let spawn_error = |source: io::Error| BridgeError::Spawn {
            command: command.to_string(),
            source,
        };

        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .envs(format.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(spawn_error)?;

        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        // From here on Drop tears the child down if setup fails.
        let mut process = Self {
            pipes: None,
            reaper: Arc::new(Reaper {
                pid,
                child: Mutex::new(child),
                cleaned_up: AtomicBool::new(false),
                reaped: AtomicBool::new(false),
                timeout: reap_timeout,
            }),
        };

        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(spawn_error(io::Error::other("lambda pipes were not created")));
        };
        set_nonblocking(stdin.as_raw_fd()).map_err(|e| spawn_error(e.into()))?;
        set_nonblocking(stdout.as_raw_fd()).map_err(|e| spawn_error(e.into()))?;

        process.pipes = Some(LambdaPipes {
            input: Some(stdin),
            output: stdout,
        });

        log::info!("Lambda process spawned with PID {}: {}", pid, command);
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.reaper.pid()
    }

    pub fn pipes_mut(&mut self) -> Option<&mut LambdaPipes> {
        self.pipes.as_mut()
    }

    /// Move the pipe endpoints to another owner, e.g. a relay thread.
    pub fn take_pipes(&mut self) -> Option<LambdaPipes> {
        self.pipes.take()
    }

    /// Handle for tearing the lambda down from outside the owning thread.
    pub fn reaper(&self) -> Arc<Reaper> {
        self.reaper.clone()
    }

    /// Signal, reap, then close whatever descriptors are still held here.
    /// The descriptors are only dropped after the child has been reaped,
    /// even when another thread is doing the reaping. Safe to call any
    /// number of times.
    pub fn terminate(&mut self) -> bool {
        let performed = self.reaper.terminate();
        self.pipes.take();
        performed
    }
}

impl Drop for LambdaProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
