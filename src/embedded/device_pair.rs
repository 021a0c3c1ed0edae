//! A virtual sink/source pair registered with a host audio server, relayed
//! through the lambda by a dedicated real-time thread.
//!
//! Threads involved:
//!   - the host thread that calls [`DevicePair::load`], [`DevicePair::query_latency`]
//!     and [`DevicePair::unload`]
//!   - `lambda-rt`: sole owner of the pipe endpoints; polls the lambda's
//!     stdout and a wake-up socket, and renders one window per period.
//!     It never blocks on the lambda's stdin: a window the pipe cannot take
//!     is held until the pipe is writable again, and rendering pauses
//!     meanwhile
//!
//! They share nothing except the host's own queues and the message queue.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use crate::audio::PcmFormat;
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::lambda::{LambdaPipes, LambdaProcess, Reaper};
use crate::relay::{Delivery, FlowController, Pull, Push, SessionState};

use super::host::{DeviceKind, HostServer, VirtualDevice};
use super::modargs::ModuleArgs;

enum ThreadMessage {
    GetLatency {
        kind: DeviceKind,
        reply: oneshot::Sender<Duration>,
    },
    Shutdown,
}

/// Sending half of the real-time thread's message queue.
struct ThreadMq {
    tx: mpsc::UnboundedSender<ThreadMessage>,
    wake: UnixStream,
}

impl ThreadMq {
    fn send(&self, message: ThreadMessage) -> bool {
        if self.tx.send(message).is_err() {
            return false;
        }
        match (&self.wake).write(&[1]) {
            // A full socket already holds a pending wake-up.
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(e) => {
                log::warn!("Failed to wake lambda thread: {}", e);
                false
            }
        }
    }
}

pub struct DevicePair<H: HostServer> {
    host: Arc<H>,
    sink: VirtualDevice,
    source: VirtualDevice,
    format: PcmFormat,
    process: LambdaProcess,
    mq: Option<ThreadMq>,
    thread: Option<JoinHandle<LambdaPipes>>,
    registered: bool,
}

impl<H: HostServer> DevicePair<H> {
    /// Parse `args`, spawn the lambda, start the real-time thread and
    /// register the pair with `host`.
    pub fn load(host: Arc<H>, args: &str, config: &Config) -> Result<Self> {
        let args = ModuleArgs::parse(args, config)?;
        let (spec, channel_map) = args.resolve(host.default_sample_spec())?;

        // One relay window is one pipe read; it also sets the render period.
        let window_frames = (config.module_pipe_buf_size / spec.bytes_per_frame()).max(1);
        let format = PcmFormat::s16le(spec.rate, spec.channels, window_frames);

        let sink = VirtualDevice {
            name: args.sink_name.clone(),
            description: "Lambda Sink".to_string(),
            kind: DeviceKind::Sink,
            spec,
            channel_map: channel_map.clone(),
        };
        let source = VirtualDevice {
            name: args.source_name.clone(),
            description: "Lambda Source".to_string(),
            kind: DeviceKind::Source,
            spec,
            channel_map,
        };

        let settings = config.relay_settings();
        let mut process = LambdaProcess::spawn(&args.lambda_command, &format, settings.reap_timeout)?;
        let pipes = process
            .take_pipes()
            .ok_or_else(|| BridgeError::Setup("lambda pipes unavailable".to_string()))?;

        let (wake, wake_rx) = UnixStream::pair().map_err(BridgeError::Pipe)?;
        wake.set_nonblocking(true).map_err(BridgeError::Pipe)?;
        wake_rx.set_nonblocking(true).map_err(BridgeError::Pipe)?;
        let (tx, inbox) = mpsc::unbounded_channel();

        let rt = RtThread {
            host: host.clone(),
            flow: FlowController::new(format, settings),
            pipes,
            inbox,
            wake: wake_rx,
            window: vec![0u8; format.buffer_bytes()],
            pending: None,
            window_frames,
            period: format.period(),
        };
        let thread = thread::Builder::new()
            .name("lambda-rt".into())
            .spawn(move || rt.run())
            .map_err(|e| BridgeError::Setup(format!("Failed to start lambda thread: {}", e)))?;

        // From here on Drop runs the full unload if registration fails.
        let mut pair = Self {
            host,
            sink,
            source,
            format,
            process,
            mq: Some(ThreadMq { tx, wake }),
            thread: Some(thread),
            registered: false,
        };

        pair.host.register(&pair.sink, &pair.source)?;
        pair.registered = true;

        log::info!(
            "Loaded device pair {} / {} ({}, map {}) through lambda PID {}",
            pair.sink.name,
            pair.source.name,
            pair.format,
            pair.sink.channel_map,
            pair.process.pid()
        );
        Ok(pair)
    }

    pub fn sink(&self) -> &VirtualDevice {
        &self.sink
    }

    pub fn source(&self) -> &VirtualDevice {
        &self.source
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub fn reaper(&self) -> Arc<Reaper> {
        self.process.reaper()
    }

    /// Latency of either device, answered by the real-time thread. Always
    /// zero: whatever the lambda adds is not measured.
    pub fn query_latency(&self, kind: DeviceKind) -> Result<Duration> {
        let (reply, answer) = oneshot::channel();
        let sent = self
            .mq
            .as_ref()
            .is_some_and(|mq| mq.send(ThreadMessage::GetLatency { kind, reply }));
        if !sent {
            return Err(BridgeError::Setup("lambda thread is not running".to_string()));
        }
        answer
            .blocking_recv()
            .map_err(|_| BridgeError::Setup("lambda thread dropped a latency query".to_string()))
    }

    /// Two-phase teardown: unlink both devices, stop and join the real-time
    /// thread, then reap the lambda and close its pipes. Safe to call more
    /// than once.
    pub fn unload(&mut self) {
        if self.registered {
            self.host.unlink();
            self.registered = false;
        }

        if let Some(mq) = self.mq.take() {
            mq.send(ThreadMessage::Shutdown);
        }
        let pipes = match self.thread.take().map(JoinHandle::join) {
            Some(Ok(pipes)) => Some(pipes),
            Some(Err(_)) => {
                log::error!("Lambda thread for {} panicked", self.sink.name);
                None
            }
            None => None,
        };

        if self.process.terminate() {
            log::info!("Unloaded device pair {} / {}", self.sink.name, self.source.name);
        }
        drop(pipes);
    }
}

impl<H: HostServer> Drop for DevicePair<H> {
    fn drop(&mut self) {
        self.unload();
    }
}

enum Exit {
    Shutdown,
    LambdaLost,
}

struct RtThread<H: HostServer> {
    host: Arc<H>,
    flow: FlowController,
    pipes: LambdaPipes,
    inbox: mpsc::UnboundedReceiver<ThreadMessage>,
    wake: UnixStream,
    window: Vec<u8>,
    // Rendered audio the lambda's stdin has not taken yet.
    pending: Option<Bytes>,
    window_frames: usize,
    period: Duration,
}

#[derive(Default)]
struct Ready {
    woken: bool,
    readable: bool,
    writable: bool,
}

impl<H: HostServer> RtThread<H> {
    /// Relay until shut down; hands the pipes back for the final teardown.
    fn run(mut self) -> LambdaPipes {
        log::debug!("Lambda thread starting up");
        self.flow.transition(SessionState::Running);

        if let Exit::LambdaLost = self.relay() {
            // Isolated to this pair: ask the host to unload us, then idle
            // until it does.
            self.flow.transition(SessionState::Draining);
            self.host.request_unload();
            self.wait_for_shutdown();
        }

        self.flow.finish();
        let stats = self.flow.stats();
        log::debug!(
            "Lambda thread shutting down: {} bytes in, {} bytes out, {} partial frames",
            stats.bytes_in,
            stats.bytes_out,
            stats.partial_frames
        );
        self.pipes
    }

    fn relay(&mut self) -> Exit {
        let mut next_tick = Instant::now();
        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            let ready = match self.wait(timeout) {
                Ok(ready) => ready,
                Err(e) => {
                    log::error!("Lambda thread poll failed: {}", e);
                    return Exit::LambdaLost;
                }
            };

            if ready.woken && self.handle_messages() {
                return Exit::Shutdown;
            }

            if ready.readable {
                match self.flow.collect(self.pipes.output(), &mut self.window) {
                    Ok(Pull::Data(n)) => self.host.post(Bytes::copy_from_slice(&self.window[..n])),
                    Ok(Pull::Pending) => {}
                    Ok(Pull::Eof) => {
                        log::info!("Lambda process ended");
                        return Exit::LambdaLost;
                    }
                    Err(_) => return Exit::LambdaLost,
                }
            }

            if ready.writable && !matches!(self.flush(), Ok(Delivery::Delivered)) {
                return Exit::LambdaLost;
            }

            let now = Instant::now();
            if now >= next_tick {
                if !matches!(self.render(), Ok(Delivery::Delivered)) {
                    return Exit::LambdaLost;
                }
                next_tick += self.period;
                if next_tick < now {
                    next_tick = now + self.period;
                }
            }
        }
    }

    /// Pull one window from the sink and push it into the lambda. Skipped
    /// while an earlier window is still waiting for room in the pipe.
    fn render(&mut self) -> Result<Delivery> {
        if self.pending.is_some() {
            log::trace!("Lambda input still full, not rendering");
            return Ok(Delivery::Delivered);
        }
        let Some(chunk) = self.host.render(self.window_frames) else {
            return Ok(Delivery::Delivered);
        };
        self.pending = Some(chunk);
        self.flush()
    }

    /// Push held audio into the lambda without blocking; whatever does not
    /// fit stays held for the next writable wake-up.
    fn flush(&mut self) -> Result<Delivery> {
        let Some(chunk) = self.pending.take() else {
            return Ok(Delivery::Delivered);
        };
        let Some(input) = self.pipes.input() else {
            return Ok(Delivery::LambdaGone);
        };
        match self.flow.push(input, &chunk)? {
            Push::Accepted(n) if n < chunk.len() => {
                self.pending = Some(chunk.slice(n..));
                Ok(Delivery::Delivered)
            }
            Push::Accepted(_) => Ok(Delivery::Delivered),
            Push::LambdaGone => Ok(Delivery::LambdaGone),
        }
    }

    /// Block until a message arrives, the lambda's stdout is readable, its
    /// stdin has room for held audio, or `timeout` passes.
    fn wait(&self, timeout: Duration) -> nix::Result<Ready> {
        // Round up so a sub-millisecond remainder does not spin.
        let millis = timeout.as_micros().div_ceil(1000).min(u16::MAX as u128) as u16;
        let timeout = PollTimeout::from(millis);
        let input = self.pending.as_ref().and(self.pipes.input_fd());
        let mut fds = [
            PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.pipes.output_fd(), PollFlags::POLLIN),
            PollFd::new(input.unwrap_or(self.wake.as_fd()), PollFlags::POLLOUT),
        ];
        let watched = if input.is_some() { 3 } else { 2 };
        match poll(&mut fds[..watched], timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Ready::default()),
            Err(e) => return Err(e),
        }
        let fired = |fd: &PollFd, flags: PollFlags| {
            fd.revents()
                .is_some_and(|r| r.intersects(flags | PollFlags::POLLHUP | PollFlags::POLLERR))
        };
        Ok(Ready {
            woken: fired(&fds[0], PollFlags::POLLIN),
            readable: fired(&fds[1], PollFlags::POLLIN),
            writable: watched == 3 && fired(&fds[2], PollFlags::POLLOUT),
        })
    }

    /// Drain the wake-up socket and answer queued messages. Returns `true`
    /// once shutdown was requested.
    fn handle_messages(&mut self) -> bool {
        let mut scratch = [0u8; 64];
        while matches!((&self.wake).read(&mut scratch), Ok(n) if n > 0) {}

        loop {
            match self.inbox.try_recv() {
                Ok(ThreadMessage::GetLatency { kind, reply }) => {
                    log::trace!("Latency query for {}", kind);
                    let _ = reply.send(Duration::ZERO);
                }
                Ok(ThreadMessage::Shutdown) => return true,
                Err(TryRecvError::Empty) => return false,
                // The pair is gone without saying goodbye.
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn wait_for_shutdown(&mut self) {
        loop {
            let mut fds = [PollFd::new(self.wake.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    log::error!("Lambda thread poll failed while idle: {}", e);
                    return;
                }
            }
            if self.handle_messages() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleEncoding;
    use crate::embedded::{ChannelMap, SampleSpec};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockHost {
        // What applications played into the sink.
        playing: Mutex<VecDeque<u8>>,
        // What recording applications received from the source.
        recorded: Mutex<Vec<u8>>,
        registered: Mutex<Vec<String>>,
        unlinked: AtomicBool,
        unlinks: AtomicUsize,
        unload_requested: AtomicBool,
        refuse_register: bool,
    }

    impl MockHost {
        fn playing(data: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                playing: Mutex::new(data.iter().copied().collect()),
                ..Self::default()
            })
        }

        fn queued(&self) -> usize {
            self.playing.lock().unwrap().len()
        }

        fn recorded_len(&self) -> usize {
            self.recorded.lock().unwrap().len()
        }
    }

    impl HostServer for MockHost {
        fn default_sample_spec(&self) -> (SampleSpec, ChannelMap) {
            let spec = SampleSpec {
                encoding: SampleEncoding::S16Le,
                rate: 8000,
                channels: 1,
            };
            (spec, ChannelMap::default_for(1))
        }

        fn register(&self, sink: &VirtualDevice, source: &VirtualDevice) -> Result<()> {
            if self.refuse_register {
                return Err(BridgeError::Setup("name already taken".to_string()));
            }
            let mut names = self.registered.lock().unwrap();
            names.push(sink.name.clone());
            names.push(source.name.clone());
            Ok(())
        }

        fn render(&self, requested_frames: usize) -> Option<Bytes> {
            if self.unlinked.load(Ordering::SeqCst) {
                return None;
            }
            let mut playing = self.playing.lock().unwrap();
            let n = playing.len().min(requested_frames * 2);
            if n == 0 {
                return None;
            }
            Some(playing.drain(..n).collect::<Vec<u8>>().into())
        }

        fn post(&self, chunk: Bytes) {
            // An unlinked source has no listeners left.
            if self.unlinked.load(Ordering::SeqCst) {
                return;
            }
            self.recorded.lock().unwrap().extend_from_slice(&chunk);
        }

        fn unlink(&self) {
            self.unlinked.store(true, Ordering::SeqCst);
            self.unlinks.fetch_add(1, Ordering::SeqCst);
        }

        fn request_unload(&self) {
            self.unload_requested.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> Config {
        let mut config = Config::new().unwrap();
        // 256 mono frames at 8 kHz: a 32 ms render period.
        config.module_pipe_buf_size = 512;
        config.reap_timeout_ms = 500;
        config
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn cat_passes_sink_audio_to_source() {
        let audio: Vec<u8> = (0..4000u32).map(|i| (i % 253) as u8).collect();
        let host = MockHost::playing(&audio);
        let mut pair = DevicePair::load(host.clone(), "lambda_command=cat", &config()).unwrap();

        assert_eq!(*host.registered.lock().unwrap(), vec!["lambda_sink", "lambda_source"]);
        assert_eq!(pair.format().buffer_frames, 256);
        assert_eq!(pair.sink().description, "Lambda Sink");

        wait_until("lambda output", || host.recorded_len() >= audio.len());
        pair.unload();
        assert_eq!(*host.recorded.lock().unwrap(), audio);
    }

    #[test]
    fn latency_is_always_zero() {
        let host = MockHost::playing(&[]);
        let pair = DevicePair::load(host, "lambda_command=cat rate=44100 channels=2", &config()).unwrap();
        assert_eq!(pair.source().spec.channels, 2);
        assert_eq!(pair.query_latency(DeviceKind::Sink).unwrap(), Duration::ZERO);
        assert_eq!(pair.query_latency(DeviceKind::Source).unwrap(), Duration::ZERO);
    }

    #[test]
    fn lambda_exit_requests_unload() {
        let host = MockHost::playing(&[0; 64]);
        let mut pair = DevicePair::load(host.clone(), "lambda_command=true", &config()).unwrap();

        wait_until("unload request", || host.unload_requested.load(Ordering::SeqCst));
        // The idle thread still answers queries until it is shut down.
        assert_eq!(pair.query_latency(DeviceKind::Sink).unwrap(), Duration::ZERO);

        pair.unload();
        assert!(pair.reaper().is_reaped());
        assert!(pair.query_latency(DeviceKind::Sink).is_err());
    }

    #[test]
    fn unload_is_two_phase_and_idempotent() {
        let host = MockHost::playing(&[]);
        let mut pair = DevicePair::load(host.clone(), "lambda_command='sleep 30'", &config()).unwrap();
        let reaper = pair.reaper();

        pair.unload();
        assert!(host.unlinked.load(Ordering::SeqCst));
        assert!(reaper.is_reaped());

        pair.unload();
        drop(pair);
        assert_eq!(host.unlinks.load(Ordering::SeqCst), 1);
        assert!(!host.unload_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn lambda_that_stops_reading_does_not_block_unload() {
        let queued = 1 << 20;
        let host = MockHost::playing(&vec![0u8; queued]);
        let mut config = config();
        // 8192 mono frames at 384 kHz: a full pipe within a few periods.
        config.module_pipe_buf_size = 16384;
        let mut pair =
            DevicePair::load(host.clone(), "lambda_command='sleep 30' rate=384000", &config).unwrap();

        wait_until("the lambda's stdin to fill", || host.queued() < queued - 32768);
        thread::sleep(Duration::from_millis(200));

        // Rendering pauses while the pipe is full; the thread stays responsive.
        let held = host.queued();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(host.queued(), held);
        assert!(held > 0);
        assert_eq!(pair.query_latency(DeviceKind::Source).unwrap(), Duration::ZERO);

        let reaper = pair.reaper();
        let (done_tx, done) = std::sync::mpsc::channel();
        thread::spawn(move || {
            pair.unload();
            let _ = done_tx.send(());
        });
        assert!(
            done.recv_timeout(Duration::from_secs(5)).is_ok(),
            "unload hung on a lambda with a full stdin"
        );
        assert!(reaper.is_reaped());
        assert!(host.unlinked.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_registration_tears_down() {
        let host = Arc::new(MockHost {
            refuse_register: true,
            ..MockHost::default()
        });
        let err = DevicePair::load(host.clone(), "lambda_command=cat", &config())
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Setup(_)));
        // Never registered, so never unlinked.
        assert_eq!(host.unlinks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bad_arguments_never_spawn() {
        let host = MockHost::playing(&[]);
        let err = DevicePair::load(host.clone(), "sink_name=x", &config()).err().unwrap();
        assert!(matches!(err, BridgeError::ModuleArgs(_)));
        assert!(host.registered.lock().unwrap().is_empty());
    }
}
