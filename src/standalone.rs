//! Standalone host integration: the bridge owns an ALSA capture and
//! playback PCM and runs the relay on its own thread.
//!
//! Uses std::thread (NOT tokio tasks) for the blocking device I/O; the
//! async side only waits for completion and delivers signals.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::audio::{alsa_device, AlsaCapture, AlsaPlayback, PcmFormat, PcmRequest};
use crate::config::{BridgeConfig, RelaySettings};
use crate::error::{BridgeError, Result};
use crate::relay::{run_session, SessionReport, Shutdown};

pub struct StandaloneRunner {
    thread: Option<JoinHandle<()>>,
    done: oneshot::Receiver<Result<SessionReport>>,
}

impl StandaloneRunner {
    /// Start the relay thread. Devices are opened and the lambda spawned
    /// on that thread; failures arrive through [`StandaloneRunner::finished`].
    pub fn start(config: BridgeConfig, settings: RelaySettings, shutdown: Arc<Shutdown>) -> Result<Self> {
        let (done_tx, done) = oneshot::channel();

        log::info!(
            "Standalone bridge starting, source: \"{}\", sink: \"{}\", lambda: {}",
            config.source,
            config.sink,
            config.command,
        );

        let thread = thread::Builder::new()
            .name("lambda-relay".into())
            .spawn(move || {
                let result = relay_thread(&config, settings, &shutdown);
                if let Err(e) = &result {
                    log::error!("Relay thread error: {}", e);
                }
                // The receiver may be gone if main is already exiting.
                let _ = done_tx.send(result);
            })
            .map_err(|e| BridgeError::Setup(format!("Failed to start relay thread: {}", e)))?;

        Ok(Self {
            thread: Some(thread),
            done,
        })
    }

    /// Wait for the relay to stop. Must not be polled again once it has
    /// returned.
    pub async fn finished(&mut self) -> Result<SessionReport> {
        let result = (&mut self.done)
            .await
            .unwrap_or_else(|_| Err(BridgeError::Setup("relay thread panicked".to_string())));
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        result
    }
}

fn relay_thread(config: &BridgeConfig, settings: RelaySettings, shutdown: &Shutdown) -> Result<SessionReport> {
    // 1. Capture decides the format; playback must agree with it.
    let requested = PcmRequest {
        sample_rate: config.sample_rate,
        channels: config.channels,
        period_frames: config.buffer_size,
    };
    let (capture_pcm, capture_params) = alsa_device::open_capture(&config.source, &requested)
        .map_err(|e| BridgeError::device(&config.source, format!("{:#}", e)))?;
    let format = PcmFormat::negotiated(&capture_params);

    let negotiated = PcmRequest {
        sample_rate: format.sample_rate,
        channels: format.channels,
        period_frames: format.buffer_frames,
    };
    let (playback_pcm, playback_params) = alsa_device::open_playback(&config.sink, &negotiated)
        .map_err(|e| BridgeError::device(&config.sink, format!("{:#}", e)))?;

    if playback_params.sample_rate != format.sample_rate || playback_params.channels != format.channels {
        return Err(BridgeError::Setup(format!(
            "playback device '{}' negotiated {}Hz/{}ch, capture uses {}Hz/{}ch",
            config.sink,
            playback_params.sample_rate,
            playback_params.channels,
            format.sample_rate,
            format.channels
        )));
    }
    if format.sample_rate != config.sample_rate {
        log::warn!(
            "Requested {}Hz, device negotiated {}Hz",
            config.sample_rate,
            format.sample_rate
        );
    }

    let mut capture = AlsaCapture::new(&config.source, capture_pcm, &capture_params);
    let mut playback = AlsaPlayback::new(&config.sink, playback_pcm, &playback_params);

    // 2. Relay until the lambda exits or shutdown is requested.
    run_session(&mut capture, &mut playback, format, &config.command, settings, shutdown)
}
