use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use pa_lambda::config::{BridgeConfig, Config};
use pa_lambda::error::BridgeError;
use pa_lambda::relay::{SessionEnd, Shutdown};
use pa_lambda::standalone::StandaloneRunner;

/// Relay live audio from a capture device through an external command and
/// back out to a playback device.
#[derive(Parser, Debug)]
#[command(name = "pa-lambda")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Capture device to read from (default: the configured default device)
    #[arg(short = 's', long = "source", value_name = "NAME")]
    source: Option<String>,

    /// Playback device to write to
    #[arg(short = 'o', long = "sink", value_name = "NAME")]
    sink: Option<String>,

    /// Requested sample rate in Hz
    #[arg(short = 'r', long, value_name = "HZ")]
    rate: Option<u32>,

    /// Requested channel count
    #[arg(short = 'c', long, value_name = "N")]
    channels: Option<u32>,

    /// Requested period size in frames
    #[arg(short = 'b', long = "buffer-size", value_name = "FRAMES")]
    buffer_size: Option<usize>,

    /// Transform command, run through /bin/sh; may be a pipeline. Put it
    /// after `--` if it starts with a hyphen
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn into_bridge_config(self, config: &Config) -> BridgeConfig {
        let mut bridge = BridgeConfig::with_defaults(config, self.command.join(" "));
        if let Some(source) = self.source {
            bridge.source = source;
        }
        if let Some(sink) = self.sink {
            bridge.sink = sink;
        }
        if let Some(rate) = self.rate {
            bridge.sample_rate = rate;
        }
        if let Some(channels) = self.channels {
            bridge.channels = channels;
        }
        if let Some(buffer_size) = self.buffer_size {
            bridge.buffer_size = buffer_size;
        }
        bridge
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // 初始化日志，默认 info 级别
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<BridgeError>() {
                Some(err) if err.is_setup() => log::error!("Bridge failed to start: {:#}", e),
                _ => log::error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // 加载编译时配置
    let config = Config::new().map_err(|e| BridgeError::Setup(e.to_string()))?;
    let bridge = cli.into_bridge_config(&config);
    if bridge.command.trim().is_empty() {
        return Err(BridgeError::Usage("transform command is empty".to_string()).into());
    }

    log::info!("{} {} starting", config.app_name, config.app_version);

    let shutdown = Shutdown::new();
    let mut runner = StandaloneRunner::start(bridge, config.relay_settings(), shutdown.clone())?;
    let mut sigterm = unix_signal(SignalKind::terminate())?;

    let report = loop {
        tokio::select! {
            result = runner.finished() => break result?,

            // 监听 Ctrl+C / SIGTERM
            _ = signal::ctrl_c() => request_shutdown(&shutdown, "SIGINT").await,
            _ = sigterm.recv() => request_shutdown(&shutdown, "SIGTERM").await,
        }
    };

    match report.end {
        SessionEnd::Shutdown => log::info!("Shut down on signal"),
        SessionEnd::LambdaExited => log::info!("Lambda exited, bridge stopped"),
        SessionEnd::SourceEnded => log::info!("Capture source ended, bridge stopped"),
    }
    Ok(())
}

/// Tear the lambda down off the async threads; the relay thread notices
/// on its next cycle.
async fn request_shutdown(shutdown: &std::sync::Arc<Shutdown>, name: &str) {
    if shutdown.is_requested() {
        log::info!("Received {} again, already shutting down", name);
        return;
    }
    log::info!("Received {}, shutting down...", name);
    let shutdown = shutdown.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || shutdown.trigger()).await {
        log::error!("Shutdown task failed: {}", e);
    }
}
