use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    lambda: Lambda,
    module: Module,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u32,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Lambda {
    retry_pause_us: u64,
    reap_timeout_ms: u64,
    drain_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Module {
    sink_name: String,
    source_name: String,
    pipe_buf_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 音频设备默认值
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=BUFFER_SIZE={}", config.audio.buffer_size);

    // lambda 子进程
    println!("cargo:rustc-env=RETRY_PAUSE_US={}", config.lambda.retry_pause_us);
    println!("cargo:rustc-env=REAP_TIMEOUT_MS={}", config.lambda.reap_timeout_ms);
    println!("cargo:rustc-env=DRAIN_TIMEOUT_MS={}", config.lambda.drain_timeout_ms);

    // embedded device pair
    println!("cargo:rustc-env=MODULE_SINK_NAME={}", config.module.sink_name);
    println!("cargo:rustc-env=MODULE_SOURCE_NAME={}", config.module.source_name);
    println!("cargo:rustc-env=MODULE_PIPE_BUF_SIZE={}", config.module.pipe_buf_size);
}
