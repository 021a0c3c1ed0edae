use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频设备默认值
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub sample_rate: u32,
    pub channels: u32,
    pub buffer_size: usize,

    // lambda 子进程
    pub retry_pause_us: u64,
    pub reap_timeout_ms: u64,
    pub drain_timeout_ms: u64,

    // embedded device pair
    pub module_sink_name: &'static str,
    pub module_source_name: &'static str,
    pub module_pipe_buf_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            sample_rate: env!("SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SAMPLE_RATE")?,
            channels: env!("CHANNELS").parse()
                .map_err(|_| "Failed to parse CHANNELS")?,
            buffer_size: env!("BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse BUFFER_SIZE")?,

            retry_pause_us: env!("RETRY_PAUSE_US").parse()
                .map_err(|_| "Failed to parse RETRY_PAUSE_US")?,
            reap_timeout_ms: env!("REAP_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse REAP_TIMEOUT_MS")?,
            drain_timeout_ms: env!("DRAIN_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse DRAIN_TIMEOUT_MS")?,

            module_sink_name: env!("MODULE_SINK_NAME"),
            module_source_name: env!("MODULE_SOURCE_NAME"),
            module_pipe_buf_size: env!("MODULE_PIPE_BUF_SIZE").parse()
                .map_err(|_| "Failed to parse MODULE_PIPE_BUF_SIZE")?,
        })
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            retry_pause: Duration::from_micros(self.retry_pause_us),
            reap_timeout: Duration::from_millis(self.reap_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

/// Timing knobs shared by both host integrations.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Pause between write attempts when the lambda's stdin is full
    pub retry_pause: Duration,
    /// Upper bound on waiting for the lambda to be reaped after SIGTERM
    pub reap_timeout: Duration,
    /// Upper bound on flushing lambda output once input has stopped
    pub drain_timeout: Duration,
}

/// Immutable configuration of one standalone bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub source: String,
    /// ALSA playback device name
    pub sink: String,
    /// Shell command line run as the lambda
    pub command: String,
    /// Requested sample rate; the hardware may negotiate another one
    pub sample_rate: u32,
    /// Requested channel count
    pub channels: u32,
    /// Requested period size in frames
    pub buffer_size: usize,
}

impl BridgeConfig {
    /// Builds a configuration from build-time defaults, leaving device
    /// names at the configured defaults.
    pub fn with_defaults(config: &Config, command: impl Into<String>) -> Self {
        Self {
            source: config.capture_device.to_string(),
            sink: config.playback_device.to_string(),
            command: command.into(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            buffer_size: config.buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baked_defaults_parse() {
        let config = Config::new().unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.module_sink_name, "lambda_sink");
        assert_eq!(config.module_source_name, "lambda_source");

        let settings = config.relay_settings();
        assert_eq!(settings.retry_pause, Duration::from_micros(100));
        assert_eq!(settings.reap_timeout, Duration::from_secs(2));
    }

    #[test]
    fn bridge_config_uses_default_devices() {
        let config = Config::new().unwrap();
        let bridge = BridgeConfig::with_defaults(&config, "cat");
        assert_eq!(bridge.source, "default");
        assert_eq!(bridge.sink, "default");
        assert_eq!(bridge.command, "cat");
    }
}
