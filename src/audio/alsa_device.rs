//! Opening ALSA PCMs in the relay's one encoding (S16LE, interleaved).

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Periods kept in the hardware ring buffer.
const PERIODS_PER_BUFFER: Frames = 4;

/// What the bridge asks the hardware for. The device may settle on
/// something close instead.
#[derive(Debug, Clone, Copy)]
pub struct PcmRequest {
    pub sample_rate: u32,
    pub channels: u32,
    pub period_frames: usize,
}

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per period; one relay cycle
    pub period_size: usize,
    /// Frames in the whole hardware ring buffer
    pub buffer_size: usize,
}

pub fn open_capture(device: &str, request: &PcmRequest) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, request)
}

/// Playback starts as soon as one period is queued so lambda output is
/// heard without waiting for the ring buffer to fill.
pub fn open_playback(device: &str, request: &PcmRequest) -> Result<(PCM, AlsaParams)> {
    let (pcm, params) = open_pcm(device, Direction::Playback, request)?;
    {
        let swp = pcm.sw_params_current()?;
        swp.set_start_threshold(params.period_size as Frames)?;
        pcm.sw_params(&swp)
            .with_context(|| format!("Failed to apply sw params on '{}'", device))?;
    }
    Ok((pcm, params))
}

fn open_pcm(device: &str, direction: Direction, request: &PcmRequest) -> Result<(PCM, AlsaParams)> {
    let label = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open '{}' for {}", device, label))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)
            .with_context(|| format!("'{}' does not support s16le", device))?;
        hwp.set_channels(request.channels)
            .with_context(|| format!("{} channels not supported by '{}'", request.channels, device))?;
        hwp.set_rate_near(request.sample_rate, ValueOr::Nearest)?;
        let period = hwp.set_period_size_near(request.period_frames as Frames, ValueOr::Nearest)?;
        hwp.set_buffer_size_near(period * PERIODS_PER_BUFFER)?;
        pcm.hw_params(&hwp)
            .with_context(|| format!("Failed to apply hw params on '{}'", device))?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    pcm.prepare()
        .with_context(|| format!("Failed to prepare '{}'", device))?;

    log::info!(
        "ALSA {} on {}: {}Hz, {} channels, period {} frames, buffer {} frames",
        label,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}
