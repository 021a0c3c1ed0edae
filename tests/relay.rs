use std::f32::consts::PI;
use std::path::Path;
use std::time::{Duration, Instant};

use pa_lambda::audio::{MemoryCapture, MemoryPlayback, PcmFormat};
use pa_lambda::config::{Config, RelaySettings};
use pa_lambda::relay::{run_session, SessionEnd, SessionReport, SessionState, Shutdown};

fn settings() -> RelaySettings {
    RelaySettings {
        drain_timeout: Duration::from_secs(5),
        ..Config::new().unwrap().relay_settings()
    }
}

/// Interleaved S16LE sine, the same tone on every channel.
fn sine(format: &PcmFormat, freq: f32, frames: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames * format.bytes_per_frame());
    for i in 0..frames {
        let t = i as f32 / format.sample_rate as f32;
        let sample = ((2.0 * PI * freq * t).sin() * i16::MAX as f32 * 0.5) as i16;
        for _ in 0..format.channels {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    out
}

fn relay(
    capture: &mut MemoryCapture,
    playback: &mut MemoryPlayback,
    format: PcmFormat,
    command: &str,
) -> SessionReport {
    run_session(capture, playback, format, command, settings(), &Shutdown::new()).unwrap()
}

fn assert_reaped(pid: u32) {
    assert!(!Path::new(&format!("/proc/{}", pid)).exists(), "lambda {} left behind", pid);
}

#[test]
fn sine_through_cat_is_bit_exact() {
    let format = PcmFormat::s16le(44100, 2, 441);
    let input = sine(&format, 440.0, 44100);

    let mut capture = MemoryCapture::new(input.clone());
    let mut playback = MemoryPlayback::new();
    let report = relay(&mut capture, &mut playback, format, "cat");

    assert_eq!(report.end, SessionEnd::SourceEnded);
    assert_eq!(report.state, SessionState::Stopped);
    assert_eq!(report.stats.cycles, 100);
    assert_eq!(playback.received.len(), input.len());
    assert!(playback.received == input, "output differs from input");
    assert_reaped(report.pid);
}

#[test]
fn buffering_transform_never_blocks_the_relay() {
    let format = PcmFormat::s16le(8000, 2, 80);
    let period = format.buffer_bytes();
    let input = sine(&format, 1000.0, 80 * 40);

    // dd re-blocks input into writes of four periods at a time.
    let command = format!("dd ibs={} obs={} 2>/dev/null", period, period * 4);
    let mut capture = MemoryCapture::paced(input.clone(), Duration::from_millis(2));
    let mut playback = MemoryPlayback::new();
    let report = relay(&mut capture, &mut playback, format, &command);

    assert_eq!(report.end, SessionEnd::SourceEnded);
    assert_eq!(report.stats.cycles, 40);
    assert!(report.stats.empty_reads > 0);
    assert!(playback.received == input, "buffered output lost or reordered");
}

#[test]
fn lambda_that_reads_then_exits_stops_the_bridge() {
    let format = PcmFormat::s16le(44100, 2, 441);
    let command = format!("head -c {} >/dev/null", format.buffer_bytes() * 5);

    let mut capture = MemoryCapture::silence(format.period());
    let mut playback = MemoryPlayback::new();
    let started = Instant::now();
    let report = relay(&mut capture, &mut playback, format, &command);

    assert_eq!(report.end, SessionEnd::LambdaExited);
    assert_eq!(report.state, SessionState::Stopped);
    assert!(playback.received.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_reaped(report.pid);
}

#[test]
fn immediately_exiting_lambda_does_not_hang() {
    let format = PcmFormat::s16le(44100, 2, 1024);

    let mut capture = MemoryCapture::silence(format.period());
    let mut playback = MemoryPlayback::new();
    let report = relay(&mut capture, &mut playback, format, "true");

    assert_eq!(report.end, SessionEnd::LambdaExited);
    assert_eq!(report.state, SessionState::Stopped);
    assert_reaped(report.pid);
}

#[test]
fn lambda_sees_the_format_in_its_environment() {
    let dir = tempfile::tempdir().unwrap();
    let env_file = dir.path().join("env.txt");
    let format = PcmFormat::s16le(48000, 1, 480);

    let command = format!("env | grep '^PA_LAMBDA_' > '{}'", env_file.display());
    let mut capture = MemoryCapture::new(vec![0; format.buffer_bytes() * 3]);
    let mut playback = MemoryPlayback::new();
    let report = relay(&mut capture, &mut playback, format, &command);
    assert_eq!(report.state, SessionState::Stopped);

    let captured = std::fs::read_to_string(&env_file).unwrap();
    let mut lines: Vec<&str> = captured.lines().collect();
    lines.sort_unstable();
    assert_eq!(
        lines,
        vec![
            "PA_LAMBDA_BITS=16",
            "PA_LAMBDA_BUFFER_SIZE=480",
            "PA_LAMBDA_BYTES_PER_FRAME=2",
            "PA_LAMBDA_BYTES_PER_SAMPLE=2",
            "PA_LAMBDA_CHANNELS=1",
            "PA_LAMBDA_SAMPLE_FORMAT=s16le",
            "PA_LAMBDA_SAMPLE_RATE=48000",
            "PA_LAMBDA_SIGNED=signed",
        ]
    );
}
