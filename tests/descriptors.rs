// Kept in its own test binary: counting this process's descriptors only
// works while no other test is opening pipes alongside.

use std::time::Duration;

use pa_lambda::audio::{MemoryCapture, MemoryPlayback, PcmFormat};
use pa_lambda::config::{Config, RelaySettings};
use pa_lambda::relay::{run_session, SessionEnd, Shutdown};

fn format() -> PcmFormat {
    PcmFormat::s16le(8000, 2, 80)
}

fn finite() -> MemoryCapture {
    MemoryCapture::new(vec![7; format().buffer_bytes() * 20])
}

fn endless() -> MemoryCapture {
    MemoryCapture::silence(format().period())
}

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

fn relay_once(mut capture: MemoryCapture, command: &str) -> SessionEnd {
    let settings = RelaySettings {
        drain_timeout: Duration::from_secs(5),
        ..Config::new().unwrap().relay_settings()
    };
    let mut playback = MemoryPlayback::new();
    run_session(&mut capture, &mut playback, format(), command, settings, &Shutdown::new())
        .unwrap()
        .end
}

#[test]
fn sessions_leave_no_descriptors_behind() {
    // Let the runtime settle anything it opens lazily.
    relay_once(finite(), "cat");
    let before = open_descriptors();

    assert_eq!(relay_once(finite(), "cat"), SessionEnd::SourceEnded);
    assert_eq!(open_descriptors(), before, "source-ended session leaked");

    let command = format!("head -c {} >/dev/null", format().buffer_bytes() * 3);
    assert_eq!(relay_once(endless(), &command), SessionEnd::LambdaExited);
    assert_eq!(open_descriptors(), before, "lambda-exited session leaked");

    assert_eq!(relay_once(endless(), "true"), SessionEnd::LambdaExited);
    assert_eq!(open_descriptors(), before, "short-lived lambda leaked");
}
