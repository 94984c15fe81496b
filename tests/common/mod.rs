#![allow(dead_code)]

use ffpipe::backend::memory::{MemoryBackend, MemoryInput, MuxLog, MuxedPacket};
use ffpipe::media::StreamInfo;
use ffpipe::rational::Rational;
use ffpipe::PipelineSpec;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

pub const WIDTH: i32 = 64;
pub const HEIGHT: i32 = 48;

/// Size the memory encoder gives every packet at the test geometry.
pub const PACKET_SIZE: u64 = (WIDTH * HEIGHT / 8) as u64;

pub fn video_stream(index: usize) -> StreamInfo {
    StreamInfo::video(index, "h264", Rational::new(1, 25), WIDTH, HEIGHT)
        .with_frame_rate(Rational::new(25, 1))
}

/// A seekable input carrying `frames` packets of one 25 fps video stream.
pub fn clip(url: &str, frames: i64) -> MemoryInput {
    MemoryInput::new(url)
        .stream(video_stream(0))
        .constant_rate(0, frames, 1)
}

/// A pipeline encoding at 25 fps so encoder and stream time bases are 1/25.
pub fn spec(inputs: &[&str], output: &str, graph: &str) -> PipelineSpec {
    let mut spec = PipelineSpec::new(
        inputs.iter().map(|s| s.to_string()).collect(),
        output,
        graph,
    );
    spec.stream.frame_rate = Rational::new(25, 1);
    spec.progress_interval = Duration::from_secs(3600);
    spec
}

pub fn muxed(backend: &MemoryBackend, url: &str) -> MuxLog {
    backend
        .recording(url)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

pub fn packets_of(log: &MuxLog, stream: usize) -> Vec<MuxedPacket> {
    log.packets
        .iter()
        .filter(|p| p.stream == stream)
        .cloned()
        .collect()
}

pub fn timestamps(packets: &[MuxedPacket]) -> Vec<(i64, i64)> {
    packets.iter().map(|p| (p.pts, p.dts)).collect()
}

pub fn assert_strictly_increasing_dts(packets: &[MuxedPacket]) {
    for pair in packets.windows(2) {
        assert!(
            pair[1].dts > pair[0].dts,
            "dts went from {} to {}",
            pair[0].dts,
            pair[1].dts
        );
    }
}

/// Keeps the binary from picking up configuration outside `home`.
pub fn isolate(cmd: &mut Command, home: &Path) {
    cmd.env_remove("FFPIPE_CONFIG");
    cmd.env_remove("XDG_CONFIG_HOME");
    cmd.env_remove("RUST_LOG");
    cmd.env("HOME", home);
    cmd.current_dir(home);
}
