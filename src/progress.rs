//! Periodic progress lines and end-of-run statistics.

use crate::decode::InputStats;
use crate::encode::{OutputStats, OutputStream};
use crate::media::PictureType;
use crate::rational::TIME_BASE;
use log::info;
use std::fmt;
use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Lambda units per quantizer step.
const QP2LAMBDA: f64 = 118.0;

/// What the reporter needs to know about one output stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamProgress {
    pub frames: u64,
    pub quality: i32,
    pub pict_type: PictureType,
    pub errors: [i64; 4],
    pub psnr: bool,
    pub width: i32,
    pub height: i32,
    pub end_time_us: i64,
}

impl From<&OutputStream> for StreamProgress {
    fn from(stream: &OutputStream) -> Self {
        Self {
            frames: stream.stats().frames_encoded,
            quality: stream.quality(),
            pict_type: stream.pict_type(),
            errors: stream.errors(),
            psnr: stream.settings().psnr,
            width: stream.settings().width,
            height: stream.settings().height,
            end_time_us: stream.end_time_us(),
        }
    }
}

/// Per-plane PSNR of the last encoded frame: Y, U, V and combined.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Psnr {
    pub planes: [f64; 3],
    pub combined: f64,
}

fn psnr(d: f64) -> f64 {
    -10.0 * d.log10()
}

impl Psnr {
    fn from_errors(errors: &[i64; 4], width: i32, height: i32) -> Option<Self> {
        if width <= 0 || height <= 0 || errors[..3].iter().any(|&e| e < 0) {
            return None;
        }
        let full = width as f64 * height as f64 * 255.0 * 255.0;
        let mut planes = [0.0; 3];
        let mut total_error = 0.0;
        let mut total_scale = 0.0;
        for (j, plane) in planes.iter_mut().enumerate() {
            let scale = if j == 0 { full } else { full / 4.0 };
            let error = errors[j] as f64;
            total_error += error;
            total_scale += scale;
            *plane = psnr(error / scale);
        }
        Some(Self {
            planes,
            combined: psnr(total_error / total_scale),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub frames: u64,
    pub fps: f64,
    /// Quantizer of each output stream.
    pub q: Vec<f64>,
    pub psnr: Option<Psnr>,
    pub size_bytes: u64,
    pub out_time_us: i64,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
    pub is_last: bool,
}

fn format_time(us: i64) -> String {
    let sign = if us < 0 { "-" } else { "" };
    let us = us.unsigned_abs();
    let secs = us / TIME_BASE as u64;
    let centis = (us % TIME_BASE as u64) / 10_000;
    format!(
        "{}{:02}:{:02}:{:02}.{:02}",
        sign,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        centis
    )
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let precision = if self.fps < 9.95 { 1 } else { 0 };
        write!(f, "frame={:5} fps={:3.*} ", self.frames, precision, self.fps)?;
        for q in &self.q {
            write!(f, "q={:3.1} ", q)?;
        }
        if let Some(p) = &self.psnr {
            write!(
                f,
                "PSNR=Y:{:5.2} U:{:5.2} V:{:5.2} *:{:5.2} ",
                p.planes[0], p.planes[1], p.planes[2], p.combined
            )?;
        }
        let size = if self.is_last { "Lsize" } else { "size" };
        write!(
            f,
            "{}={:8.0}kB time={} ",
            size,
            self.size_bytes as f64 / 1024.0,
            format_time(self.out_time_us)
        )?;
        match self.bitrate_kbps {
            Some(rate) => write!(f, "bitrate={:6.1}kbits/s ", rate)?,
            None => write!(f, "bitrate=N/A ")?,
        }
        match self.speed {
            Some(speed) => write!(f, "speed={:.3}x", speed),
            None => write!(f, "speed=N/A"),
        }
    }
}

/// Rate-limited progress reporting. Owns its timer state; one per pipeline run.
#[derive(Debug)]
pub struct ProgressReporter {
    interval: Duration,
    started: Instant,
    last_report: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub fn starting_at(interval: Duration, started: Instant) -> Self {
        Self {
            interval,
            started,
            last_report: None,
        }
    }

    /// Logs a progress line when the interval has elapsed, or unconditionally when `is_last`.
    pub fn report(
        &mut self,
        outputs: &[OutputStream],
        size_bytes: u64,
        is_last: bool,
    ) -> Option<ProgressSnapshot> {
        let now = Instant::now();
        if !self.due(now, is_last) {
            return None;
        }
        let streams: Vec<StreamProgress> = outputs.iter().map(StreamProgress::from).collect();
        let snapshot = self.snapshot(now, &streams, size_bytes, is_last);
        info!("{}", snapshot);
        Some(snapshot)
    }

    /// Whether a report is due at `now`; a due report restarts the interval.
    pub fn due(&mut self, now: Instant, is_last: bool) -> bool {
        if !is_last {
            match self.last_report {
                None => {
                    self.last_report = Some(now);
                    return false;
                }
                Some(last) if now.saturating_duration_since(last) < self.interval => return false,
                Some(_) => {}
            }
        }
        self.last_report = Some(now);
        true
    }

    /// Builds a snapshot at `now` if one is due.
    pub fn tick(
        &mut self,
        now: Instant,
        streams: &[StreamProgress],
        size_bytes: u64,
        is_last: bool,
    ) -> Option<ProgressSnapshot> {
        self.due(now, is_last)
            .then(|| self.snapshot(now, streams, size_bytes, is_last))
    }

    fn snapshot(
        &self,
        now: Instant,
        streams: &[StreamProgress],
        size_bytes: u64,
        is_last: bool,
    ) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let first = streams.first();
        let frames = first.map(|s| s.frames).unwrap_or(0);
        let fps = if elapsed > 1.0 { frames as f64 / elapsed } else { 0.0 };
        let psnr = first
            .filter(|s| s.psnr)
            .and_then(|s| Psnr::from_errors(&s.errors, s.width, s.height));
        let out_time_us = streams.iter().map(|s| s.end_time_us).max().unwrap_or(0);
        let seconds = out_time_us as f64 / TIME_BASE as f64;
        let bitrate_kbps = (out_time_us > 0).then(|| size_bytes as f64 * 8.0 / seconds / 1000.0);
        let speed = (elapsed > 0.0 && out_time_us > 0).then(|| seconds / elapsed);

        ProgressSnapshot {
            frames,
            fps,
            q: streams.iter().map(|s| s.quality as f64 / QP2LAMBDA).collect(),
            psnr,
            size_bytes,
            out_time_us,
            bitrate_kbps,
            speed,
            is_last,
        }
    }
}

/// Per-stream demux/decode statistics of one input file.
pub fn input_stats_lines(file: usize, url: &str, streams: &[&InputStats]) -> Vec<String> {
    let mut lines = vec![format!("Input file #{} ({}):", file, url)];
    let (mut packets, mut bytes) = (0, 0);
    for s in streams {
        lines.push(format!(
            "  Input stream #{}:{} (video): {} packets read ({} bytes); {} frames decoded;",
            s.file_index, s.stream_index, s.packets, s.data_size, s.frames_decoded
        ));
        packets += s.packets;
        bytes += s.data_size;
    }
    lines.push(format!("  Total: {} packets ({} bytes) demuxed", packets, bytes));
    lines
}

/// Per-stream encode/mux statistics of one output file.
pub fn output_stats_lines(file: usize, url: &str, streams: &[&OutputStats]) -> Vec<String> {
    let mut lines = vec![format!("Output file #{} ({}):", file, url)];
    let (mut packets, mut bytes) = (0, 0);
    for s in streams {
        lines.push(format!(
            "  Output stream #{}:{} (video): {} frames encoded; {} packets muxed ({} bytes);",
            s.file_index, s.stream_index, s.frames_encoded, s.packets, s.data_size
        ));
        packets += s.packets;
        bytes += s.data_size;
    }
    lines.push(format!("  Total: {} packets ({} bytes) muxed", packets, bytes));
    lines
}

#[cfg(test)]
mod progress_tests {
    use super::*;

    fn stream(frames: u64, end_time_us: i64) -> StreamProgress {
        StreamProgress {
            frames,
            quality: 23 * 118,
            end_time_us,
            width: 64,
            height: 48,
            ..StreamProgress::default()
        }
    }

    #[test]
    fn reports_are_rate_limited_except_the_last() {
        let t0 = Instant::now();
        let mut reporter = ProgressReporter::starting_at(DEFAULT_INTERVAL, t0);
        let streams = [stream(1, 40_000)];
        assert!(reporter.tick(t0, &streams, 100, false).is_none());
        assert!(reporter.tick(t0 + Duration::from_millis(200), &streams, 100, false).is_none());
        assert!(reporter.tick(t0 + Duration::from_millis(600), &streams, 100, false).is_some());
        assert!(reporter.tick(t0 + Duration::from_millis(700), &streams, 100, false).is_none());
        let last = reporter.tick(t0 + Duration::from_millis(710), &streams, 100, true).unwrap();
        assert!(last.is_last);
    }

    #[test]
    fn report_skips_work_until_due() {
        let mut reporter = ProgressReporter::new(Duration::from_secs(3600));
        assert!(reporter.report(&[], 0, false).is_none());
        assert!(reporter.report(&[], 0, false).is_none());
        let last = reporter.report(&[], 2048, true).unwrap();
        assert_eq!(last.frames, 0);
        assert!(last.q.is_empty());
        assert_eq!(last.size_bytes, 2048);

        let t0 = Instant::now();
        let mut reporter = ProgressReporter::starting_at(DEFAULT_INTERVAL, t0);
        assert!(!reporter.due(t0, false));
        assert!(!reporter.due(t0 + Duration::from_millis(499), false));
        assert!(reporter.due(t0 + Duration::from_millis(500), false));
        assert!(!reporter.due(t0 + Duration::from_millis(501), false));
        assert!(reporter.due(t0 + Duration::from_millis(502), true));
    }

    #[test]
    fn snapshot_line_contents() {
        let t0 = Instant::now();
        let mut reporter = ProgressReporter::starting_at(DEFAULT_INTERVAL, t0);
        let snap = reporter
            .tick(t0 + Duration::from_secs(2), &[stream(50, 2_000_000)], 250_000, true)
            .unwrap();
        assert_eq!(snap.fps, 25.0);
        assert_eq!(snap.q, vec![23.0]);
        assert_eq!(snap.bitrate_kbps, Some(1000.0));
        assert_eq!(snap.speed, Some(1.0));
        let line = snap.to_string();
        assert!(line.starts_with("frame=   50 fps= 25 q=23.0 Lsize="), "{}", line);
        assert!(line.contains("time=00:00:02.00"), "{}", line);
        assert!(line.ends_with("bitrate=1000.0kbits/s speed=1.000x"), "{}", line);
    }

    #[test]
    fn psnr_from_plane_errors() {
        let mut s = stream(1, 40_000);
        s.psnr = true;
        let full = 64.0 * 48.0 * 255.0 * 255.0;
        s.errors = [(full / 100.0) as i64, (full / 400.0) as i64, (full / 400.0) as i64, -1];
        let mut reporter = ProgressReporter::new(DEFAULT_INTERVAL);
        let snap = reporter.tick(Instant::now(), &[s.clone()], 0, true).unwrap();
        let p = snap.psnr.unwrap();
        assert!((p.planes[0] - 20.0).abs() < 1e-6);
        assert!((p.planes[1] - 20.0).abs() < 1e-6);
        assert!((p.combined - 20.0).abs() < 1e-6);

        s.errors = [-1; 4];
        assert!(reporter.tick(Instant::now(), &[s], 0, true).unwrap().psnr.is_none());
    }

    #[test]
    fn time_formatting() {
        assert_eq!(format_time(0), "00:00:00.00");
        assert_eq!(format_time(3_723_450_000), "01:02:03.45");
        assert_eq!(format_time(-1_500_000), "-00:00:01.50");
    }

    #[test]
    fn stats_lines() {
        let stats = InputStats {
            file_index: 0,
            stream_index: 0,
            data_size: 1000,
            packets: 10,
            frames_decoded: 10,
        };
        let lines = input_stats_lines(0, "in.mkv", &[&stats]);
        assert_eq!(
            lines[1],
            "  Input stream #0:0 (video): 10 packets read (1000 bytes); 10 frames decoded;"
        );
        assert_eq!(lines[2], "  Total: 10 packets (1000 bytes) demuxed");
        let out = OutputStats {
            frames_encoded: 10,
            packets: 10,
            data_size: 384,
            ..OutputStats::default()
        };
        let lines = output_stats_lines(0, "out.mp4", &[&out]);
        assert_eq!(lines.last().unwrap(), "  Total: 10 packets (384 bytes) muxed");
    }
}
