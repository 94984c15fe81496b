//! Timestamp continuity for one decoded stream.
//!
//! Predictions (`next_dts`, `next_pts`) are kept in microseconds so that packets
//! with missing timestamps can be filled from the running estimate.

use crate::media::{Frame, Packet};
use crate::rational::{frame_interval, rescale, Rational, NOPTS};

#[derive(Clone, Debug)]
pub struct TimestampTracker {
    time_base: Rational,
    frame_rate: Rational,
    next_dts: i64,
    dts: i64,
    next_pts: i64,
    pts: i64,
    min_pts: i64,
    max_pts: i64,
}

impl TimestampTracker {
    /// `reorder_delay` is the decoder's frame delay; with a known frame rate the first
    /// predicted dts starts that many frame intervals before zero.
    pub fn new(time_base: Rational, frame_rate: Rational, reorder_delay: i64) -> Self {
        let next_dts = if frame_rate.num != 0 && frame_rate.den != 0 {
            -rescale(reorder_delay, frame_rate.invert(), Rational::MICROS)
        } else {
            0
        };
        Self {
            time_base,
            frame_rate,
            next_dts,
            dts: 0,
            next_pts: 0,
            pts: 0,
            min_pts: i64::MAX,
            max_pts: i64::MIN,
        }
    }

    fn interval(&self) -> i64 {
        frame_interval(self.frame_rate, Rational::MICROS)
    }

    /// Fills a missing dts from the prediction, or resynchronises the prediction from it.
    pub fn on_packet(&mut self, packet: &mut Packet) {
        if packet.pts != NOPTS {
            self.min_pts = self.min_pts.min(packet.pts);
            self.max_pts = self.max_pts.max(packet.pts);
        }

        if packet.dts == NOPTS {
            packet.dts = rescale(self.next_dts, Rational::MICROS, self.time_base);
        } else {
            self.next_dts = rescale(packet.dts, self.time_base, Rational::MICROS);
        }
        self.dts = self.next_dts;

        let step = if packet.duration != 0 {
            rescale(packet.duration, self.time_base, Rational::MICROS)
        } else {
            self.interval()
        };
        self.next_dts = self.next_dts.saturating_add(step);
    }

    /// Assigns a presentation timestamp from the decoder's best effort, or synthesizes one.
    pub fn on_frame(&mut self, frame: &mut Frame) {
        frame.pts = frame.best_effort_timestamp;
        if frame.pts != NOPTS {
            self.next_pts = rescale(frame.pts, self.time_base, Rational::MICROS);
        } else {
            frame.pts = rescale(self.next_pts, Rational::MICROS, self.time_base);
        }
        self.pts = self.next_pts;

        let step = if frame.duration > 0 {
            rescale(frame.duration, self.time_base, Rational::MICROS)
        } else {
            self.interval()
        };
        self.next_pts = self.next_pts.saturating_add(step);
    }

    /// Timestamp that follows the last frame, in the stream time base.
    pub fn end_pts(&self) -> i64 {
        rescale(self.next_pts, Rational::MICROS, self.time_base)
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn next_dts(&self) -> i64 {
        self.next_dts
    }

    pub fn dts(&self) -> i64 {
        self.dts
    }

    pub fn next_pts(&self) -> i64 {
        self.next_pts
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    /// Smallest and largest pts seen on packets, if any.
    pub fn pts_range(&self) -> Option<(i64, i64)> {
        (self.min_pts <= self.max_pts).then_some((self.min_pts, self.max_pts))
    }
}

#[cfg(test)]
mod timestamp_tests {
    use super::*;

    fn packet(pts: i64, dts: i64, duration: i64) -> Packet {
        Packet::new(0, pts, dts, duration, 100)
    }

    fn frame(best_effort: i64, duration: i64) -> Frame {
        Frame {
            best_effort_timestamp: best_effort,
            duration,
            ..Frame::default()
        }
    }

    #[test]
    fn initial_dts_accounts_for_reorder_delay() {
        let tracker = TimestampTracker::new(Rational::new(1, 25), Rational::new(25, 1), 2);
        assert_eq!(tracker.next_dts(), -80_000);
        let tracker = TimestampTracker::new(Rational::new(1, 25), Rational::new(0, 1), 2);
        assert_eq!(tracker.next_dts(), 0);
        assert_eq!(tracker.pts_range(), None);
    }

    #[test]
    fn missing_dts_is_synthesized_and_non_decreasing() {
        let mut tracker = TimestampTracker::new(Rational::new(1, 90000), Rational::new(25, 1), 0);
        let mut last = i64::MIN;
        for i in 0..6 {
            let mut pkt = if i % 2 == 0 {
                packet(NOPTS, NOPTS, 0)
            } else {
                packet(NOPTS, i * 3600, 3600)
            };
            tracker.on_packet(&mut pkt);
            assert_ne!(pkt.dts, NOPTS);
            assert!(pkt.dts >= last, "dts went backwards: {} < {}", pkt.dts, last);
            last = pkt.dts;
        }
    }

    #[test]
    fn packet_dts_resynchronises_prediction() {
        let mut tracker = TimestampTracker::new(Rational::new(1, 1000), Rational::new(25, 1), 0);
        let mut pkt = packet(500, 480, 40);
        tracker.on_packet(&mut pkt);
        assert_eq!(pkt.dts, 480);
        assert_eq!(tracker.dts(), 480_000);
        assert_eq!(tracker.next_dts(), 520_000);
        assert_eq!(tracker.pts_range(), Some((500, 500)));

        let mut pkt = packet(NOPTS, NOPTS, 0);
        tracker.on_packet(&mut pkt);
        assert_eq!(pkt.dts, 520);
        assert_eq!(tracker.next_dts(), 560_000);
    }

    #[test]
    fn frame_pts_synthesized_from_prediction() {
        let mut tracker = TimestampTracker::new(Rational::new(1, 25), Rational::new(25, 1), 0);
        let mut pts = Vec::new();
        for _ in 0..10 {
            let mut f = frame(NOPTS, 1);
            tracker.on_frame(&mut f);
            pts.push(f.pts);
        }
        assert_eq!(pts, (0..10).collect::<Vec<_>>());
        assert_eq!(tracker.end_pts(), 10);
    }

    #[test]
    fn best_effort_timestamp_wins_over_prediction() {
        let mut tracker = TimestampTracker::new(Rational::new(1, 25), Rational::new(25, 1), 0);
        let mut f = frame(7, 0);
        tracker.on_frame(&mut f);
        assert_eq!(f.pts, 7);
        assert_eq!(tracker.pts(), 280_000);
        assert_eq!(tracker.next_pts(), 320_000);

        let mut f = frame(NOPTS, 0);
        tracker.on_frame(&mut f);
        assert_eq!(f.pts, 8);
    }

    #[test]
    fn huge_timestamps_saturate_the_prediction() {
        let mut tracker = TimestampTracker::new(Rational::new(1, 1), Rational::new(25, 1), 0);
        let mut pkt = packet(NOPTS, 10_000_000_000_000, 0);
        tracker.on_packet(&mut pkt);
        assert_eq!(pkt.dts, 10_000_000_000_000);
        assert_eq!(tracker.next_dts(), i64::MAX);

        let mut f = frame(10_000_000_000_000, 1);
        tracker.on_frame(&mut f);
        assert_eq!(tracker.next_pts(), i64::MAX);
    }
}
