//! Decoding of demuxed packets into frames for the filter graph.

use crate::backend::{Decoder, FilterGraph, MediaBackend, NodeId, Options};
use crate::codec::{Decoding, Pump};
use crate::error::{BackendContext, PipelineError, Result};
use crate::media::{Frame, MediaType, Packet, StreamInfo};
use crate::timestamp::TimestampTracker;
use log::debug;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputStats {
    pub file_index: usize,
    pub stream_index: usize,
    pub data_size: u64,
    pub packets: u64,
    pub frames_decoded: u64,
}

/// A demuxed video stream bound to one buffer source of the filter graph.
pub struct InputStream {
    info: StreamInfo,
    decoder: Box<dyn Decoder>,
    pump: Pump,
    tracker: TimestampTracker,
    source: Option<NodeId>,
    stats: InputStats,
    flushed: bool,
}

impl InputStream {
    pub fn open(
        file_index: usize,
        info: &StreamInfo,
        backend: &dyn MediaBackend,
        options: &Options,
    ) -> Result<Self> {
        if info.media_type != MediaType::Video {
            return Err(PipelineError::stream(
                file_index,
                info.index,
                format!("only video input streams are supported, got {}", info.media_type),
            ));
        }
        let decoder = backend.open_decoder(info, options).backend_context(|| {
            format!(
                "Error while opening decoder for input stream #{}:{}",
                file_index, info.index
            )
        })?;
        Ok(Self::new(file_index, info, decoder))
    }

    pub fn new(file_index: usize, info: &StreamInfo, decoder: Box<dyn Decoder>) -> Self {
        let tracker = TimestampTracker::new(
            info.time_base,
            info.avg_frame_rate,
            decoder.reorder_delay(),
        );
        Self {
            pump: Pump::new(format!(
                "decoder {} for input stream #{}:{}",
                decoder.name(),
                file_index,
                info.index
            )),
            info: info.clone(),
            decoder,
            tracker,
            source: None,
            stats: InputStats {
                file_index,
                stream_index: info.index,
                ..InputStats::default()
            },
            flushed: false,
        }
    }

    pub fn bind_source(&mut self, source: NodeId) {
        self.source = Some(source);
    }

    pub fn source(&self) -> Option<NodeId> {
        self.source
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn stats(&self) -> &InputStats {
        &self.stats
    }

    pub fn tracker(&self) -> &TimestampTracker {
        &self.tracker
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn bound_source(&self) -> Result<NodeId> {
        self.source.ok_or_else(|| {
            PipelineError::stream(
                self.stats.file_index,
                self.stats.stream_index,
                "not bound to a filter graph input",
            )
        })
    }

    /// Decodes one packet, pushing every frame it yields into the buffer source.
    /// Returns the number of frames pushed.
    pub fn decode_packet(&mut self, mut packet: Packet, graph: &mut dyn FilterGraph) -> Result<usize> {
        if self.flushed {
            return Err(PipelineError::stream(
                self.stats.file_index,
                self.stats.stream_index,
                "packet received after end of stream",
            ));
        }
        let source = self.bound_source()?;
        self.stats.data_size += packet.size as u64;
        self.stats.packets += 1;
        self.tracker.on_packet(&mut packet);

        let Self {
            info,
            decoder,
            pump,
            tracker,
            stats,
            ..
        } = self;
        pump.push(&mut Decoding(decoder.as_mut()), packet, |frame| {
            forward_frame(frame, info, tracker, stats, graph, source)
        })
    }

    /// Drains the decoder and closes the buffer source at the predicted end timestamp.
    pub fn flush(&mut self, graph: &mut dyn FilterGraph) -> Result<usize> {
        if self.flushed {
            return Ok(0);
        }
        let source = self.bound_source()?;
        let Self {
            info,
            decoder,
            pump,
            tracker,
            stats,
            ..
        } = self;
        let frames = pump.flush(&mut Decoding(decoder.as_mut()), |frame| {
            forward_frame(frame, info, tracker, stats, graph, source)
        })?;
        let end = self.tracker.end_pts();
        graph.close_source(source, end).backend_context(|| {
            format!(
                "Error while closing the filtergraph input of stream #{}:{}",
                self.stats.file_index, self.stats.stream_index
            )
        })?;
        self.flushed = true;
        debug!(
            "Flushed input stream #{}:{} ({} frames at flush, end pts {})",
            self.stats.file_index, self.stats.stream_index, frames, end
        );
        Ok(frames)
    }
}

fn forward_frame(
    mut frame: Frame,
    info: &StreamInfo,
    tracker: &mut TimestampTracker,
    stats: &mut InputStats,
    graph: &mut dyn FilterGraph,
    source: NodeId,
) -> Result<()> {
    stats.frames_decoded += 1;
    tracker.on_frame(&mut frame);
    if info.sample_aspect_ratio.num != 0 {
        frame.sample_aspect_ratio = info.sample_aspect_ratio;
    }
    graph.push_frame(source, frame).backend_context(|| {
        format!(
            "Error while feeding the filtergraph (stream #{}:{})",
            stats.file_index, stats.stream_index
        )
    })
}

#[cfg(test)]
mod decode_tests {
    use super::*;
    use crate::backend::memory::{DecoderScript, MemoryBackend, MemoryFilterGraph};
    use crate::backend::{Outcome, SourceParams};
    use crate::filter::source_params;
    use crate::media::PixelFormat;
    use crate::rational::{Rational, NOPTS};

    fn stream() -> StreamInfo {
        StreamInfo::video(0, "h264", Rational::new(1, 25), 64, 48).with_frame_rate(Rational::new(25, 1))
    }

    fn graph_with_source(info: &StreamInfo) -> (Box<dyn FilterGraph>, NodeId, NodeId) {
        let parsed = MemoryFilterGraph::parse("[0:v]null[out]", false).unwrap();
        let mut graph = parsed.graph;
        let params: SourceParams = source_params(info);
        let source = graph.add_source(&parsed.inputs[0], "input stream 0:0", &params).unwrap();
        let sink = graph.add_sink(&parsed.outputs[0], "format :0", "output stream :0", PixelFormat::Yuv420p).unwrap();
        graph.configure().unwrap();
        (graph, source, sink)
    }

    fn collect(graph: &mut dyn FilterGraph, sink: NodeId) -> Vec<i64> {
        let mut pts = Vec::new();
        loop {
            graph.request_frame(sink).unwrap();
            graph.run_once().unwrap();
            match graph.take_frame(sink).unwrap() {
                Outcome::Ready(frame) => pts.push(frame.pts),
                Outcome::Eof => return pts,
                Outcome::Again => {}
            }
        }
    }

    #[test]
    fn missing_timestamps_are_synthesized_and_source_closed_at_end() {
        let info = stream();
        let backend = MemoryBackend::new().with_decoder(DecoderScript { delay: 2 });
        let mut input = InputStream::open(0, &info, &backend, &Options::new()).unwrap();
        let (mut graph, source, sink) = graph_with_source(&info);
        input.bind_source(source);

        let mut pushed = 0;
        for i in 0..10 {
            let dts = if i == 0 { 0 } else { NOPTS };
            pushed += input
                .decode_packet(Packet::new(0, NOPTS, dts, 1, 100), graph.as_mut())
                .unwrap();
        }
        assert_eq!(pushed, 8);
        assert_eq!(input.flush(graph.as_mut()).unwrap(), 2);
        assert!(input.is_flushed());
        assert_eq!(input.tracker().end_pts(), 10);
        assert_eq!(input.stats().packets, 10);
        assert_eq!(input.stats().frames_decoded, 10);
        assert_eq!(collect(graph.as_mut(), sink), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn non_video_streams_are_rejected() {
        let mut info = stream();
        info.media_type = MediaType::Audio;
        let err = InputStream::open(0, &info, &MemoryBackend::new(), &Options::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("only video input streams"));
    }

    #[test]
    fn packets_after_flush_are_fatal() {
        let info = stream();
        let mut input = InputStream::open(0, &info, &MemoryBackend::new(), &Options::new()).unwrap();
        let (mut graph, source, _) = graph_with_source(&info);
        input.bind_source(source);
        input.flush(graph.as_mut()).unwrap();
        assert!(input
            .decode_packet(Packet::new(0, 0, 0, 1, 10), graph.as_mut())
            .is_err());
    }
}
