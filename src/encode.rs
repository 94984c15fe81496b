//! Encoding of filtered frames and hand-off of packets to the muxer.

use crate::backend::{
    EncoderSettings, Encoder, FilterGraph, MediaBackend, NodeId, Options, Outcome,
    OutputStreamParams,
};
use crate::codec::{Encoding, Pump};
use crate::error::{BackendContext, PipelineError, Result};
use crate::media::{FieldOrder, Frame, Packet, PictureType, PixelFormat, VideoCodec};
use crate::mux::{MuxTimestamps, OutputFile};
use crate::rational::{frame_interval, rescale, Rational, NOPTS};
use log::{debug, warn};

/// Requested shape of an output video stream; geometry comes from the filter graph.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputStreamSpec {
    pub codec: VideoCodec,
    pub pixel_format: PixelFormat,
    pub frame_rate: Rational,
    pub psnr: bool,
    pub global_quality: i32,
}

impl Default for OutputStreamSpec {
    fn default() -> Self {
        Self {
            codec: VideoCodec::default(),
            pixel_format: PixelFormat::Yuv420p,
            frame_rate: Rational::new(30000, 1001),
            psnr: false,
            global_quality: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub file_index: usize,
    pub stream_index: usize,
    pub data_size: u64,
    pub packets: u64,
    pub frames_encoded: u64,
}

/// Per-stream muxing state fed by the encoder's output.
#[derive(Debug)]
struct PacketWriter {
    file_index: usize,
    index: usize,
    avg_frame_rate: Rational,
    timestamps: MuxTimestamps,
    quality: i32,
    pict_type: PictureType,
    errors: [i64; 4],
    end_time_us: i64,
    stats: OutputStats,
    warned_duration: bool,
}

impl PacketWriter {
    fn write(
        &mut self,
        mut packet: Packet,
        encoder_time_base: Rational,
        has_delay: bool,
        output: &mut OutputFile,
    ) -> Result<()> {
        if packet.pts == NOPTS && !has_delay {
            return Err(PipelineError::stream(
                self.file_index,
                self.index,
                "encoder without delay capability produced a packet without pts",
            ));
        }
        let stream_time_base = output.stream_time_base(self.index);
        packet.pts = rescale(packet.pts, encoder_time_base, stream_time_base);
        packet.dts = rescale(packet.dts, encoder_time_base, stream_time_base);
        packet.duration = rescale(packet.duration, encoder_time_base, stream_time_base);

        if let Some(stats) = packet.quality {
            self.quality = stats.quality;
            self.pict_type = stats.pict_type;
            for (i, slot) in self.errors.iter_mut().enumerate() {
                *slot = if i < stats.error_count { stats.errors[i] } else { -1 };
            }
        }

        if self.avg_frame_rate.is_known() {
            let interval = frame_interval(self.avg_frame_rate, stream_time_base);
            if packet.duration <= 0 {
                packet.duration = interval;
            } else if packet.duration != interval && !self.warned_duration {
                warn!(
                    "Packet duration {} of output stream {}:{} differs from the frame rate ({}), keeping it",
                    packet.duration, self.file_index, self.index, interval
                );
                self.warned_duration = true;
            }
        }

        self.timestamps.correct(&mut packet);

        self.stats.data_size += packet.size as u64;
        self.stats.packets += 1;
        if packet.pts != NOPTS {
            let end = rescale(
                packet.pts.saturating_add(packet.duration.max(0)),
                stream_time_base,
                Rational::MICROS,
            );
            self.end_time_us = self.end_time_us.max(end);
        }
        output.write_packet(packet)
    }
}

fn opened<'a>(
    encoder: &'a mut Option<Box<dyn Encoder>>,
    writer: &PacketWriter,
) -> Result<&'a mut Box<dyn Encoder>> {
    encoder
        .as_mut()
        .ok_or_else(|| PipelineError::stream(writer.file_index, writer.index, "encoder not opened"))
}

/// One encoded output stream fed from a filter graph sink.
pub struct OutputStream {
    sink: NodeId,
    settings: EncoderSettings,
    sink_time_base: Rational,
    encoder: Option<Box<dyn Encoder>>,
    pump: Pump,
    writer: PacketWriter,
    field_order: Option<FieldOrder>,
    finished: bool,
}

impl OutputStream {
    /// Creates the muxer stream. The encoder is opened later, once the sink is configured.
    pub fn new(output: &mut OutputFile, sink: NodeId, spec: &OutputStreamSpec) -> Result<Self> {
        let frame_rate = if spec.frame_rate.is_known() {
            spec.frame_rate
        } else {
            OutputStreamSpec::default().frame_rate
        };
        let params = OutputStreamParams {
            codec: spec.codec,
            avg_frame_rate: frame_rate,
            sample_aspect_ratio: Rational::new(1, 1),
            metadata: vec![(
                "encoder".to_string(),
                format!(
                    "{}-{} {}",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION"),
                    spec.codec.encoder_name()
                ),
            )],
        };
        let index = output.add_stream(&params)?;
        let file_index = output.index();
        Ok(Self {
            sink,
            settings: EncoderSettings {
                codec: spec.codec,
                width: 0,
                height: 0,
                format: spec.pixel_format,
                time_base: frame_rate.invert(),
                frame_rate,
                sample_aspect_ratio: Rational::new(1, 1),
                global_header: output.format().wants_global_header(),
                psnr: spec.psnr,
                global_quality: spec.global_quality,
            },
            sink_time_base: Rational::new(0, 1),
            encoder: None,
            pump: Pump::new(format!("encoder for output stream #{}:{}", file_index, index)),
            writer: PacketWriter {
                file_index,
                index,
                avg_frame_rate: frame_rate,
                timestamps: MuxTimestamps::new(file_index, index),
                quality: 0,
                pict_type: PictureType::None,
                errors: [-1; 4],
                end_time_us: 0,
                stats: OutputStats {
                    file_index,
                    stream_index: index,
                    ..OutputStats::default()
                },
                warned_duration: false,
            },
            field_order: None,
            finished: false,
        })
    }

    /// Opens the encoder from the sink's negotiated properties and configures the muxer stream.
    pub fn open_encoder(
        &mut self,
        backend: &dyn MediaBackend,
        graph: &dyn FilterGraph,
        output: &mut OutputFile,
        options: &Options,
    ) -> Result<()> {
        let props = graph.sink_properties(self.sink);
        if props.width <= 0 || props.height <= 0 {
            return Err(PipelineError::stream(
                self.writer.file_index,
                self.writer.index,
                format!("sink negotiated an invalid frame size {}x{}", props.width, props.height),
            ));
        }
        self.settings.width = props.width;
        self.settings.height = props.height;
        self.settings.format = props.format;
        self.sink_time_base = props.time_base;
        if !self.settings.time_base.is_time_base() {
            self.settings.time_base = props.time_base;
        }

        let encoder = backend.open_encoder(&self.settings, options).backend_context(|| {
            format!(
                "Error while opening encoder for output stream #{}:{} - maybe incorrect parameters such as bit_rate, rate, width or height",
                self.writer.file_index, self.writer.index
            )
        })?;
        output.configure_stream(self.writer.index, &encoder.parameters())?;
        debug!(
            "Opened encoder {} for output stream #{}:{} ({}x{} {}, time base {})",
            encoder.name(),
            self.writer.file_index,
            self.writer.index,
            self.settings.width,
            self.settings.height,
            self.settings.format,
            encoder.time_base()
        );
        self.pump = Pump::new(format!(
            "encoder {} for output stream #{}:{}",
            encoder.name(),
            self.writer.file_index,
            self.writer.index
        ));
        self.encoder = Some(encoder);
        Ok(())
    }


    /// Reads one filtered frame without driving the graph.
    pub fn pull_frame(&self, graph: &mut dyn FilterGraph) -> Result<Outcome<Frame>> {
        graph.take_frame(self.sink).backend_context(|| {
            format!(
                "Error reading filtered frame for output stream #{}:{}",
                self.writer.file_index, self.writer.index
            )
        })
    }

    /// Encodes one frame (timestamps in the sink time base) and muxes the resulting packets.
    pub fn encode_frame(&mut self, mut frame: Frame, output: &mut OutputFile) -> Result<usize> {
        if self.finished {
            return Err(PipelineError::stream(
                self.writer.file_index,
                self.writer.index,
                "frame received after the encoder was flushed",
            ));
        }
        let Self {
            settings,
            sink_time_base,
            encoder,
            pump,
            writer,
            field_order,
            ..
        } = self;
        let encoder = opened(encoder, writer)?;
        let encoder_time_base = encoder.time_base();
        let has_delay = encoder.has_delay();

        frame.pts = rescale(frame.pts, *sink_time_base, encoder_time_base);
        frame.quality = settings.global_quality;
        frame.pict_type = PictureType::None;
        if field_order.is_none() {
            let order = FieldOrder::from_flags(frame.interlaced, frame.top_field_first);
            encoder.set_field_order(order);
            *field_order = Some(order);
            debug!(
                "Output stream #{}:{} field order: {}",
                writer.file_index, writer.index, order
            );
        }
        writer.stats.frames_encoded += 1;

        pump.push(&mut Encoding(encoder.as_mut()), frame, |packet| {
            writer.write(packet, encoder_time_base, has_delay, output)
        })
    }

    /// Drains the encoder and marks the stream finished. Idempotent.
    pub fn flush(&mut self, output: &mut OutputFile) -> Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let Self {
            encoder,
            pump,
            writer,
            ..
        } = self;
        let encoder = opened(encoder, writer)?;
        let encoder_time_base = encoder.time_base();
        let has_delay = encoder.has_delay();
        let packets = pump.flush(&mut Encoding(encoder.as_mut()), |packet| {
            writer.write(packet, encoder_time_base, has_delay, output)
        })?;
        self.finished = true;
        debug!(
            "Flushed output stream #{}:{} ({} packets at flush)",
            self.writer.file_index, self.writer.index, packets
        );
        Ok(packets)
    }

    pub fn sink(&self) -> NodeId {
        self.sink
    }

    pub fn index(&self) -> usize {
        self.writer.index
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn stats(&self) -> &OutputStats {
        &self.writer.stats
    }

    /// Quality of the last packet, in lambda units.
    pub fn quality(&self) -> i32 {
        self.writer.quality
    }

    pub fn pict_type(&self) -> PictureType {
        self.writer.pict_type
    }

    /// Per-plane squared error of the last packet, `-1` where unknown.
    pub fn errors(&self) -> [i64; 4] {
        self.writer.errors
    }

    /// End of the latest muxed packet, in microseconds.
    pub fn end_time_us(&self) -> i64 {
        self.writer.end_time_us
    }

    pub fn last_mux_dts(&self) -> i64 {
        self.writer.timestamps.last_mux_dts()
    }

    pub fn field_order(&self) -> Option<FieldOrder> {
        self.field_order
    }
}

#[cfg(test)]
mod encode_tests {
    use super::*;
    use crate::backend::memory::{EncoderScript, MemoryBackend, MemoryFilterGraph};
    use crate::backend::SourceParams;
    use crate::media::ContainerFormat;

    struct Fixture {
        backend: MemoryBackend,
        graph: Box<dyn FilterGraph>,
        output: OutputFile,
        stream: OutputStream,
    }

    fn fixture(script: EncoderScript) -> Fixture {
        let backend = MemoryBackend::new().with_encoder(script);
        let parsed = MemoryFilterGraph::parse("[0:v]null[out]", false).unwrap();
        let mut graph = parsed.graph;
        let params = SourceParams {
            width: 64,
            height: 48,
            format: PixelFormat::Yuv420p,
            time_base: Rational::new(1, 25),
            sample_aspect_ratio: Rational::new(1, 1),
            frame_rate: Rational::new(25, 1),
        };
        graph.add_source(&parsed.inputs[0], "input stream 0:0", &params).unwrap();
        let sink = graph.add_sink(&parsed.outputs[0], "format :0", "output stream :0", PixelFormat::Yuv420p).unwrap();
        graph.configure().unwrap();
        let mut output =
            OutputFile::open(0, &backend, "out.mp4", ContainerFormat::Mp4, &Options::new()).unwrap();
        let spec = OutputStreamSpec {
            frame_rate: Rational::new(25, 1),
            ..OutputStreamSpec::default()
        };
        let mut stream = OutputStream::new(&mut output, sink, &spec).unwrap();
        stream
            .open_encoder(&backend, graph.as_ref(), &mut output, &Options::new())
            .unwrap();
        output.write_header(&Options::new()).unwrap();
        Fixture {
            backend,
            graph,
            output,
            stream,
        }
    }

    fn frame(pts: i64) -> Frame {
        Frame {
            pts,
            width: 64,
            height: 48,
            format: PixelFormat::Yuv420p,
            ..Frame::default()
        }
    }

    #[test]
    fn frames_are_encoded_and_muxed_in_stream_time_base() {
        let mut f = fixture(EncoderScript {
            delay: 1,
            ..EncoderScript::default()
        });
        for pts in 0..5 {
            f.stream.encode_frame(frame(pts), &mut f.output).unwrap();
        }
        assert_eq!(f.stream.flush(&mut f.output).unwrap(), 1);
        assert!(f.stream.is_finished());
        assert_eq!(f.stream.flush(&mut f.output).unwrap(), 0);
        f.output.finish().unwrap();

        let log = f.backend.recording("out.mp4");
        let log = log.lock().unwrap();
        let dts: Vec<i64> = log.packets.iter().map(|p| p.dts).collect();
        assert_eq!(dts, vec![0, 1, 2, 3, 4]);
        assert!(log.packets.iter().all(|p| p.duration == 1));
        assert_eq!(log.streams[0].time_base, Rational::new(1, 25));
        assert_eq!(
            log.header_options.get("max_delay").map(String::as_str),
            Some("700000")
        );
        assert!(log.trailer_written);
        assert_eq!(f.stream.stats().frames_encoded, 5);
        assert_eq!(f.stream.stats().packets, 5);
        assert_eq!(f.stream.field_order(), Some(FieldOrder::Progressive));
        assert_eq!(f.stream.end_time_us(), 200_000);
        assert_eq!(f.stream.pict_type(), PictureType::P);
        assert_eq!(f.stream.errors(), [-1; 4]);
        let _ = f.graph.describe();
    }

    #[test]
    fn missing_pts_without_delay_capability_is_fatal() {
        let mut f = fixture(EncoderScript::default());
        let err = f.stream.encode_frame(frame(NOPTS), &mut f.output).unwrap_err();
        assert!(err.to_string().contains("without pts"), "{}", err);
    }

    #[test]
    fn frames_after_flush_are_rejected() {
        let mut f = fixture(EncoderScript::default());
        f.stream.flush(&mut f.output).unwrap();
        assert!(f.stream.encode_frame(frame(0), &mut f.output).is_err());
    }

    #[test]
    fn encoding_before_the_encoder_opens_is_an_error() {
        let backend = MemoryBackend::new();
        let mut output =
            OutputFile::open(0, &backend, "out.mp4", ContainerFormat::Mp4, &Options::new()).unwrap();
        let mut stream =
            OutputStream::new(&mut output, NodeId(0), &OutputStreamSpec::default()).unwrap();
        let err = stream.encode_frame(frame(0), &mut output).unwrap_err();
        assert!(err.to_string().contains("encoder not opened"), "{}", err);
        assert!(stream.flush(&mut output).is_err());
        assert!(!stream.is_finished());
        assert_eq!(stream.stats().frames_encoded, 0);
    }
}
