//! Capability traits implemented by media providers.
//!
//! The pipeline drives demuxers, codecs, filter graphs and muxers only through
//! these traits. Every call that can be transiently unavailable or exhausted
//! returns an [`Outcome`]; hard failures are [`BackendError`]s.

pub mod memory;

use crate::error::BackendError;
use crate::filter::FilterEndpoint;
use crate::media::{
    CodecParameters, ContainerFormat, FieldOrder, Frame, Packet, PixelFormat, StreamInfo,
    VideoCodec,
};
use crate::rational::Rational;
use std::collections::BTreeMap;

pub type BackendResult<T> = Result<T, BackendError>;

/// String options handed to a provider when it opens a resource. Providers reject keys they
/// do not understand.
pub type Options = BTreeMap<String, String>;

/// Result of a non-fatal provider call.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Ready(T),
    /// Nothing available right now; retry after feeding or draining the other side.
    Again,
    /// The resource is exhausted and will not produce more.
    Eof,
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ready(value) => Outcome::Ready(f(value)),
            Outcome::Again => Outcome::Again,
            Outcome::Eof => Outcome::Eof,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Outcome::Eof)
    }
}

/// Identifies a buffer source or sink node inside a configured filter graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Reads packets from one input file. Owned by its reader thread while running.
pub trait Demuxer: Send {
    fn url(&self) -> &str;
    fn streams(&self) -> &[StreamInfo];
    /// Non-seekable inputs are treated as live and read without blocking.
    fn is_seekable(&self) -> bool;
    fn read_packet(&mut self) -> BackendResult<Outcome<Packet>>;
}

/// Two-phase video decoder. `send_packet(None)` enters draining mode.
pub trait Decoder {
    fn name(&self) -> &str;
    /// Number of frames of reordering delay the decoder introduces.
    fn reorder_delay(&self) -> i64;
    fn send_packet(&mut self, packet: Option<&mut Packet>) -> BackendResult<Outcome<()>>;
    fn receive_frame(&mut self) -> BackendResult<Outcome<Frame>>;
}

/// Two-phase video encoder. `send_frame(None)` enters draining mode.
pub trait Encoder {
    fn name(&self) -> &str;
    /// Whether the encoder may buffer frames, emitting packets without a pts.
    fn has_delay(&self) -> bool;
    fn time_base(&self) -> Rational;
    fn parameters(&self) -> CodecParameters;
    fn set_field_order(&mut self, order: FieldOrder);
    fn send_frame(&mut self, frame: Option<&mut Frame>) -> BackendResult<Outcome<()>>;
    fn receive_packet(&mut self) -> BackendResult<Outcome<Packet>>;
}

/// Properties of a buffer source, taken from the decoded stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceParams {
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub time_base: Rational,
    pub sample_aspect_ratio: Rational,
    pub frame_rate: Rational,
}

/// Negotiated properties of a configured sink.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SinkProperties {
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub time_base: Rational,
    pub frame_rate: Rational,
    pub sample_aspect_ratio: Rational,
}

/// Scheduling state of the link feeding a sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkState {
    pub frames_out: u64,
    pub frame_wanted: bool,
    pub blocked_in: bool,
    pub terminated: bool,
}

/// A parsed, not yet configured, filter graph together with its unmatched pads.
pub struct ParsedGraph {
    pub graph: Box<dyn FilterGraph>,
    pub inputs: Vec<FilterEndpoint>,
    pub outputs: Vec<FilterEndpoint>,
}

pub trait FilterGraph {
    /// Creates and links a buffer source feeding `endpoint`.
    fn add_source(
        &mut self,
        endpoint: &FilterEndpoint,
        name: &str,
        params: &SourceParams,
    ) -> BackendResult<NodeId>;

    /// Creates a pixel-format constraint named `format_name` followed by a sink named
    /// `sink_name`, linked after `endpoint`.
    fn add_sink(
        &mut self,
        endpoint: &FilterEndpoint,
        format_name: &str,
        sink_name: &str,
        format: PixelFormat,
    ) -> BackendResult<NodeId>;

    fn configure(&mut self) -> BackendResult<()>;

    /// Human-readable dump of the configured graph.
    fn describe(&self) -> String;

    fn push_frame(&mut self, source: NodeId, frame: Frame) -> BackendResult<()>;

    /// Marks end of stream on a source at `pts` (in the source time base).
    fn close_source(&mut self, source: NodeId, pts: i64) -> BackendResult<()>;

    /// How often the graph wanted a frame from `source` while none was available.
    fn failed_requests(&self, source: NodeId) -> u32;

    /// Non-consuming check for a buffered frame; `request` lets the graph run to produce one.
    fn peek_sink(&mut self, sink: NodeId, request: bool) -> BackendResult<Outcome<()>>;

    /// Consumes a buffered frame without driving the graph.
    fn take_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<Frame>>;

    fn sink_properties(&self, sink: NodeId) -> SinkProperties;

    fn link_state(&self, sink: NodeId) -> LinkState;

    /// Whether the sink's filter schedules itself (activate-style) rather than on request.
    fn self_activating(&self, sink: NodeId) -> bool;

    /// Runs one unit of filter work. `Again` when nothing was runnable.
    fn run_once(&mut self) -> BackendResult<Outcome<()>>;

    fn request_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<()>>;

    /// Native oldest-sink scheduling, when the provider has one.
    fn request_oldest(&mut self) -> Option<BackendResult<Outcome<()>>> {
        None
    }
}

/// Settings used to open the output encoder once the sink has negotiated its format.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderSettings {
    pub codec: VideoCodec,
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub time_base: Rational,
    pub frame_rate: Rational,
    pub sample_aspect_ratio: Rational,
    pub global_header: bool,
    pub psnr: bool,
    pub global_quality: i32,
}

/// Stream-level parameters fixed when an output stream is created.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputStreamParams {
    pub codec: VideoCodec,
    pub avg_frame_rate: Rational,
    pub sample_aspect_ratio: Rational,
    pub metadata: Vec<(String, String)>,
}

pub trait Muxer {
    fn url(&self) -> &str;
    fn add_stream(&mut self, params: &OutputStreamParams) -> BackendResult<usize>;
    /// Copies the opened encoder's parameters onto the stream.
    fn configure_stream(&mut self, index: usize, params: &CodecParameters) -> BackendResult<()>;
    fn write_header(&mut self, options: &Options) -> BackendResult<()>;
    /// Stream time base; may be changed by the container when the header is written.
    fn stream_time_base(&self, index: usize) -> Rational;
    /// Interleaved write.
    fn write_packet(&mut self, packet: Packet) -> BackendResult<()>;
    fn write_trailer(&mut self) -> BackendResult<()>;
    fn bytes_written(&self) -> u64;
}

/// Factory for the capability providers of one media library.
pub trait MediaBackend {
    fn name(&self) -> &str;
    fn open_input(&self, url: &str, options: &Options) -> BackendResult<Box<dyn Demuxer>>;
    fn open_decoder(
        &self,
        stream: &StreamInfo,
        options: &Options,
    ) -> BackendResult<Box<dyn Decoder>>;
    fn parse_filter_graph(&self, description: &str, threads: usize) -> BackendResult<ParsedGraph>;
    fn open_output(
        &self,
        url: &str,
        format: ContainerFormat,
        options: &Options,
    ) -> BackendResult<Box<dyn Muxer>>;
    fn open_encoder(
        &self,
        settings: &EncoderSettings,
        options: &Options,
    ) -> BackendResult<Box<dyn Encoder>>;
}

/// Rejects option keys outside `known`, naming the first offender.
pub fn check_options(options: &Options, known: &[&str]) -> BackendResult<()> {
    match options.keys().find(|key| !known.contains(&key.as_str())) {
        Some(key) => Err(BackendError::other(format!("Option {} not found.", key))),
        None => Ok(()),
    }
}
