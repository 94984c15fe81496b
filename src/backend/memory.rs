//! Deterministic in-process media backend.
//!
//! Inputs are scripted packet sequences, the decoder turns packets into frames
//! one to one, the filter graph moves frames through FIFOs, the encoder turns
//! frames back into packets and the muxer records what it was given. Codec
//! delay, reordered timestamps and live inputs can all be scripted.
//!
//! Filter descriptions are `;`-separated chains of the form
//! `[in]filter[out]`, where `filter` is `null` or `trim=N`.

use super::{
    check_options, BackendResult, Decoder, Demuxer, EncoderSettings, Encoder, FilterGraph,
    LinkState, MediaBackend, Muxer, NodeId, Options, Outcome, OutputStreamParams, ParsedGraph,
    SinkProperties, SourceParams,
};
use crate::error::BackendError;
use crate::filter::{FilterEndpoint, LinkHandle};
use crate::media::{
    CodecParameters, ContainerFormat, FieldOrder, Frame, MediaType, Packet, PictureType,
    PixelFormat, QualityStats, StreamInfo,
};
use crate::rational::{Rational, NOPTS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const FORMAT_OPTIONS: &[&str] = &["probesize", "analyzeduration", "fflags"];
const DECODER_OPTIONS: &[&str] = &["threads", "refcounted_frames"];
const ENCODER_OPTIONS: &[&str] = &["preset", "crf", "tune", "threads", "b", "g"];
const MUXER_OPTIONS: &[&str] = &["movflags", "max_delay", "muxdelay"];
const PROTOCOL_OPTIONS: &[&str] = &["rw_timeout", "timeout"];

/// Quality value stamped on encoded packets (QP 23 in lambda units).
const DEFAULT_QUALITY: i32 = 23 * 118;

/// One scripted result of a demuxer read.
#[derive(Debug)]
pub enum ReadEvent {
    Packet(Packet),
    WouldBlock,
    Fail(BackendError),
}

/// A scripted input file.
#[derive(Debug)]
pub struct MemoryInput {
    url: String,
    streams: Vec<StreamInfo>,
    events: VecDeque<ReadEvent>,
    seekable: bool,
}

impl MemoryInput {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            streams: Vec::new(),
            events: VecDeque::new(),
            seekable: true,
        }
    }

    pub fn stream(mut self, info: StreamInfo) -> Self {
        self.streams.push(info);
        self
    }

    /// Marks the input as non-seekable, making its reader use non-blocking sends.
    pub fn live(mut self) -> Self {
        self.seekable = false;
        self
    }

    pub fn event(mut self, event: ReadEvent) -> Self {
        self.events.push_back(event);
        self
    }

    pub fn packet(self, stream: usize, pts: i64, dts: i64, duration: i64) -> Self {
        self.event(ReadEvent::Packet(Packet::new(stream, pts, dts, duration, 1000)))
    }

    /// `count` packets on `stream` with `pts = dts = i * duration`.
    pub fn constant_rate(mut self, stream: usize, count: i64, duration: i64) -> Self {
        for i in 0..count {
            self = self.packet(stream, i * duration, i * duration, duration);
        }
        self
    }
}

/// Scripted decoder behaviour.
#[derive(Clone, Debug, Default)]
pub struct DecoderScript {
    /// Frames held back before the first output.
    pub delay: usize,
}

/// Scripted encoder behaviour.
#[derive(Clone, Debug, Default)]
pub struct EncoderScript {
    /// Frames held back before the first output.
    pub delay: usize,
    /// Replaces the `(pts, dts)` of successive packets, in encoder time base.
    pub timestamps: Vec<(i64, i64)>,
    /// Reports the delay capability even when `delay` is zero.
    pub has_delay: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedStream {
    pub params: OutputStreamParams,
    pub codec: Option<CodecParameters>,
    pub time_base: Rational,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxedPacket {
    pub stream: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub size: usize,
}

/// Everything a memory muxer was asked to do.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MuxLog {
    pub format: Option<ContainerFormat>,
    pub streams: Vec<RecordedStream>,
    pub header_options: Options,
    pub header_written: bool,
    pub packets: Vec<MuxedPacket>,
    pub trailer_written: bool,
}

pub type Recording = Arc<Mutex<MuxLog>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryBackend {
    inputs: Mutex<HashMap<String, MemoryInput>>,
    recordings: Mutex<HashMap<String, Recording>>,
    decoder: DecoderScript,
    encoder: EncoderScript,
    self_activating: bool,
    mux_time_base: Option<Rational>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(self, input: MemoryInput) -> Self {
        self.add_input(input);
        self
    }

    pub fn add_input(&self, input: MemoryInput) {
        lock(&self.inputs).insert(input.url.clone(), input);
    }

    pub fn with_decoder(mut self, script: DecoderScript) -> Self {
        self.decoder = script;
        self
    }

    pub fn with_encoder(mut self, script: EncoderScript) -> Self {
        self.encoder = script;
        self
    }

    /// Sinks schedule themselves, exercising the peek path of the scheduler.
    pub fn with_self_activating_sinks(mut self) -> Self {
        self.self_activating = true;
        self
    }

    /// Time base the muxer forces on every stream when the header is written.
    pub fn with_mux_time_base(mut self, time_base: Rational) -> Self {
        self.mux_time_base = Some(time_base);
        self
    }

    /// The log of the muxer opened (or to be opened) for `url`.
    pub fn recording(&self, url: &str) -> Recording {
        Arc::clone(lock(&self.recordings).entry(url.to_string()).or_default())
    }
}

impl MediaBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn open_input(&self, url: &str, options: &Options) -> BackendResult<Box<dyn Demuxer>> {
        check_options(options, FORMAT_OPTIONS)?;
        let input = lock(&self.inputs)
            .remove(url)
            .ok_or_else(|| BackendError::new(-2, "No such file or directory"))?;
        Ok(Box::new(MemoryDemuxer { input }))
    }

    fn open_decoder(&self, stream: &StreamInfo, options: &Options) -> BackendResult<Box<dyn Decoder>> {
        check_options(options, DECODER_OPTIONS)?;
        Ok(Box::new(MemoryDecoder::new(stream, self.decoder.delay)))
    }

    fn parse_filter_graph(&self, description: &str, _threads: usize) -> BackendResult<ParsedGraph> {
        MemoryFilterGraph::parse(description, self.self_activating)
    }

    fn open_output(
        &self,
        url: &str,
        format: ContainerFormat,
        options: &Options,
    ) -> BackendResult<Box<dyn Muxer>> {
        check_options(options, PROTOCOL_OPTIONS)?;
        let log = self.recording(url);
        lock(&log).format = Some(format);
        Ok(Box::new(MemoryMuxer {
            url: url.to_string(),
            log,
            time_base_override: self.mux_time_base,
            bytes: 0,
        }))
    }

    fn open_encoder(
        &self,
        settings: &EncoderSettings,
        options: &Options,
    ) -> BackendResult<Box<dyn Encoder>> {
        check_options(options, ENCODER_OPTIONS)?;
        if !settings.time_base.is_time_base() {
            return Err(BackendError::new(-22, "Invalid encoder time base"));
        }
        Ok(Box::new(MemoryEncoder {
            settings: settings.clone(),
            script: self.encoder.clone(),
            pending: VecDeque::new(),
            draining: false,
            produced: 0,
            field_order: FieldOrder::Unknown,
        }))
    }
}

struct MemoryDemuxer {
    input: MemoryInput,
}

impl Demuxer for MemoryDemuxer {
    fn url(&self) -> &str {
        &self.input.url
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.input.streams
    }

    fn is_seekable(&self) -> bool {
        self.input.seekable
    }

    fn read_packet(&mut self) -> BackendResult<Outcome<Packet>> {
        match self.input.events.pop_front() {
            Some(ReadEvent::Packet(packet)) => Ok(Outcome::Ready(packet)),
            Some(ReadEvent::WouldBlock) => Ok(Outcome::Again),
            Some(ReadEvent::Fail(err)) => Err(err),
            None => Ok(Outcome::Eof),
        }
    }
}

struct MemoryDecoder {
    name: String,
    width: i32,
    height: i32,
    format: PixelFormat,
    delay: usize,
    pending: VecDeque<Frame>,
    draining: bool,
}

impl MemoryDecoder {
    fn new(stream: &StreamInfo, delay: usize) -> Self {
        Self {
            name: stream.codec.clone(),
            width: stream.width,
            height: stream.height,
            format: stream.format,
            delay,
            pending: VecDeque::new(),
            draining: false,
        }
    }
}

impl Decoder for MemoryDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn reorder_delay(&self) -> i64 {
        self.delay as i64
    }

    fn send_packet(&mut self, packet: Option<&mut Packet>) -> BackendResult<Outcome<()>> {
        if self.draining {
            return Ok(Outcome::Eof);
        }
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(Outcome::Ready(()));
        };
        if self.pending.len() > self.delay {
            return Ok(Outcome::Again);
        }
        self.pending.push_back(Frame {
            best_effort_timestamp: packet.pts,
            duration: packet.duration,
            width: self.width,
            height: self.height,
            format: self.format,
            payload: packet.payload.take(),
            ..Frame::default()
        });
        Ok(Outcome::Ready(()))
    }

    fn receive_frame(&mut self) -> BackendResult<Outcome<Frame>> {
        if self.draining {
            return Ok(match self.pending.pop_front() {
                Some(frame) => Outcome::Ready(frame),
                None => Outcome::Eof,
            });
        }
        if self.pending.len() > self.delay {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Outcome::Ready(frame));
            }
        }
        Ok(Outcome::Again)
    }
}

struct MemoryEncoder {
    settings: EncoderSettings,
    script: EncoderScript,
    pending: VecDeque<Packet>,
    draining: bool,
    produced: usize,
    field_order: FieldOrder,
}

impl MemoryEncoder {
    fn take_ready(&mut self) -> Option<Packet> {
        let mut packet = self.pending.pop_front()?;
        if let Some(&(pts, dts)) = self.script.timestamps.get(self.produced) {
            packet.pts = pts;
            packet.dts = dts;
        }
        packet.quality = Some(QualityStats {
            quality: DEFAULT_QUALITY,
            pict_type: if self.produced == 0 {
                PictureType::I
            } else {
                PictureType::P
            },
            errors: [0; 4],
            error_count: 0,
        });
        packet.keyframe = self.produced == 0;
        self.produced += 1;
        Some(packet)
    }
}

impl Encoder for MemoryEncoder {
    fn name(&self) -> &str {
        self.settings.codec.encoder_name()
    }

    fn has_delay(&self) -> bool {
        self.script.delay > 0 || self.script.has_delay
    }

    fn time_base(&self) -> Rational {
        self.settings.time_base
    }

    fn parameters(&self) -> CodecParameters {
        CodecParameters {
            codec: self.settings.codec.to_string(),
            width: self.settings.width,
            height: self.settings.height,
            format: self.settings.format,
            time_base: self.settings.time_base,
            frame_rate: self.settings.frame_rate,
            sample_aspect_ratio: self.settings.sample_aspect_ratio,
            extradata: if self.settings.global_header {
                vec![0, 0, 0, 1]
            } else {
                Vec::new()
            },
        }
    }

    fn set_field_order(&mut self, order: FieldOrder) {
        self.field_order = order;
    }

    fn send_frame(&mut self, frame: Option<&mut Frame>) -> BackendResult<Outcome<()>> {
        if self.draining {
            return Ok(Outcome::Eof);
        }
        let Some(frame) = frame else {
            self.draining = true;
            return Ok(Outcome::Ready(()));
        };
        if self.pending.len() > self.script.delay {
            return Ok(Outcome::Again);
        }
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(BackendError::new(-22, "Frame size does not match encoder"));
        }
        let size = ((frame.width.max(1) * frame.height.max(1)) / 8).max(1) as usize;
        let mut packet = Packet::new(0, frame.pts, frame.pts, 0, size);
        packet.payload = frame.payload.take();
        self.pending.push_back(packet);
        Ok(Outcome::Ready(()))
    }

    fn receive_packet(&mut self) -> BackendResult<Outcome<Packet>> {
        if self.draining {
            return Ok(match self.take_ready() {
                Some(packet) => Outcome::Ready(packet),
                None => Outcome::Eof,
            });
        }
        if self.pending.len() > self.script.delay {
            if let Some(packet) = self.take_ready() {
                return Ok(Outcome::Ready(packet));
            }
        }
        Ok(Outcome::Again)
    }
}

#[derive(Debug, Default)]
struct Chain {
    input: Option<String>,
    output: Option<String>,
    filter: String,
    limit: Option<u64>,
    source_name: Option<String>,
    format_name: Option<String>,
    sink_name: Option<String>,
    params: Option<SourceParams>,
    sink_format: Option<PixelFormat>,
    fifo_in: VecDeque<Frame>,
    fifo_out: VecDeque<Frame>,
    closed_at: Option<i64>,
    frames_out: u64,
    wanted: bool,
    terminated: bool,
    failed_requests: u32,
}

impl Chain {
    fn parse(text: &str) -> BackendResult<Self> {
        let invalid = || BackendError::new(-22, format!("Invalid filter chain '{}'", text));
        let mut rest = text.trim();
        let mut input = None;
        if let Some(stripped) = rest.strip_prefix('[') {
            let (label, after) = stripped.split_once(']').ok_or_else(invalid)?;
            input = Some(label.to_string());
            rest = after;
        }
        let mut output = None;
        if let Some(stripped) = rest.strip_suffix(']') {
            let (before, label) = stripped.rsplit_once('[').ok_or_else(invalid)?;
            output = Some(label.to_string());
            rest = before;
        }
        let (filter, args) = match rest.trim().split_once('=') {
            Some((filter, args)) => (filter.trim(), Some(args.trim())),
            None => (rest.trim(), None),
        };
        let limit = match (filter, args) {
            ("null", None) => None,
            ("trim", Some(n)) => Some(n.parse::<u64>().map_err(|_| invalid())?),
            _ => {
                return Err(BackendError::new(
                    -22,
                    format!("No such filter: '{}'", filter),
                ))
            }
        };
        Ok(Self {
            input,
            output,
            filter: filter.to_string(),
            limit,
            ..Self::default()
        })
    }

    /// Moves one frame from input to output if the chain wants one. True when work was done.
    fn step(&mut self) -> bool {
        if !self.wanted || self.terminated {
            return false;
        }
        if self.limit.is_some_and(|limit| self.frames_out >= limit) {
            self.terminated = true;
            self.wanted = false;
            self.fifo_in.clear();
            return true;
        }
        if let Some(mut frame) = self.fifo_in.pop_front() {
            if let Some(format) = self.sink_format {
                frame.format = format;
            }
            self.fifo_out.push_back(frame);
            self.frames_out += 1;
            self.wanted = false;
            return true;
        }
        if self.closed_at.is_some() {
            self.terminated = true;
            self.wanted = false;
            return true;
        }
        self.failed_requests += 1;
        false
    }
}

/// FIFO filter graph: each chain is an independent source-to-sink pipe.
pub struct MemoryFilterGraph {
    chains: Vec<Chain>,
    self_activating: bool,
    configured: bool,
}

impl MemoryFilterGraph {
    pub fn parse(description: &str, self_activating: bool) -> BackendResult<ParsedGraph> {
        let chains = description
            .split(';')
            .filter(|c| !c.trim().is_empty())
            .map(Chain::parse)
            .collect::<BackendResult<Vec<_>>>()?;
        if chains.is_empty() {
            return Err(BackendError::new(-22, "Empty filter graph"));
        }
        let endpoint = |label: &Option<String>, filter: &str, i: usize| {
            FilterEndpoint::new(label.as_deref(), filter, "default", 0, 1, MediaType::Video, LinkHandle(i))
        };
        let inputs = chains
            .iter()
            .enumerate()
            .map(|(i, c)| endpoint(&c.input, &c.filter, i))
            .collect();
        let outputs = chains
            .iter()
            .enumerate()
            .map(|(i, c)| endpoint(&c.output, &c.filter, i))
            .collect();
        Ok(ParsedGraph {
            graph: Box::new(MemoryFilterGraph {
                chains,
                self_activating,
                configured: false,
            }),
            inputs,
            outputs,
        })
    }

    fn chain(&self, node: NodeId) -> BackendResult<&Chain> {
        self.chains
            .get(node.0)
            .ok_or_else(|| BackendError::new(-22, format!("No filter node {}", node.0)))
    }

    fn chain_mut(&mut self, node: NodeId) -> BackendResult<&mut Chain> {
        self.chains
            .get_mut(node.0)
            .ok_or_else(|| BackendError::new(-22, format!("No filter node {}", node.0)))
    }
}

impl FilterGraph for MemoryFilterGraph {
    fn add_source(
        &mut self,
        endpoint: &FilterEndpoint,
        name: &str,
        params: &SourceParams,
    ) -> BackendResult<NodeId> {
        let node = NodeId(endpoint.link.0);
        let chain = self.chain_mut(node)?;
        if chain.source_name.is_some() {
            return Err(BackendError::new(-22, format!("Input of '{}' already linked", endpoint.name)));
        }
        chain.source_name = Some(name.to_string());
        chain.params = Some(*params);
        Ok(node)
    }

    fn add_sink(
        &mut self,
        endpoint: &FilterEndpoint,
        format_name: &str,
        sink_name: &str,
        format: PixelFormat,
    ) -> BackendResult<NodeId> {
        let node = NodeId(endpoint.link.0);
        let chain = self.chain_mut(node)?;
        if chain.sink_name.is_some() {
            return Err(BackendError::new(-22, format!("Output of '{}' already linked", endpoint.name)));
        }
        chain.format_name = Some(format_name.to_string());
        chain.sink_name = Some(sink_name.to_string());
        chain.sink_format = Some(format);
        Ok(node)
    }

    fn configure(&mut self) -> BackendResult<()> {
        for chain in &self.chains {
            if chain.source_name.is_none() {
                return Err(BackendError::new(
                    -22,
                    format!("Input pad 'default' of '{}' not connected", chain.filter),
                ));
            }
            if chain.sink_name.is_none() {
                return Err(BackendError::new(
                    -22,
                    format!("Output pad 'default' of '{}' not connected", chain.filter),
                ));
            }
        }
        self.configured = true;
        Ok(())
    }

    fn describe(&self) -> String {
        self.chains
            .iter()
            .map(|c| {
                format!(
                    "[{}] -> {} -> [{}] format={} -> [{}]",
                    c.source_name.as_deref().unwrap_or("?"),
                    c.filter,
                    c.format_name.as_deref().unwrap_or("?"),
                    c.sink_format.unwrap_or_default(),
                    c.sink_name.as_deref().unwrap_or("?"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn push_frame(&mut self, source: NodeId, frame: Frame) -> BackendResult<()> {
        let chain = self.chain_mut(source)?;
        if chain.closed_at.is_some() {
            return Err(BackendError::new(-22, "Frame pushed after source was closed"));
        }
        if !chain.terminated {
            chain.fifo_in.push_back(frame);
        }
        Ok(())
    }

    fn close_source(&mut self, source: NodeId, pts: i64) -> BackendResult<()> {
        let chain = self.chain_mut(source)?;
        if chain.closed_at.is_none() {
            chain.closed_at = Some(pts);
        }
        Ok(())
    }

    fn failed_requests(&self, source: NodeId) -> u32 {
        self.chain(source).map(|c| c.failed_requests).unwrap_or(0)
    }

    fn peek_sink(&mut self, sink: NodeId, request: bool) -> BackendResult<Outcome<()>> {
        loop {
            let chain = self.chain_mut(sink)?;
            if !chain.fifo_out.is_empty() {
                return Ok(Outcome::Ready(()));
            }
            if chain.terminated {
                return Ok(Outcome::Eof);
            }
            if !request {
                return Ok(Outcome::Again);
            }
            chain.wanted = true;
            if !chain.step() {
                return Ok(Outcome::Again);
            }
        }
    }

    fn take_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<Frame>> {
        let chain = self.chain_mut(sink)?;
        Ok(match chain.fifo_out.pop_front() {
            Some(frame) => Outcome::Ready(frame),
            None if chain.terminated => Outcome::Eof,
            None => Outcome::Again,
        })
    }

    fn sink_properties(&self, sink: NodeId) -> SinkProperties {
        let chain = self.chain(sink).ok();
        let params = chain.and_then(|c| c.params).unwrap_or(SourceParams {
            width: 0,
            height: 0,
            format: PixelFormat::Unknown,
            time_base: Rational::new(0, 1),
            sample_aspect_ratio: Rational::new(0, 1),
            frame_rate: Rational::new(0, 1),
        });
        SinkProperties {
            width: params.width,
            height: params.height,
            format: chain.and_then(|c| c.sink_format).unwrap_or(params.format),
            time_base: params.time_base,
            frame_rate: params.frame_rate,
            sample_aspect_ratio: params.sample_aspect_ratio,
        }
    }

    fn link_state(&self, sink: NodeId) -> LinkState {
        self.chain(sink)
            .map(|c| LinkState {
                frames_out: c.frames_out,
                frame_wanted: c.wanted,
                blocked_in: false,
                terminated: c.terminated,
            })
            .unwrap_or_default()
    }

    fn self_activating(&self, _sink: NodeId) -> bool {
        self.self_activating
    }

    fn run_once(&mut self) -> BackendResult<Outcome<()>> {
        if !self.configured {
            return Err(BackendError::new(-22, "Filter graph is not configured"));
        }
        let mut worked = false;
        for chain in &mut self.chains {
            if chain.step() {
                worked = true;
                break;
            }
        }
        Ok(if worked { Outcome::Ready(()) } else { Outcome::Again })
    }

    fn request_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<()>> {
        let chain = self.chain_mut(sink)?;
        if chain.terminated && chain.fifo_out.is_empty() {
            return Ok(Outcome::Eof);
        }
        if !chain.terminated {
            chain.wanted = true;
        }
        Ok(Outcome::Ready(()))
    }
}

struct MemoryMuxer {
    url: String,
    log: Recording,
    time_base_override: Option<Rational>,
    bytes: u64,
}

impl MemoryMuxer {
    fn stream_check(log: &MuxLog, index: usize) -> BackendResult<()> {
        if index >= log.streams.len() {
            return Err(BackendError::new(-22, format!("Invalid stream index {}", index)));
        }
        Ok(())
    }
}

impl Muxer for MemoryMuxer {
    fn url(&self) -> &str {
        &self.url
    }

    fn add_stream(&mut self, params: &OutputStreamParams) -> BackendResult<usize> {
        let mut log = lock(&self.log);
        if log.header_written {
            return Err(BackendError::new(-22, "Stream added after header"));
        }
        log.streams.push(RecordedStream {
            params: params.clone(),
            codec: None,
            time_base: Rational::new(0, 1),
        });
        Ok(log.streams.len() - 1)
    }

    fn configure_stream(&mut self, index: usize, params: &CodecParameters) -> BackendResult<()> {
        let mut log = lock(&self.log);
        Self::stream_check(&log, index)?;
        let stream = &mut log.streams[index];
        stream.codec = Some(params.clone());
        if !stream.time_base.is_time_base() {
            stream.time_base = params.time_base.reduce();
        }
        Ok(())
    }

    fn write_header(&mut self, options: &Options) -> BackendResult<()> {
        check_options(options, MUXER_OPTIONS)?;
        let mut log = lock(&self.log);
        if let Some(stream) = log.streams.iter().position(|s| s.codec.is_none()) {
            return Err(BackendError::new(
                -22,
                format!("Stream #{} has no codec parameters", stream),
            ));
        }
        if let Some(time_base) = self.time_base_override {
            for stream in &mut log.streams {
                stream.time_base = time_base;
            }
        }
        log.header_options = options.clone();
        log.header_written = true;
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Rational {
        lock(&self.log)
            .streams
            .get(index)
            .map(|s| s.time_base)
            .unwrap_or_default()
    }

    fn write_packet(&mut self, packet: Packet) -> BackendResult<()> {
        let mut log = lock(&self.log);
        if !log.header_written || log.trailer_written {
            return Err(BackendError::new(-22, "Packet written outside header/trailer"));
        }
        Self::stream_check(&log, packet.stream_index)?;
        if packet.dts == NOPTS {
            return Err(BackendError::new(-22, "Packet without dts"));
        }
        self.bytes += packet.size as u64;
        log.packets.push(MuxedPacket {
            stream: packet.stream_index,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            size: packet.size,
        });
        Ok(())
    }

    fn write_trailer(&mut self) -> BackendResult<()> {
        let mut log = lock(&self.log);
        if !log.header_written {
            return Err(BackendError::new(-22, "Trailer written before header"));
        }
        if log.trailer_written {
            return Err(BackendError::new(-22, "Trailer already written"));
        }
        log.trailer_written = true;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}
