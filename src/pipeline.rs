//! The transcoding pipeline: setup, the single-threaded tick loop and teardown.
//!
//! One orchestrator thread owns every decoder, the filter graph, the encoders
//! and the muxer. Reader threads only touch their packet queue.

use crate::backend::{FilterGraph, MediaBackend, NodeId, Options, Outcome};
use crate::decode::{InputStats, InputStream};
use crate::encode::{OutputStats, OutputStream, OutputStreamSpec};
use crate::error::{BackendContext, PipelineError, Result};
use crate::filter::{bind_input, format_name, sink_name, source_name, source_params};
use crate::input::{InputFile, DEFAULT_RECV_WAIT};
use crate::media::{ContainerFormat, MediaType, Packet, StreamInfo};
use crate::mux::OutputFile;
use crate::progress::{input_stats_lines, output_stats_lines, ProgressReporter, DEFAULT_INTERVAL};
use crate::queue::DEFAULT_CAPACITY;
use crate::scheduler::{FilterGraphScheduler, Schedule, DEFAULT_MAX_STEPS};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

/// Sleep between ticks that moved nothing.
const IDLE_DELAY: Duration = Duration::from_millis(1);

pub const DEFAULT_FILTER_THREADS: usize = 4;

/// Everything needed to build a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSpec {
    pub inputs: Vec<String>,
    pub output: String,
    pub container: ContainerFormat,
    pub filter_graph: String,
    pub stream: OutputStreamSpec,
    pub filter_threads: usize,
    pub queue_capacity: usize,
    pub max_filter_steps: usize,
    pub progress_interval: Duration,
    /// Longest a tick waits on a seekable input's queue.
    pub input_wait: Duration,
    pub format_options: Options,
    pub decoder_options: Options,
    pub encoder_options: Options,
    pub muxer_options: Options,
    pub protocol_options: Options,
}

impl PipelineSpec {
    pub fn new(inputs: Vec<String>, output: impl Into<String>, filter_graph: impl Into<String>) -> Self {
        Self {
            inputs,
            output: output.into(),
            container: ContainerFormat::default(),
            filter_graph: filter_graph.into(),
            stream: OutputStreamSpec::default(),
            filter_threads: DEFAULT_FILTER_THREADS,
            queue_capacity: DEFAULT_CAPACITY,
            max_filter_steps: DEFAULT_MAX_STEPS,
            progress_interval: DEFAULT_INTERVAL,
            input_wait: DEFAULT_RECV_WAIT,
            format_options: Options::new(),
            decoder_options: Options::new(),
            encoder_options: Options::new(),
            muxer_options: Options::new(),
            protocol_options: Options::new(),
        }
    }
}

/// Statistics of a completed run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineSummary {
    pub inputs: Vec<InputStats>,
    pub outputs: Vec<OutputStats>,
    pub bytes_written: u64,
    pub ticks: u64,
}

pub struct Pipeline {
    inputs: Vec<InputFile>,
    streams: Vec<InputStream>,
    /// `(file, stream index)` to position in `streams`.
    routes: HashMap<(usize, usize), usize>,
    graph: Box<dyn FilterGraph>,
    scheduler: FilterGraphScheduler,
    output: OutputFile,
    outputs: Vec<OutputStream>,
    progress: ProgressReporter,
    ticks: u64,
}

impl Pipeline {
    /// Opens every resource, writes the output header and starts the reader threads.
    pub fn open(backend: &dyn MediaBackend, spec: &PipelineSpec) -> Result<Self> {
        if spec.inputs.is_empty() {
            return Err(PipelineError::Setup("no input files".to_string()));
        }
        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for (index, url) in spec.inputs.iter().enumerate() {
            let input = InputFile::open(index, backend, url, &spec.format_options, spec.queue_capacity)?
                .with_recv_wait(spec.input_wait);
            inputs.push(input);
        }

        let parsed = backend
            .parse_filter_graph(&spec.filter_graph, spec.filter_threads)
            .backend_context(|| format!("Error parsing filter graph '{}'", spec.filter_graph))?;
        let mut graph = parsed.graph;
        if parsed.outputs.is_empty() {
            return Err(PipelineError::FilterGraph("the graph has no outputs".to_string()));
        }

        let files: Vec<&[StreamInfo]> = inputs.iter().map(InputFile::streams).collect();
        let mut streams = Vec::new();
        let mut routes = HashMap::new();
        for endpoint in &parsed.inputs {
            let (file, index) = bind_input(endpoint, &files)?;
            if routes.contains_key(&(file, index)) {
                return Err(PipelineError::FilterGraph(format!(
                    "stream #{}:{} is already bound to another input of the graph",
                    file, index
                )));
            }
            let info = files[file]
                .iter()
                .find(|s| s.index == index)
                .ok_or_else(|| PipelineError::stream(file, index, "stream disappeared"))?;
            let mut stream = InputStream::open(file, info, backend, &spec.decoder_options)?;
            let source = graph
                .add_source(endpoint, &source_name(file, index), &source_params(info))
                .backend_context(|| format!("Error creating the buffer source of stream #{}:{}", file, index))?;
            stream.bind_source(source);
            debug!("Bound stream #{}:{} to graph input '{}'", file, index, endpoint.name);
            routes.insert((file, index), streams.len());
            streams.push(stream);
        }

        let mut output = OutputFile::open(0, backend, &spec.output, spec.container, &spec.protocol_options)?;
        let mut outputs = Vec::with_capacity(parsed.outputs.len());
        for (i, endpoint) in parsed.outputs.iter().enumerate() {
            if endpoint.media_type != MediaType::Video {
                return Err(PipelineError::FilterGraph(format!(
                    "output '{}' is {}, only video outputs are supported",
                    endpoint.name, endpoint.media_type
                )));
            }
            let sink = graph
                .add_sink(endpoint, &format_name(i), &sink_name(i), spec.stream.pixel_format)
                .backend_context(|| format!("Error creating the sink of output '{}'", endpoint.name))?;
            outputs.push(OutputStream::new(&mut output, sink, &spec.stream)?);
        }

        graph
            .configure()
            .backend_context(|| "Error configuring the filter graph".to_string())?;
        debug!("Filter graph:\n{}", graph.describe());

        for stream in &mut outputs {
            stream.open_encoder(backend, graph.as_ref(), &mut output, &spec.encoder_options)?;
        }
        output.write_header(&spec.muxer_options)?;

        let sinks: Vec<NodeId> = outputs.iter().map(OutputStream::sink).collect();
        let scheduler = FilterGraphScheduler::new(&sinks, graph.as_ref(), spec.max_filter_steps);

        for input in &mut inputs {
            input.start()?;
        }
        info!(
            "Transcoding {} input stream(s) into {} output stream(s)",
            streams.len(),
            outputs.len()
        );

        Ok(Self {
            inputs,
            streams,
            routes,
            graph,
            scheduler,
            output,
            outputs,
            progress: ProgressReporter::new(spec.progress_interval),
            ticks: 0,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.outputs.iter().all(OutputStream::is_finished)
    }

    /// Runs ticks until every output is finished, then writes the trailer.
    pub fn run(mut self) -> Result<PipelineSummary> {
        while !self.is_finished() {
            if !self.tick()? {
                thread::sleep(IDLE_DELAY);
            }
        }
        self.finish()
    }

    /// One pass over inputs, the scheduler and the outputs. True when anything moved.
    pub fn tick(&mut self) -> Result<bool> {
        self.ticks += 1;
        let mut progressed = false;

        for file in self.input_order() {
            if self.inputs[file].is_eof() {
                continue;
            }
            match self.inputs[file].read_packet()? {
                Outcome::Ready(packet) => {
                    self.route_packet(file, packet)?;
                    progressed = true;
                }
                Outcome::Again => {}
                Outcome::Eof => {
                    self.flush_file(file)?;
                    progressed = true;
                }
            }
        }

        if !self.scheduler.is_exhausted() {
            match self.scheduler.request_oldest(self.graph.as_mut())? {
                Schedule::Ready => progressed = true,
                Schedule::Again => {}
                Schedule::Exhausted => {
                    debug!("Every filter graph output reached end of stream");
                    progressed = true;
                }
            }
        }

        for stream in &mut self.outputs {
            if stream.is_finished() {
                continue;
            }
            loop {
                match stream.pull_frame(self.graph.as_mut())? {
                    Outcome::Ready(frame) => {
                        stream.encode_frame(frame, &mut self.output)?;
                        progressed = true;
                    }
                    Outcome::Again => break,
                    Outcome::Eof => {
                        stream.flush(&mut self.output)?;
                        progressed = true;
                        break;
                    }
                }
            }
        }

        self.progress
            .report(&self.outputs, self.output.bytes_written(), false);
        Ok(progressed)
    }

    /// Input files ordered by how often their buffer sources were starved, most first.
    fn input_order(&self) -> Vec<usize> {
        let mut starved = vec![0u64; self.inputs.len()];
        for stream in &self.streams {
            if let Some(source) = stream.source() {
                starved[stream.stats().file_index] += u64::from(self.graph.failed_requests(source));
            }
        }
        let mut order: Vec<usize> = (0..self.inputs.len()).collect();
        order.sort_by(|a, b| starved[*b].cmp(&starved[*a]));
        order
    }

    fn route_packet(&mut self, file: usize, packet: Packet) -> Result<()> {
        match self.routes.get(&(file, packet.stream_index)) {
            Some(&slot) => {
                self.streams[slot].decode_packet(packet, self.graph.as_mut())?;
            }
            None => trace!(
                "Discarding packet of unused stream #{}:{}",
                file,
                packet.stream_index
            ),
        }
        Ok(())
    }

    fn flush_file(&mut self, file: usize) -> Result<()> {
        debug!("Input #{} '{}' reached end of file", file, self.inputs[file].url());
        for stream in self
            .streams
            .iter_mut()
            .filter(|s| s.stats().file_index == file)
        {
            stream.flush(self.graph.as_mut())?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<PipelineSummary> {
        self.output.finish()?;
        self.progress
            .report(&self.outputs, self.output.bytes_written(), true);

        for input in &mut self.inputs {
            input.close()?;
        }
        for input in &self.inputs {
            let stats: Vec<&InputStats> = self
                .streams
                .iter()
                .map(InputStream::stats)
                .filter(|s| s.file_index == input.index())
                .collect();
            for line in input_stats_lines(input.index(), input.url(), &stats) {
                debug!("{}", line);
            }
        }
        let stats: Vec<&OutputStats> = self.outputs.iter().map(OutputStream::stats).collect();
        for line in output_stats_lines(self.output.index(), self.output.url(), &stats) {
            debug!("{}", line);
        }

        Ok(PipelineSummary {
            inputs: self.streams.iter().map(|s| s.stats().clone()).collect(),
            outputs: self.outputs.iter().map(|s| s.stats().clone()).collect(),
            bytes_written: self.output.bytes_written(),
            ticks: self.ticks,
        })
    }
}

/// Opens and runs a pipeline to completion.
pub fn transcode(backend: &dyn MediaBackend, spec: &PipelineSpec) -> Result<PipelineSummary> {
    Pipeline::open(backend, spec)?.run()
}
