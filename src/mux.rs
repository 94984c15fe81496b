//! Output file handling and mux-time timestamp correction.

use crate::backend::{MediaBackend, Muxer, Options, OutputStreamParams};
use crate::error::{BackendContext, PipelineError, Result};
use crate::media::{CodecParameters, ContainerFormat, Packet};
use crate::rational::{Rational, NOPTS};
use log::{debug, info, warn};

/// Muxer interleaving delay, in microseconds.
pub const MAX_DELAY_US: i64 = 700_000;

/// Median of three.
pub fn mid_pred(a: i64, b: i64, c: i64) -> i64 {
    a.min(b).max(a.max(b).min(c))
}

/// Keeps the dts of one output stream strictly increasing and never above its pts.
#[derive(Clone, Debug)]
pub struct MuxTimestamps {
    file_index: usize,
    stream_index: usize,
    last_mux_dts: i64,
}

impl MuxTimestamps {
    pub fn new(file_index: usize, stream_index: usize) -> Self {
        Self {
            file_index,
            stream_index,
            last_mux_dts: NOPTS,
        }
    }

    pub fn last_mux_dts(&self) -> i64 {
        self.last_mux_dts
    }

    /// Corrects `packet` (stream time base) in place and records its dts.
    pub fn correct(&mut self, packet: &mut Packet) {
        let next = self.last_mux_dts.saturating_add(1);

        if packet.dts != NOPTS && packet.pts != NOPTS && packet.dts > packet.pts {
            warn!(
                "Invalid DTS: {} PTS: {} in output stream {}:{}, replacing by guess",
                packet.dts, packet.pts, self.file_index, self.stream_index
            );
            let guess = mid_pred(packet.pts, packet.dts, next);
            packet.pts = guess;
            packet.dts = guess;
        }

        if packet.dts != NOPTS && self.last_mux_dts != NOPTS && packet.dts < next {
            warn!(
                "Non-monotonous DTS in output stream {}:{}; previous: {}, current: {}; changing to {}. \
                 This may result in incorrect timestamps in the output file.",
                self.file_index, self.stream_index, self.last_mux_dts, packet.dts, next
            );
            if packet.pts >= packet.dts {
                packet.pts = packet.pts.max(next);
            }
            packet.dts = next;
        }

        self.last_mux_dts = packet.dts;
        packet.stream_index = self.stream_index;
    }
}

/// The output container. The header and the trailer are each written at most once.
pub struct OutputFile {
    index: usize,
    format: ContainerFormat,
    muxer: Box<dyn Muxer>,
    header_written: bool,
    trailer_written: bool,
}

impl OutputFile {
    pub fn open(
        index: usize,
        backend: &dyn MediaBackend,
        url: &str,
        format: ContainerFormat,
        protocol_options: &Options,
    ) -> Result<Self> {
        let muxer = backend
            .open_output(url, format, protocol_options)
            .backend_context(|| format!("Could not open output file '{}'", url))?;
        debug!("Opened output #{} '{}' as {}", index, url, format);
        Ok(Self {
            index,
            format,
            muxer,
            header_written: false,
            trailer_written: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn url(&self) -> &str {
        self.muxer.url()
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn is_finished(&self) -> bool {
        self.trailer_written
    }

    pub fn add_stream(&mut self, params: &OutputStreamParams) -> Result<usize> {
        self.muxer
            .add_stream(params)
            .backend_context(|| format!("Could not create stream in '{}'", self.muxer.url()))
    }

    pub fn configure_stream(&mut self, stream: usize, params: &CodecParameters) -> Result<()> {
        self.muxer.configure_stream(stream, params).backend_context(|| {
            format!(
                "Error initializing output stream {}:{}",
                self.index, stream
            )
        })
    }

    pub fn stream_time_base(&self, stream: usize) -> Rational {
        self.muxer.stream_time_base(stream)
    }

    pub fn write_header(&mut self, options: &Options) -> Result<()> {
        if self.header_written {
            return Err(PipelineError::Setup(format!(
                "header of '{}' already written",
                self.muxer.url()
            )));
        }
        let mut options = options.clone();
        options
            .entry("max_delay".to_string())
            .or_insert_with(|| MAX_DELAY_US.to_string());
        self.muxer.write_header(&options).backend_context(|| {
            format!(
                "Could not write header for output file #{} (incorrect codec parameters ?)",
                self.index
            )
        })?;
        self.header_written = true;
        info!("Output #{}, {}, to '{}'", self.index, self.format, self.muxer.url());
        Ok(())
    }

    pub fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let stream = packet.stream_index;
        self.muxer.write_packet(packet).backend_context(|| {
            format!("Error muxing a packet for output stream {}:{}", self.index, stream)
        })
    }

    /// Writes the trailer. Later calls are no-ops.
    pub fn finish(&mut self) -> Result<()> {
        if self.trailer_written {
            return Ok(());
        }
        if !self.header_written {
            return Err(PipelineError::Setup(format!(
                "trailer requested before header for '{}'",
                self.muxer.url()
            )));
        }
        self.muxer
            .write_trailer()
            .backend_context(|| format!("Error writing trailer of '{}'", self.muxer.url()))?;
        self.trailer_written = true;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.muxer.bytes_written()
    }
}
