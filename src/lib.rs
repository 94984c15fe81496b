//! Threaded video transcoding pipeline: demux, decode, filter, encode and mux.
//!
//! Media work goes through the capability traits in [`backend`]. The FFmpeg
//! provider lives in [`ffmpeg`] behind the `ffmpeg` feature; [`backend::memory`]
//! is a scripted in-process provider.

pub mod backend;
pub mod codec;
pub mod config;
pub mod decode;
pub mod encode;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod filter;
pub mod input;
pub mod logging;
pub mod media;
pub mod mux;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod rational;
pub mod scheduler;
pub mod timestamp;

pub use error::{PipelineError, Result};
pub use pipeline::{transcode, Pipeline, PipelineSpec, PipelineSummary};
