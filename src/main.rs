use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use ffpipe::config::{self, Config, ConfigSource};
use ffpipe::logging::{init_logging, log_relevant_env};
use ffpipe::media::{ContainerFormat, PixelFormat, VideoCodec};
use ffpipe::rational::Rational;
use ffpipe::PipelineSpec;
use log::info;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input media file or URL; repeat for several inputs
    #[arg(short = 'i', long = "input", value_name = "INPUT", required_unless_present = "print_config")]
    inputs: Vec<String>,

    /// Filter graph; every graph input must be labelled with a stream specifier, e.g. [0:v]
    #[arg(long = "filter-complex", value_name = "GRAPH")]
    filter_complex: Option<String>,

    /// Output file
    #[arg(required_unless_present = "print_config")]
    output: Option<String>,

    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// Video encoder family
    #[arg(long, value_enum)]
    encoder: Option<VideoCodec>,

    /// Output container
    #[arg(long, value_enum)]
    container: Option<ContainerFormat>,

    /// Pixel format forced at every graph output
    #[arg(long, value_name = "FORMAT")]
    pixel_format: Option<PixelFormat>,

    /// Output frame rate, e.g. 25 or 30000/1001
    #[arg(long, value_name = "RATE")]
    frame_rate: Option<Rational>,

    /// Packets buffered per input reader
    #[arg(long, value_name = "N")]
    queue_capacity: Option<usize>,

    /// Filter graph worker threads
    #[arg(long, value_name = "N")]
    filter_threads: Option<usize>,

    /// Filter steps attempted per scheduling call
    #[arg(long, value_name = "N")]
    max_filter_steps: Option<usize>,

    /// Milliseconds between progress lines
    #[arg(long, value_name = "MS")]
    progress_interval_ms: Option<u64>,

    /// Report per-plane PSNR of the encoded video
    #[arg(long, default_value_t = false)]
    psnr: bool,

    /// Demuxer option passed when opening inputs
    #[arg(long = "format-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    format_options: Vec<(String, String)>,

    /// Decoder option
    #[arg(long = "decoder-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    decoder_options: Vec<(String, String)>,

    /// Encoder option
    #[arg(long = "encoder-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    encoder_options: Vec<(String, String)>,

    /// Muxer option passed when writing the header
    #[arg(long = "muxer-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    muxer_options: Vec<(String, String)>,

    /// Protocol option passed when opening the output
    #[arg(long = "protocol-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    protocol_options: Vec<(String, String)>,

    /// Print the effective configuration as TOML and exit
    #[arg(long, default_value_t = false)]
    print_config: bool,

    /// More log output; repeat for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Less log output; repeat to silence warnings
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,

    /// Log to the local syslog daemon instead of stderr
    #[arg(long, default_value_t = false)]
    syslog: bool,
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", input)),
    }
}

fn to_options(pairs: &[(String, String)]) -> BTreeMap<String, String> {
    pairs.iter().cloned().collect()
}

impl Args {
    fn verbosity(&self) -> i8 {
        self.verbose.min(16) as i8 - self.quiet.min(16) as i8
    }

    /// Settings given on the command line, in configuration form.
    fn overrides(&self) -> Config {
        Config {
            filter_graph: self.filter_complex.clone(),
            encoder: self.encoder,
            container: self.container,
            pixel_format: self.pixel_format,
            frame_rate: self.frame_rate,
            queue_capacity: self.queue_capacity,
            filter_threads: self.filter_threads,
            max_filter_steps: self.max_filter_steps,
            progress_interval_ms: self.progress_interval_ms,
            psnr: self.psnr.then_some(true),
            format_options: to_options(&self.format_options),
            decoder_options: to_options(&self.decoder_options),
            encoder_options: to_options(&self.encoder_options),
            muxer_options: to_options(&self.muxer_options),
            protocol_options: to_options(&self.protocol_options),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity(), args.syslog)?;
    log_relevant_env();

    let loaded_config = config::load(args.config_file.as_deref())?;
    if let Some((_, source)) = &loaded_config {
        match source {
            ConfigSource::Env(path) => {
                info!(
                    "Loaded configuration from '{}' (via {}).",
                    path.display(),
                    config::CONFIG_ENV_VAR
                );
            }
            other => info!("Loaded configuration from '{}'.", other.path().display()),
        }
    }
    let merged = loaded_config
        .map(|(cfg, _)| cfg)
        .unwrap_or_default()
        .merge(args.overrides());

    let mut spec = PipelineSpec::new(
        args.inputs.clone(),
        args.output.clone().unwrap_or_default(),
        String::new(),
    );
    merged.apply(&mut spec)?;

    if args.print_config {
        let rendered = toml::to_string_pretty(&Config::from_spec(&spec))
            .context("Failed to render the configuration")?;
        print!("{}", rendered);
        return Ok(());
    }

    if spec.filter_graph.trim().is_empty() {
        bail!("No filter graph given; pass --filter-complex or set filter_graph in the configuration file");
    }
    run(&spec)
}

#[cfg(feature = "ffmpeg")]
fn run(spec: &PipelineSpec) -> Result<()> {
    let backend = ffpipe::ffmpeg::FfmpegBackend::new();
    let summary = ffpipe::transcode(&backend, spec)
        .with_context(|| format!("Transcoding into '{}' failed", spec.output))?;
    let frames: u64 = summary.outputs.iter().map(|s| s.frames_encoded).sum();
    info!(
        "Wrote {} frames ({} bytes) to '{}'",
        frames, summary.bytes_written, spec.output
    );
    Ok(())
}

#[cfg(not(feature = "ffmpeg"))]
fn run(_spec: &PipelineSpec) -> Result<()> {
    bail!(
        "{} was built without a media backend; rebuild with `--features ffmpeg` to transcode",
        env!("CARGO_PKG_NAME")
    )
}
