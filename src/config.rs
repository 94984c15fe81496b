//! TOML configuration: discovery, parsing and merging with command-line values.

use crate::backend::Options;
use crate::media::{ContainerFormat, PixelFormat, VideoCodec};
use crate::pipeline::PipelineSpec;
use crate::rational::Rational;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "FFPIPE_CONFIG";

const APP_DIR: &str = "ffpipe";
const FILE_NAME: &str = "config.toml";

/// Every setting is optional; unset values fall back to the pipeline defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_graph: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder: Option<VideoCodec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_format: Option<PixelFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<Rational>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_filter_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psnr: Option<bool>,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub format_options: Options,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub decoder_options: Options,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub encoder_options: Options,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub muxer_options: Options,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub protocol_options: Options,
}

/// Where the loaded configuration came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Cli(PathBuf),
    Env(PathBuf),
    Default(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::Cli(path) | ConfigSource::Env(path) | ConfigSource::Default(path) => path,
        }
    }
}

impl Config {
    pub fn parse(contents: &str, path: &Path) -> Result<Self> {
        toml::from_str(contents)
            .with_context(|| format!("Invalid configuration file '{}'", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {}", path.display()))?;
        Self::parse(&contents, path)
    }

    /// Values set in `overrides` win; option tables are merged key by key.
    pub fn merge(mut self, overrides: Config) -> Config {
        self.filter_graph = overrides.filter_graph.or(self.filter_graph);
        self.encoder = overrides.encoder.or(self.encoder);
        self.container = overrides.container.or(self.container);
        self.pixel_format = overrides.pixel_format.or(self.pixel_format);
        self.frame_rate = overrides.frame_rate.or(self.frame_rate);
        self.queue_capacity = overrides.queue_capacity.or(self.queue_capacity);
        self.filter_threads = overrides.filter_threads.or(self.filter_threads);
        self.max_filter_steps = overrides.max_filter_steps.or(self.max_filter_steps);
        self.progress_interval_ms = overrides.progress_interval_ms.or(self.progress_interval_ms);
        self.psnr = overrides.psnr.or(self.psnr);
        self.format_options.extend(overrides.format_options);
        self.decoder_options.extend(overrides.decoder_options);
        self.encoder_options.extend(overrides.encoder_options);
        self.muxer_options.extend(overrides.muxer_options);
        self.protocol_options.extend(overrides.protocol_options);
        self
    }

    /// Writes the set values into `spec`, rejecting values the pipeline cannot run with.
    pub fn apply(&self, spec: &mut PipelineSpec) -> Result<()> {
        if let Some(graph) = &self.filter_graph {
            spec.filter_graph = graph.clone();
        }
        if let Some(codec) = self.encoder {
            spec.stream.codec = codec;
        }
        if let Some(container) = self.container {
            spec.container = container;
        }
        if let Some(format) = self.pixel_format {
            spec.stream.pixel_format = format;
        }
        if let Some(rate) = self.frame_rate {
            if rate.num <= 0 || rate.den <= 0 {
                bail!("frame_rate must be positive, got {}", rate);
            }
            spec.stream.frame_rate = rate;
        }
        if let Some(capacity) = self.queue_capacity {
            spec.queue_capacity = positive("queue_capacity", capacity)?;
        }
        if let Some(threads) = self.filter_threads {
            spec.filter_threads = positive("filter_threads", threads)?;
        }
        if let Some(steps) = self.max_filter_steps {
            spec.max_filter_steps = positive("max_filter_steps", steps)?;
        }
        if let Some(ms) = self.progress_interval_ms {
            spec.progress_interval = Duration::from_millis(ms);
        }
        if let Some(psnr) = self.psnr {
            spec.stream.psnr = psnr;
        }
        spec.format_options.extend(self.format_options.clone());
        spec.decoder_options.extend(self.decoder_options.clone());
        spec.encoder_options.extend(self.encoder_options.clone());
        spec.muxer_options.extend(self.muxer_options.clone());
        spec.protocol_options.extend(self.protocol_options.clone());
        Ok(())
    }

    /// The effective configuration of `spec`, every key filled in.
    pub fn from_spec(spec: &PipelineSpec) -> Config {
        Config {
            filter_graph: Some(spec.filter_graph.clone()).filter(|g| !g.is_empty()),
            encoder: Some(spec.stream.codec),
            container: Some(spec.container),
            pixel_format: Some(spec.stream.pixel_format),
            frame_rate: Some(spec.stream.frame_rate),
            queue_capacity: Some(spec.queue_capacity),
            filter_threads: Some(spec.filter_threads),
            max_filter_steps: Some(spec.max_filter_steps),
            progress_interval_ms: Some(spec.progress_interval.as_millis() as u64),
            psnr: Some(spec.stream.psnr),
            format_options: spec.format_options.clone(),
            decoder_options: spec.decoder_options.clone(),
            encoder_options: spec.encoder_options.clone(),
            muxer_options: spec.muxer_options.clone(),
            protocol_options: spec.protocol_options.clone(),
        }
    }
}

fn positive(key: &str, value: usize) -> Result<usize> {
    if value == 0 {
        bail!("{} must be at least 1", key);
    }
    Ok(value)
}

/// Loads the first configuration found: `path_override`, then `$FFPIPE_CONFIG`, then the
/// default locations. An explicitly named file that does not exist is an error.
pub fn load(path_override: Option<&Path>) -> Result<Option<(Config, ConfigSource)>> {
    if let Some(path) = path_override {
        if !path.exists() {
            bail!("Configuration file '{}' does not exist", path.display());
        }
        return Ok(Some((Config::read(path)?, ConfigSource::Cli(path.to_path_buf()))));
    }

    if let Some(env_path) = env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
        let path = PathBuf::from(env_path);
        if !path.exists() {
            bail!(
                "Configuration file '{}' named by {} does not exist",
                path.display(),
                CONFIG_ENV_VAR
            );
        }
        return Ok(Some((Config::read(&path)?, ConfigSource::Env(path))));
    }

    for candidate in default_config_candidates() {
        if candidate.is_file() {
            let config = Config::read(&candidate)?;
            return Ok(Some((config, ConfigSource::Default(candidate))));
        }
    }
    Ok(None)
}

fn default_config_candidates() -> Vec<PathBuf> {
    let xdg = env::var_os("XDG_CONFIG_HOME")
        .filter(|val| !val.is_empty())
        .map(PathBuf::from);
    let exe_dir = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    config_candidates(xdg, detect_home_dir(), env::current_dir().ok(), exe_dir)
}

fn config_candidates(
    xdg_config: Option<PathBuf>,
    home: Option<PathBuf>,
    current_dir: Option<PathBuf>,
    exe_dir: Option<PathBuf>,
) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();

    let mut push_unique = |path: PathBuf, out: &mut Vec<PathBuf>| {
        if !path.as_os_str().is_empty() && seen.insert(path.clone()) {
            out.push(path);
        }
    };

    if let Some(xdg) = xdg_config {
        push_unique(xdg.join(APP_DIR).join(FILE_NAME), &mut out);
    }
    if let Some(home) = home {
        push_unique(home.join(".config").join(APP_DIR).join(FILE_NAME), &mut out);
        push_unique(home.join(format!("{}.toml", APP_DIR)), &mut out);
    }
    if let Some(cwd) = current_dir {
        push_unique(cwd.join(format!("{}.toml", APP_DIR)), &mut out);
    }
    if let Some(dir) = exe_dir {
        push_unique(dir.join(format!("{}.toml", APP_DIR)), &mut out);
    }
    push_unique(PathBuf::from("/etc").join(APP_DIR).join(FILE_NAME), &mut out);

    out
}

fn detect_home_dir() -> Option<PathBuf> {
    ["HOME", "USERPROFILE"]
        .iter()
        .filter_map(|key| env::var_os(key))
        .find(|val| !val.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
filter_graph = "[0:v]scale=1280:720[out]"
encoder = "hevc"
container = "matroska"
pixel_format = "yuv420p10le"
frame_rate = "24000/1001"
queue_capacity = 16
psnr = true

[encoder_options]
preset = "slow"
crf = "20"
"#;

    #[test]
    fn parses_every_key() {
        let config = Config::parse(SAMPLE, Path::new("sample.toml")).unwrap();
        assert_eq!(config.encoder, Some(VideoCodec::Hevc));
        assert_eq!(config.container, Some(ContainerFormat::Matroska));
        assert_eq!(config.pixel_format, Some(PixelFormat::Yuv420p10le));
        assert_eq!(config.frame_rate, Some(Rational::new(24000, 1001)));
        assert_eq!(config.queue_capacity, Some(16));
        assert_eq!(config.encoder_options.get("crf").map(String::as_str), Some("20"));
        assert!(config.decoder_options.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::parse("bogus = 1\n", Path::new("bad.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("bogus"), "{:#}", err);
        assert!(Config::parse("frame_rate = \"25/0\"\n", Path::new("bad.toml")).is_err());
    }

    #[test]
    fn overrides_win_and_tables_merge() {
        let file = Config::parse(SAMPLE, Path::new("sample.toml")).unwrap();
        let mut cli = Config {
            encoder: Some(VideoCodec::H264),
            ..Config::default()
        };
        cli.encoder_options.insert("crf".into(), "18".into());
        let merged = file.merge(cli);
        assert_eq!(merged.encoder, Some(VideoCodec::H264));
        assert_eq!(merged.container, Some(ContainerFormat::Matroska));
        assert_eq!(merged.encoder_options.get("crf").map(String::as_str), Some("18"));
        assert_eq!(merged.encoder_options.get("preset").map(String::as_str), Some("slow"));
    }

    #[test]
    fn apply_fills_the_pipeline_spec() {
        let config = Config::parse(SAMPLE, Path::new("sample.toml")).unwrap();
        let mut spec = PipelineSpec::new(vec!["in.mkv".into()], "out.mkv", "");
        config.apply(&mut spec).unwrap();
        assert_eq!(spec.filter_graph, "[0:v]scale=1280:720[out]");
        assert_eq!(spec.stream.codec, VideoCodec::Hevc);
        assert_eq!(spec.queue_capacity, 16);
        assert!(spec.stream.psnr);

        let printed = toml::to_string_pretty(&Config::from_spec(&spec)).unwrap();
        let reparsed = Config::parse(&printed, Path::new("printed.toml")).unwrap();
        assert_eq!(reparsed, Config::from_spec(&spec));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = Config {
            queue_capacity: Some(0),
            ..Config::default()
        };
        let mut spec = PipelineSpec::new(vec![], "out.mp4", "");
        assert!(config.apply(&mut spec).is_err());
    }

    #[test]
    fn explicit_path_is_loaded_or_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "filter_threads = 2").unwrap();
        let (config, source) = load(Some(file.path())).unwrap().unwrap();
        assert_eq!(config.filter_threads, Some(2));
        assert_eq!(source, ConfigSource::Cli(file.path().to_path_buf()));

        let missing = file.path().with_extension("missing");
        assert!(load(Some(&missing)).is_err());
    }

    #[test]
    fn candidate_order_and_dedup() {
        let home = PathBuf::from("/home/u");
        let candidates = config_candidates(
            Some(home.join(".config")),
            Some(home.clone()),
            Some(home.clone()),
            None,
        );
        assert_eq!(
            candidates,
            vec![
                home.join(".config/ffpipe/config.toml"),
                home.join("ffpipe.toml"),
                PathBuf::from("/etc/ffpipe/config.toml"),
            ]
        );
    }
}
