//! Filter graph endpoints and the binding of graph inputs to demuxed streams.

use crate::backend::SourceParams;
use crate::error::{PipelineError, Result};
use crate::media::{MediaType, StreamInfo};
use std::fmt;
use std::str::FromStr;

/// Provider-defined handle of an unmatched pad.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub usize);

/// One unmatched input or output pad of a parsed filter graph.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterEndpoint {
    /// Link label from the graph description, e.g. `0:v` in `[0:v]scale=...`.
    pub label: Option<String>,
    /// `filter` or `filter:pad` when the filter has several pads.
    pub name: String,
    pub pad: usize,
    pub media_type: MediaType,
    pub link: LinkHandle,
}

impl FilterEndpoint {
    pub fn new(
        label: Option<&str>,
        filter: &str,
        pad_name: &str,
        pad: usize,
        pad_count: usize,
        media_type: MediaType,
        link: LinkHandle,
    ) -> Self {
        Self {
            label: label.filter(|l| !l.is_empty()).map(str::to_string),
            name: describe_pad(filter, pad_name, pad_count),
            pad,
            media_type,
            link,
        }
    }
}

/// Human-readable pad name.
pub fn describe_pad(filter: &str, pad_name: &str, pad_count: usize) -> String {
    if pad_count > 1 {
        format!("{}:{}", filter, pad_name)
    } else {
        filter.to_string()
    }
}

pub fn source_name(file: usize, stream: usize) -> String {
    format!("input stream {}:{}", file, stream)
}

pub fn format_name(output: usize) -> String {
    format!("format :{}", output)
}

pub fn sink_name(output: usize) -> String {
    format!("output stream :{}", output)
}

/// Buffer source properties for a decoded stream.
pub fn source_params(stream: &StreamInfo) -> SourceParams {
    SourceParams {
        width: stream.width,
        height: stream.height,
        format: stream.format,
        time_base: stream.time_base,
        sample_aspect_ratio: stream.sample_aspect_ratio,
        frame_rate: stream.frame_rate,
    }
}

/// Selects streams of one input file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamSpecifier {
    /// Any stream; the first one wins.
    All,
    Index(usize),
    Type(MediaType),
    /// The n-th stream of a type, e.g. `v:1`.
    TypeIndex(MediaType, usize),
}

impl StreamSpecifier {
    pub fn matches(&self, stream: &StreamInfo, streams: &[StreamInfo]) -> bool {
        match self {
            StreamSpecifier::All => true,
            StreamSpecifier::Index(index) => stream.index == *index,
            StreamSpecifier::Type(kind) => stream.media_type == *kind,
            StreamSpecifier::TypeIndex(kind, nth) => {
                stream.media_type == *kind
                    && streams
                        .iter()
                        .filter(|s| s.media_type == *kind)
                        .position(|s| s.index == stream.index)
                        == Some(*nth)
            }
        }
    }
}

fn media_type_code(code: &str) -> Option<MediaType> {
    match code {
        "v" | "V" => Some(MediaType::Video),
        "a" => Some(MediaType::Audio),
        "s" => Some(MediaType::Subtitle),
        "d" => Some(MediaType::Data),
        "t" => Some(MediaType::Attachment),
        _ => None,
    }
}

fn media_type_letter(kind: MediaType) -> Option<char> {
    match kind {
        MediaType::Video => Some('v'),
        MediaType::Audio => Some('a'),
        MediaType::Subtitle => Some('s'),
        MediaType::Data => Some('d'),
        MediaType::Attachment => Some('t'),
        MediaType::Unknown => None,
    }
}

impl FromStr for StreamSpecifier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(StreamSpecifier::All);
        }
        if let Ok(index) = s.parse::<usize>() {
            return Ok(StreamSpecifier::Index(index));
        }
        let (kind, rest) = match s.split_once(':') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (s, None),
        };
        let kind = media_type_code(kind).ok_or_else(|| format!("invalid stream specifier '{}'", s))?;
        match rest {
            None => Ok(StreamSpecifier::Type(kind)),
            Some(nth) => nth
                .parse::<usize>()
                .map(|n| StreamSpecifier::TypeIndex(kind, n))
                .map_err(|_| format!("invalid stream specifier '{}'", s)),
        }
    }
}

impl fmt::Display for StreamSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSpecifier::All => Ok(()),
            StreamSpecifier::Index(i) => write!(f, "{}", i),
            StreamSpecifier::Type(kind) => write_kind(f, *kind),
            StreamSpecifier::TypeIndex(kind, n) => {
                write_kind(f, *kind)?;
                write!(f, ":{}", n)
            }
        }
    }
}

fn write_kind(f: &mut fmt::Formatter<'_>, kind: MediaType) -> fmt::Result {
    match media_type_letter(kind) {
        Some(letter) => write!(f, "{}", letter),
        None => write!(f, "{}", kind),
    }
}

/// A graph input label resolved to `(file, specifier)`: `1:v` selects the first video
/// stream of input file 1; a bare specifier refers to file 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSelection {
    pub file: usize,
    pub specifier: StreamSpecifier,
}

impl StreamSelection {
    pub fn parse(label: &str) -> Result<Self> {
        let digits = label.bytes().take_while(u8::is_ascii_digit).count();
        let (file, rest) = if digits > 0 {
            let file = label[..digits]
                .parse::<usize>()
                .map_err(|e| PipelineError::FilterGraph(format!("invalid label '{}': {}", label, e)))?;
            match &label[digits..] {
                "" => (file, ""),
                rest if rest.starts_with(':') => (file, &rest[1..]),
                _ => {
                    return Err(PipelineError::FilterGraph(format!(
                        "invalid input label '{}'",
                        label
                    )))
                }
            }
        } else {
            (0, label)
        };
        let specifier = rest.parse::<StreamSpecifier>().map_err(PipelineError::FilterGraph)?;
        Ok(Self { file, specifier })
    }

    /// Index of the first stream in `streams` matching the specifier.
    pub fn resolve(&self, streams: &[StreamInfo]) -> Option<usize> {
        streams
            .iter()
            .find(|s| self.specifier.matches(s, streams))
            .map(|s| s.index)
    }
}

/// Resolves an input endpoint to `(file, stream)`. Only labelled video inputs are allowed.
pub fn bind_input(endpoint: &FilterEndpoint, files: &[&[StreamInfo]]) -> Result<(usize, usize)> {
    if endpoint.media_type != MediaType::Video {
        return Err(PipelineError::FilterGraph(format!(
            "only video filters supported currently (input pad '{}' is {})",
            endpoint.name, endpoint.media_type
        )));
    }
    let label = endpoint.label.as_deref().ok_or_else(|| {
        PipelineError::FilterGraph(format!(
            "only named inputs supported (pad '{}' has no label)",
            endpoint.name
        ))
    })?;
    let selection = StreamSelection::parse(label)?;
    let streams = files.get(selection.file).ok_or_else(|| {
        PipelineError::FilterGraph(format!("invalid file index {} in label '{}'", selection.file, label))
    })?;
    let index = selection.resolve(streams).ok_or_else(|| {
        PipelineError::FilterGraph(format!(
            "stream specifier '{}' in label '{}' matches no streams of input file {}",
            selection.specifier, label, selection.file
        ))
    })?;
    Ok((selection.file, index))
}

#[cfg(test)]
mod filter_tests {
    use super::*;
    use crate::rational::Rational;

    fn streams() -> Vec<StreamInfo> {
        let mut audio = StreamInfo::video(1, "aac", Rational::new(1, 48000), 0, 0);
        audio.media_type = MediaType::Audio;
        vec![
            StreamInfo::video(0, "h264", Rational::new(1, 90000), 640, 360),
            audio,
            StreamInfo::video(2, "mjpeg", Rational::new(1, 90000), 320, 180),
        ]
    }

    fn endpoint(label: Option<&str>, media_type: MediaType) -> FilterEndpoint {
        FilterEndpoint::new(label, "overlay", "main", 0, 2, media_type, LinkHandle(0))
    }

    #[test]
    fn pad_names() {
        assert_eq!(describe_pad("scale", "default", 1), "scale");
        assert_eq!(describe_pad("overlay", "overlay", 2), "overlay:overlay");
        assert_eq!(source_name(0, 3), "input stream 0:3");
        assert_eq!(format_name(1), "format :1");
        assert_eq!(sink_name(1), "output stream :1");
    }

    #[test]
    fn specifiers_select_streams() {
        let s = streams();
        let pick = |label: &str| StreamSelection::parse(label).unwrap().resolve(&s);
        assert_eq!(pick("0:v"), Some(0));
        assert_eq!(pick("0:v:1"), Some(2));
        assert_eq!(pick("0:1"), Some(1));
        assert_eq!(pick("0:a"), Some(1));
        assert_eq!(pick("0"), Some(0));
        assert_eq!(pick("v:2"), None);
        assert!(StreamSelection::parse("0:x").is_err());
        assert_eq!(
            StreamSelection::parse("2:v:0").unwrap(),
            StreamSelection {
                file: 2,
                specifier: StreamSpecifier::TypeIndex(MediaType::Video, 0)
            }
        );
    }

    #[test]
    fn binding_requires_labelled_video_pads() {
        let s = streams();
        let files = [s.as_slice()];
        assert_eq!(bind_input(&endpoint(Some("0:v:1"), MediaType::Video), &files).unwrap(), (0, 2));
        assert!(bind_input(&endpoint(None, MediaType::Video), &files).is_err());
        assert!(bind_input(&endpoint(Some("0:a"), MediaType::Audio), &files).is_err());
        assert!(bind_input(&endpoint(Some("3:v"), MediaType::Video), &files).is_err());
    }

    #[test]
    fn empty_label_counts_as_unnamed() {
        let e = FilterEndpoint::new(Some(""), "null", "default", 0, 1, MediaType::Video, LinkHandle(4));
        assert_eq!(e.label, None);
        assert_eq!(e.name, "null");
    }

    #[test]
    fn specifiers_print_back_in_label_syntax() {
        for label in ["", "3", "v", "a:1", "s", "d:0", "t", "t:2"] {
            let spec = label.parse::<StreamSpecifier>().unwrap();
            assert_eq!(spec.to_string(), label);
            assert_eq!(spec.to_string().parse::<StreamSpecifier>().unwrap(), spec);
        }
        assert_eq!(StreamSpecifier::Type(MediaType::Attachment).to_string(), "t");
    }

    #[test]
    fn unmatched_specifier_is_reported_with_its_file() {
        let s = streams();
        let files = [s.as_slice()];
        let err = bind_input(&endpoint(Some("0:v:5"), MediaType::Video), &files).unwrap_err();
        assert!(err.to_string().contains("'v:5' in label '0:v:5'"), "{}", err);
        assert!(err.to_string().contains("input file 0"), "{}", err);
    }
}
