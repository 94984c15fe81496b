//! Packets, frames and stream descriptors exchanged with the capability providers.

use crate::rational::{Rational, NOPTS};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// Provider-owned native data attached to a packet or frame.
///
/// The pipeline never looks inside; a provider downcasts it back to its own type.
pub struct Payload(Box<dyn Any + Send>);

impl Payload {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }

    pub fn into_inner<T: Any>(self) -> Result<Box<T>, Self> {
        self.0.downcast().map_err(Self)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
    Unknown,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Yuv420p,
    Yuvj420p,
    Yuv422p,
    Yuv444p,
    Yuv420p10le,
    Nv12,
    Rgb24,
    Bgr24,
    Gray,
    #[strum(disabled)]
    #[serde(skip)]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PictureType {
    #[default]
    None,
    I,
    P,
    B,
    S,
    Si,
    Sp,
    Bi,
}

impl PictureType {
    /// Maps the picture-type byte carried in encoder quality side data.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PictureType::I,
            2 => PictureType::P,
            3 => PictureType::B,
            4 => PictureType::S,
            5 => PictureType::Si,
            6 => PictureType::Sp,
            7 => PictureType::Bi,
            _ => PictureType::None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            PictureType::None => '?',
            PictureType::I => 'I',
            PictureType::P => 'P',
            PictureType::B => 'B',
            PictureType::S => 'S',
            PictureType::Si => 'i',
            PictureType::Sp => 'p',
            PictureType::Bi => 'b',
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
pub enum FieldOrder {
    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
    #[strum(serialize = "progressive")]
    Progressive,
    #[strum(serialize = "tt")]
    TopFirst,
    #[strum(serialize = "bb")]
    BottomFirst,
}

impl FieldOrder {
    pub fn from_flags(interlaced: bool, top_field_first: bool) -> Self {
        match (interlaced, top_field_first) {
            (false, _) => FieldOrder::Progressive,
            (true, true) => FieldOrder::TopFirst,
            (true, false) => FieldOrder::BottomFirst,
        }
    }
}

/// Video encoder family of the output stream.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Mpeg4,
}

impl VideoCodec {
    pub fn encoder_name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
            VideoCodec::Mpeg4 => "mpeg4",
        }
    }
}

/// Container of the output file.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Matroska,
    Mpegts,
}

impl ContainerFormat {
    pub fn muxer_name(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Matroska => "matroska",
            ContainerFormat::Mpegts => "mpegts",
        }
    }

    /// Codec parameters travel in the container header rather than in-band.
    pub fn wants_global_header(self) -> bool {
        matches!(self, ContainerFormat::Mp4 | ContainerFormat::Matroska)
    }
}

/// Encoder statistics carried as packet side data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QualityStats {
    pub quality: i32,
    pub pict_type: PictureType,
    pub errors: [i64; 4],
    pub error_count: usize,
}

impl QualityStats {
    /// Parses the raw little-endian side data layout:
    /// `quality:u32, pict_type:u8, error_count:u8, pad:u16, errors:u64[error_count]`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }
        let quality = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let pict_type = PictureType::from_code(data[4]);
        let error_count = (data[5] as usize).min(4);
        let mut errors = [0i64; 4];
        for (i, slot) in errors.iter_mut().enumerate().take(error_count) {
            let start = 8 + 8 * i;
            let bytes = data.get(start..start + 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            *slot = i64::from_le_bytes(raw);
        }
        Some(Self {
            quality,
            pict_type,
            errors,
            error_count,
        })
    }
}

/// Descriptor of one demuxed stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: String,
    pub time_base: Rational,
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub sample_aspect_ratio: Rational,
    pub avg_frame_rate: Rational,
    /// Best guess of the real frame rate, used for filter sources.
    pub frame_rate: Rational,
    /// Out-of-band codec configuration needed to open a decoder.
    pub extradata: Vec<u8>,
}

impl StreamInfo {
    pub fn video(index: usize, codec: &str, time_base: Rational, width: i32, height: i32) -> Self {
        Self {
            index,
            media_type: MediaType::Video,
            codec: codec.to_string(),
            time_base,
            width,
            height,
            format: PixelFormat::Yuv420p,
            sample_aspect_ratio: Rational::new(0, 1),
            avg_frame_rate: Rational::new(0, 1),
            frame_rate: Rational::new(0, 1),
            extradata: Vec::new(),
        }
    }

    pub fn with_frame_rate(mut self, rate: Rational) -> Self {
        self.avg_frame_rate = rate;
        self.frame_rate = rate;
        self
    }
}

/// Parameters an opened encoder hands to the muxer for its stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodecParameters {
    pub codec: String,
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub time_base: Rational,
    pub frame_rate: Rational,
    pub sample_aspect_ratio: Rational,
    pub extradata: Vec<u8>,
}

#[derive(Debug)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub size: usize,
    pub keyframe: bool,
    pub quality: Option<QualityStats>,
    pub payload: Option<Payload>,
}

impl Packet {
    pub fn new(stream_index: usize, pts: i64, dts: i64, duration: i64, size: usize) -> Self {
        Self {
            stream_index,
            pts,
            dts,
            duration,
            size,
            keyframe: false,
            quality: None,
            payload: None,
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new(0, NOPTS, NOPTS, 0, 0)
    }
}

#[derive(Debug)]
pub struct Frame {
    pub pts: i64,
    pub best_effort_timestamp: i64,
    pub duration: i64,
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub sample_aspect_ratio: Rational,
    pub interlaced: bool,
    pub top_field_first: bool,
    pub quality: i32,
    pub pict_type: PictureType,
    pub payload: Option<Payload>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            pts: NOPTS,
            best_effort_timestamp: NOPTS,
            duration: 0,
            width: 0,
            height: 0,
            format: PixelFormat::Unknown,
            sample_aspect_ratio: Rational::new(0, 1),
            interlaced: false,
            top_field_first: false,
            quality: 0,
            pict_type: PictureType::None,
            payload: None,
        }
    }
}
