//! FFmpeg implementation of the capability traits.
//!
//! Native objects are held in rsmpeg's owning wrappers (`AVFormatContextInput`,
//! `AVCodecContext`, `AVFilterGraph`, `AVPacket`, `AVFrame`, ...). Packets and
//! frames travel through the pipeline as [`Payload`]s holding an rsmpeg
//! `AVPacket` or `AVFrame`. Raw `ffi` calls remain only where rsmpeg has no
//! safe counterpart: leftover-option checks, buffer source/sink flags and the
//! link scheduling fields.

mod codec;
mod filter;
mod format;

pub use codec::{FfmpegDecoder, FfmpegEncoder};
pub use filter::FfmpegFilterGraph;
pub use format::{FfmpegDemuxer, FfmpegMuxer};

use crate::backend::{
    BackendResult, Decoder, Demuxer, EncoderSettings, Encoder, MediaBackend, Muxer, Options,
    Outcome, ParsedGraph,
};
use crate::error::BackendError;
use crate::media::{ContainerFormat, Frame, MediaType, Payload, PictureType, PixelFormat, StreamInfo};
use crate::rational::Rational;
use log::{debug, trace};
use rsmpeg::avcodec::AVPacket;
use rsmpeg::avutil::{ra, AVDictionary, AVFrame};
use rsmpeg::error::RsmpegError;
use rsmpeg::ffi;
use std::ffi::{CStr, CString};
use std::ptr::{self, NonNull};
use std::str::FromStr;

pub(crate) fn av_error_to_string(err: i32) -> String {
    let mut buf = [0 as std::os::raw::c_char; ffi::AV_ERROR_MAX_STRING_SIZE as usize];
    unsafe {
        if ffi::av_strerror(err, buf.as_mut_ptr(), buf.len()) == 0 {
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
        } else {
            format!("ffmpeg error {}", err)
        }
    }
}

pub(crate) fn av_error(code: i32) -> BackendError {
    BackendError::new(code, av_error_to_string(code))
}

/// Maps a negative return value to an error.
pub(crate) fn check(ret: i32) -> BackendResult<i32> {
    if ret < 0 {
        Err(av_error(ret))
    } else {
        Ok(ret)
    }
}

pub(crate) fn eagain() -> i32 {
    ffi::AVERROR(ffi::EAGAIN)
}

pub(crate) fn rsmpeg_error(err: RsmpegError) -> BackendError {
    match err.raw_error() {
        Some(code) => BackendError::new(code, format!("{} ({})", err, av_error_to_string(code))),
        None => BackendError::other(err.to_string()),
    }
}

/// Translates a send/receive/read result into the pipeline's outcome.
pub(crate) fn exchange<T>(result: Result<T, RsmpegError>) -> BackendResult<Outcome<T>> {
    match result {
        Ok(value) => Ok(Outcome::Ready(value)),
        Err(RsmpegError::DecoderDrainError) | Err(RsmpegError::EncoderDrainError) => {
            Ok(Outcome::Again)
        }
        Err(RsmpegError::DecoderFlushedError) | Err(RsmpegError::EncoderFlushedError) => {
            Ok(Outcome::Eof)
        }
        Err(err) => match err.raw_error() {
            Some(code) if code == eagain() => Ok(Outcome::Again),
            Some(ffi::AVERROR_EOF) => Ok(Outcome::Eof),
            _ => Err(rsmpeg_error(err)),
        },
    }
}

pub(crate) fn cstring(value: &str) -> BackendResult<CString> {
    CString::new(value).map_err(|_| BackendError::other(format!("Invalid string '{}'", value)))
}

pub(crate) unsafe fn c_str_lossy(ptr: *const std::os::raw::c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

pub(crate) fn to_av(r: Rational) -> ffi::AVRational {
    ra(r.num, r.den)
}

pub(crate) fn from_av(r: ffi::AVRational) -> Rational {
    Rational::new(r.num, r.den)
}

pub(crate) fn pix_fmt_to_av(format: PixelFormat) -> ffi::AVPixelFormat {
    if format == PixelFormat::Unknown {
        return ffi::AV_PIX_FMT_NONE;
    }
    match cstring(&format.to_string()) {
        Ok(name) => unsafe { ffi::av_get_pix_fmt(name.as_ptr()) },
        Err(_) => ffi::AV_PIX_FMT_NONE,
    }
}

pub(crate) fn pix_fmt_from_av(format: ffi::AVPixelFormat) -> PixelFormat {
    let name = unsafe { c_str_lossy(ffi::av_get_pix_fmt_name(format)) };
    PixelFormat::from_str(&name).unwrap_or(PixelFormat::Unknown)
}

/// Builds a dictionary from key/value pairs; `None` when there are none.
pub(crate) fn dictionary<'a>(
    entries: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> BackendResult<Option<AVDictionary>> {
    let mut dict: Option<AVDictionary> = None;
    for (key, value) in entries {
        let (k, v) = (cstring(key)?, cstring(value)?);
        dict = Some(match dict {
            None => AVDictionary::new(&k, &v, 0),
            Some(dict) => dict.set(&k, &v, 0),
        });
    }
    Ok(dict)
}

/// Fails on the first entry a callee left in its options dictionary.
pub(crate) fn assert_consumed(leftover: &Option<AVDictionary>) -> BackendResult<()> {
    let Some(dict) = leftover else {
        return Ok(());
    };
    let empty = CString::default();
    let entry = unsafe {
        ffi::av_dict_get(
            dict.as_ptr(),
            empty.as_ptr(),
            ptr::null(),
            ffi::AV_DICT_IGNORE_SUFFIX as i32,
        )
    };
    if entry.is_null() {
        return Ok(());
    }
    let key = unsafe { c_str_lossy((*entry).key) };
    Err(BackendError::other(format!("Option {} not found.", key)))
}

/// Hands `call` a native options dictionary built from `options`, then takes the
/// leftovers back and rejects any option nobody consumed.
pub(crate) fn with_options<T>(
    options: &Options,
    call: impl FnOnce(*mut *mut ffi::AVDictionary) -> BackendResult<T>,
) -> BackendResult<T> {
    let mut raw = dictionary(options)?.map_or(ptr::null_mut(), |dict| dict.into_raw().as_ptr());
    let result = call(&mut raw);
    let leftover = NonNull::new(raw).map(|dict| unsafe { AVDictionary::from_raw(dict) });
    let value = result?;
    assert_consumed(&leftover)?;
    Ok(value)
}

pub(crate) fn media_type(kind: ffi::AVMediaType) -> MediaType {
    match kind {
        ffi::AVMEDIA_TYPE_VIDEO => MediaType::Video,
        ffi::AVMEDIA_TYPE_AUDIO => MediaType::Audio,
        ffi::AVMEDIA_TYPE_SUBTITLE => MediaType::Subtitle,
        ffi::AVMEDIA_TYPE_DATA => MediaType::Data,
        ffi::AVMEDIA_TYPE_ATTACHMENT => MediaType::Attachment,
        _ => MediaType::Unknown,
    }
}

/// Describes a decoded or filtered frame, keeping the native frame as payload.
pub(crate) fn wrap_frame(frame: AVFrame) -> Frame {
    Frame {
        pts: frame.pts,
        best_effort_timestamp: frame.best_effort_timestamp,
        duration: frame.duration,
        width: frame.width,
        height: frame.height,
        format: pix_fmt_from_av(frame.format),
        sample_aspect_ratio: from_av(frame.sample_aspect_ratio),
        interlaced: frame.interlaced_frame != 0,
        top_field_first: frame.top_field_first != 0,
        quality: frame.quality,
        pict_type: PictureType::from_code(frame.pict_type as u8),
        payload: Some(Payload::new(frame)),
    }
}

pub(crate) fn packet_payload(payload: &mut Option<Payload>) -> BackendResult<&mut AVPacket> {
    payload
        .as_mut()
        .and_then(|p| p.downcast_mut::<AVPacket>())
        .ok_or_else(|| BackendError::other("Packet carries no FFmpeg data"))
}

pub(crate) fn frame_payload(payload: &mut Option<Payload>) -> BackendResult<&mut AVFrame> {
    payload
        .as_mut()
        .and_then(|p| p.downcast_mut::<AVFrame>())
        .ok_or_else(|| BackendError::other("Frame carries no FFmpeg data"))
}

/// Copies `data` into a freshly allocated, padded FFmpeg buffer.
pub(crate) unsafe fn alloc_extradata(data: &[u8]) -> BackendResult<(*mut u8, i32)> {
    if data.is_empty() {
        return Ok((ptr::null_mut(), 0));
    }
    let buf = ffi::av_mallocz(data.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
    if buf.is_null() {
        return Err(BackendError::new(ffi::AVERROR(ffi::ENOMEM), "Could not allocate extradata"));
    }
    ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
    Ok((buf, data.len() as i32))
}

pub(crate) unsafe fn copy_extradata(data: *const u8, size: i32) -> Vec<u8> {
    if data.is_null() || size <= 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data, size as usize).to_vec()
    }
}

fn av_log_level() -> i32 {
    match log::max_level() {
        log::LevelFilter::Off => ffi::AV_LOG_QUIET as i32,
        log::LevelFilter::Error => ffi::AV_LOG_ERROR as i32,
        log::LevelFilter::Warn | log::LevelFilter::Info => ffi::AV_LOG_WARNING as i32,
        log::LevelFilter::Debug => ffi::AV_LOG_VERBOSE as i32,
        log::LevelFilter::Trace => ffi::AV_LOG_DEBUG as i32,
    }
}

/// Media provider backed by the linked FFmpeg libraries.
#[derive(Debug, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        let level = av_log_level();
        unsafe {
            ffi::av_log_set_level(level);
            ffi::avformat_network_init();
        }
        debug!("FFmpeg log level set to {}", level);
        Self
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_input(&self, url: &str, options: &Options) -> BackendResult<Box<dyn Demuxer>> {
        Ok(Box::new(FfmpegDemuxer::open(url, options)?))
    }

    fn open_decoder(&self, stream: &StreamInfo, options: &Options) -> BackendResult<Box<dyn Decoder>> {
        Ok(Box::new(FfmpegDecoder::open(stream, options)?))
    }

    fn parse_filter_graph(&self, description: &str, threads: usize) -> BackendResult<ParsedGraph> {
        trace!("Parsing filter graph '{}' with {} threads", description, threads);
        FfmpegFilterGraph::parse(description, threads)
    }

    fn open_output(
        &self,
        url: &str,
        format: ContainerFormat,
        options: &Options,
    ) -> BackendResult<Box<dyn Muxer>> {
        Ok(Box::new(FfmpegMuxer::create(url, format, options)?))
    }

    fn open_encoder(
        &self,
        settings: &EncoderSettings,
        options: &Options,
    ) -> BackendResult<Box<dyn Encoder>> {
        Ok(Box::new(FfmpegEncoder::open(settings, options)?))
    }
}
