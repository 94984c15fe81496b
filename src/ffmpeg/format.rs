use super::{
    alloc_extradata, assert_consumed, check, copy_extradata, cstring, dictionary, exchange,
    from_av, media_type, packet_payload, pix_fmt_from_av, pix_fmt_to_av, rsmpeg_error, to_av,
    with_options,
};
use crate::backend::{BackendResult, Demuxer, Muxer, Options, Outcome, OutputStreamParams};
use crate::error::BackendError;
use crate::media::{CodecParameters, ContainerFormat, Packet, Payload, StreamInfo};
use crate::rational::Rational;
use log::debug;
use rsmpeg::avformat::{AVFormatContextInput, AVFormatContextOutput, AVStreamRef};
use rsmpeg::ffi;
use std::ffi::CStr;
use std::ptr::{self, NonNull};

pub struct FfmpegDemuxer {
    ctx: AVFormatContextInput,
    url: String,
    streams: Vec<StreamInfo>,
    seekable: bool,
}

impl FfmpegDemuxer {
    pub fn open(url: &str, options: &Options) -> BackendResult<Self> {
        let c_url = cstring(url)?;
        let raw = with_options(options, |dict| {
            let mut ctx = ptr::null_mut();
            check(unsafe { ffi::avformat_open_input(&mut ctx, c_url.as_ptr(), ptr::null(), dict) })?;
            NonNull::new(ctx)
                .ok_or_else(|| BackendError::other(format!("Could not open '{}'", url)))
        })?;
        // SAFETY: avformat_open_input succeeded, so `raw` is an opened input context.
        let mut ctx = unsafe { AVFormatContextInput::from_raw(raw) };
        check(unsafe { ffi::avformat_find_stream_info(ctx.as_mut_ptr(), ptr::null_mut()) })?;

        let seekable = unsafe {
            let pb = (*ctx.as_ptr()).pb;
            !pb.is_null() && (*pb).seekable != 0
        };
        let streams: Vec<StreamInfo> = ctx
            .streams()
            .into_iter()
            .enumerate()
            .map(|(index, stream)| stream_info(&stream, index))
            .collect();
        debug!(
            "Opened '{}': {} streams, {}",
            url,
            streams.len(),
            if seekable { "seekable" } else { "not seekable" }
        );
        Ok(Self {
            ctx,
            url: url.to_string(),
            streams,
            seekable,
        })
    }
}

fn stream_info(stream: &AVStreamRef, index: usize) -> StreamInfo {
    let par = stream.codecpar();
    let codec = unsafe { CStr::from_ptr(ffi::avcodec_get_name(par.codec_id)) };
    StreamInfo {
        index,
        media_type: media_type(par.codec_type),
        codec: codec.to_string_lossy().into_owned(),
        time_base: from_av(stream.time_base),
        width: par.width,
        height: par.height,
        format: pix_fmt_from_av(par.format),
        sample_aspect_ratio: from_av(par.sample_aspect_ratio),
        avg_frame_rate: from_av(stream.avg_frame_rate),
        frame_rate: stream
            .guess_framerate()
            .map(from_av)
            .unwrap_or_else(|| from_av(stream.avg_frame_rate)),
        extradata: unsafe { copy_extradata(par.extradata, par.extradata_size) },
    }
}

impl Demuxer for FfmpegDemuxer {
    fn url(&self) -> &str {
        &self.url
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn read_packet(&mut self) -> BackendResult<Outcome<Packet>> {
        let packet = match exchange(self.ctx.read_packet())? {
            Outcome::Ready(Some(packet)) => packet,
            Outcome::Ready(None) | Outcome::Eof => return Ok(Outcome::Eof),
            Outcome::Again => return Ok(Outcome::Again),
        };
        Ok(Outcome::Ready(Packet {
            stream_index: packet.stream_index as usize,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            size: packet.size.max(0) as usize,
            keyframe: packet.flags & ffi::AV_PKT_FLAG_KEY as i32 != 0,
            quality: None,
            payload: Some(Payload::new(packet)),
        }))
    }
}

pub struct FfmpegMuxer {
    ctx: AVFormatContextOutput,
    url: String,
    owns_io: bool,
    bytes: u64,
}

impl FfmpegMuxer {
    pub fn create(url: &str, format: ContainerFormat, options: &Options) -> BackendResult<Self> {
        let c_url = cstring(url)?;
        let c_format = cstring(format.muxer_name())?;
        let mut raw = ptr::null_mut();
        check(unsafe {
            ffi::avformat_alloc_output_context2(&mut raw, ptr::null(), c_format.as_ptr(), c_url.as_ptr())
        })?;
        let raw = NonNull::new(raw).ok_or_else(|| {
            BackendError::other(format!("Could not create output context for '{}'", url))
        })?;
        let mut muxer = Self {
            // SAFETY: freshly allocated output context with no custom IO attached.
            ctx: unsafe { AVFormatContextOutput::from_raw(raw) },
            url: url.to_string(),
            owns_io: false,
            bytes: 0,
        };
        let needs_file = unsafe { (*(*muxer.ctx.as_ptr()).oformat).flags & ffi::AVFMT_NOFILE as i32 == 0 };
        if needs_file {
            let ctx = muxer.ctx.as_mut_ptr();
            muxer.owns_io = true;
            with_options(options, |dict| {
                check(unsafe {
                    ffi::avio_open2(&mut (*ctx).pb, c_url.as_ptr(), ffi::AVIO_FLAG_WRITE as i32, ptr::null(), dict)
                })
            })?;
        }
        Ok(muxer)
    }

    fn stream(&self, index: usize) -> BackendResult<*mut ffi::AVStream> {
        let streams = self.ctx.streams();
        if index >= streams.len() {
            return Err(BackendError::other(format!("No output stream {}", index)));
        }
        Ok(streams[index].as_ptr() as *mut ffi::AVStream)
    }
}

impl Muxer for FfmpegMuxer {
    fn url(&self) -> &str {
        &self.url
    }

    fn add_stream(&mut self, params: &OutputStreamParams) -> BackendResult<usize> {
        let metadata = dictionary(params.metadata.iter().map(|(k, v)| (k, v)))?;
        let mut stream = self.ctx.new_stream();
        stream.set_metadata(metadata);
        unsafe {
            let raw = stream.as_mut_ptr();
            (*raw).avg_frame_rate = to_av(params.avg_frame_rate);
            (*raw).sample_aspect_ratio = to_av(params.sample_aspect_ratio);
            (*(*raw).codecpar).codec_type = ffi::AVMEDIA_TYPE_VIDEO;
        }
        Ok(stream.index as usize)
    }

    fn configure_stream(&mut self, index: usize, params: &CodecParameters) -> BackendResult<()> {
        let stream = self.stream(index)?;
        let c_codec = cstring(&params.codec)?;
        unsafe {
            let descriptor = ffi::avcodec_descriptor_get_by_name(c_codec.as_ptr());
            if descriptor.is_null() {
                return Err(BackendError::other(format!("Unknown codec '{}'", params.codec)));
            }
            let par = (*stream).codecpar;
            (*par).codec_type = ffi::AVMEDIA_TYPE_VIDEO;
            (*par).codec_id = (*descriptor).id;
            (*par).width = params.width;
            (*par).height = params.height;
            (*par).format = pix_fmt_to_av(params.format);
            (*par).sample_aspect_ratio = to_av(params.sample_aspect_ratio);
            ffi::av_freep(&mut (*par).extradata as *mut *mut u8 as *mut std::ffi::c_void);
            let (data, size) = alloc_extradata(&params.extradata)?;
            (*par).extradata = data;
            (*par).extradata_size = size;
            (*stream).time_base = to_av(params.time_base);
        }
        Ok(())
    }

    fn write_header(&mut self, options: &Options) -> BackendResult<()> {
        let mut dict = dictionary(options)?;
        self.ctx.write_header(&mut dict).map_err(rsmpeg_error)?;
        assert_consumed(&dict)?;
        if log::log_enabled!(log::Level::Debug) {
            self.ctx.dump(0, &cstring(&self.url)?).map_err(rsmpeg_error)?;
        }
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Rational {
        self.stream(index)
            .map(|stream| unsafe { from_av((*stream).time_base) })
            .unwrap_or_default()
    }

    fn write_packet(&mut self, mut packet: Packet) -> BackendResult<()> {
        let size = packet.size as u64;
        let native = packet_payload(&mut packet.payload)?;
        native.set_stream_index(packet.stream_index as i32);
        native.set_pts(packet.pts);
        native.set_dts(packet.dts);
        native.set_duration(packet.duration);
        self.ctx.interleaved_write_frame(native).map_err(rsmpeg_error)?;
        self.bytes += size;
        Ok(())
    }

    fn write_trailer(&mut self) -> BackendResult<()> {
        self.ctx.write_trailer().map_err(rsmpeg_error)
    }

    fn bytes_written(&self) -> u64 {
        let on_disk = unsafe {
            let pb = (*self.ctx.as_ptr()).pb;
            if pb.is_null() {
                -1
            } else {
                ffi::avio_size(pb)
            }
        };
        if on_disk > 0 {
            on_disk as u64
        } else {
            self.bytes
        }
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        // The IO context was opened here, not through rsmpeg, so it is closed here too.
        if self.owns_io {
            unsafe { ffi::avio_closep(&mut (*self.ctx.as_mut_ptr()).pb) };
        }
    }
}
