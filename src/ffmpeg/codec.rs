use super::{
    alloc_extradata, check, copy_extradata, cstring, exchange, frame_payload, from_av,
    packet_payload, pix_fmt_from_av, pix_fmt_to_av, to_av, with_options, wrap_frame,
};
use crate::backend::{BackendResult, Decoder, EncoderSettings, Encoder, Options, Outcome};
use crate::error::BackendError;
use crate::media::{CodecParameters, FieldOrder, Frame, Packet, Payload, QualityStats, StreamInfo};
use crate::rational::Rational;
use rsmpeg::avcodec::{AVCodec, AVCodecContext, AVPacket};
use rsmpeg::ffi;

/// Opens `ctx` with `codec`, rejecting options the codec did not consume.
fn open_context(ctx: &mut AVCodecContext, codec: &AVCodec, options: &Options) -> BackendResult<()> {
    with_options(options, |dict| {
        check(unsafe { ffi::avcodec_open2(ctx.as_mut_ptr(), codec.as_ptr(), dict) }).map(|_| ())
    })
}

pub struct FfmpegDecoder {
    ctx: AVCodecContext,
    name: String,
}

impl FfmpegDecoder {
    pub fn open(stream: &StreamInfo, options: &Options) -> BackendResult<Self> {
        let c_codec = cstring(&stream.codec)?;
        let descriptor = unsafe { ffi::avcodec_descriptor_get_by_name(c_codec.as_ptr()) };
        if descriptor.is_null() {
            return Err(BackendError::other(format!("Unknown codec '{}'", stream.codec)));
        }
        let codec = AVCodec::find_decoder(unsafe { (*descriptor).id }).ok_or_else(|| {
            BackendError::other(format!("Decoder not found for codec {}", stream.codec))
        })?;

        let mut ctx = AVCodecContext::new(&codec);
        ctx.set_width(stream.width);
        ctx.set_height(stream.height);
        ctx.set_pix_fmt(pix_fmt_to_av(stream.format));
        ctx.set_sample_aspect_ratio(to_av(stream.sample_aspect_ratio));
        ctx.set_time_base(to_av(stream.time_base));
        ctx.set_framerate(to_av(stream.frame_rate));
        unsafe {
            let raw = ctx.as_mut_ptr();
            (*raw).pkt_timebase = to_av(stream.time_base);
            let (data, size) = alloc_extradata(&stream.extradata)?;
            (*raw).extradata = data;
            (*raw).extradata_size = size;
        }
        open_context(&mut ctx, &codec, options)?;
        Ok(Self {
            name: codec.name().to_string_lossy().into_owned(),
            ctx,
        })
    }
}

impl Decoder for FfmpegDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn reorder_delay(&self) -> i64 {
        self.ctx.has_b_frames as i64
    }

    fn send_packet(&mut self, packet: Option<&mut Packet>) -> BackendResult<Outcome<()>> {
        let native = match packet {
            None => None,
            Some(packet) => {
                let (pts, dts, duration) = (packet.pts, packet.dts, packet.duration);
                let native = packet_payload(&mut packet.payload)?;
                native.set_pts(pts);
                native.set_dts(dts);
                native.set_duration(duration);
                Some(&*native)
            }
        };
        exchange(self.ctx.send_packet(native))
    }

    fn receive_frame(&mut self) -> BackendResult<Outcome<Frame>> {
        Ok(exchange(self.ctx.receive_frame())?.map(wrap_frame))
    }
}

pub struct FfmpegEncoder {
    ctx: AVCodecContext,
    name: String,
    codec_name: String,
    has_delay: bool,
}

impl FfmpegEncoder {
    pub fn open(settings: &EncoderSettings, options: &Options) -> BackendResult<Self> {
        let encoder_name = settings.codec.encoder_name();
        let codec = AVCodec::find_encoder_by_name(&cstring(encoder_name)?)
            .ok_or_else(|| BackendError::other(format!("Encoder {} not found", encoder_name)))?;

        let mut ctx = AVCodecContext::new(&codec);
        ctx.set_width(settings.width);
        ctx.set_height(settings.height);
        ctx.set_pix_fmt(pix_fmt_to_av(settings.format));
        ctx.set_time_base(to_av(settings.time_base));
        ctx.set_framerate(to_av(settings.frame_rate));
        ctx.set_sample_aspect_ratio(to_av(settings.sample_aspect_ratio));
        unsafe {
            let raw = ctx.as_mut_ptr();
            (*raw).global_quality = settings.global_quality;
            if settings.global_header {
                (*raw).flags |= ffi::AV_CODEC_FLAG_GLOBAL_HEADER as i32;
            }
            if settings.psnr {
                (*raw).flags |= ffi::AV_CODEC_FLAG_PSNR as i32;
            }
        }
        open_context(&mut ctx, &codec, options)?;

        let codec_name = unsafe { std::ffi::CStr::from_ptr(ffi::avcodec_get_name(codec.id)) };
        Ok(Self {
            name: codec.name().to_string_lossy().into_owned(),
            codec_name: codec_name.to_string_lossy().into_owned(),
            has_delay: codec.capabilities & ffi::AV_CODEC_CAP_DELAY as i32 != 0,
            ctx,
        })
    }
}

fn quality_stats(packet: &AVPacket) -> Option<QualityStats> {
    let mut size = 0;
    let data = unsafe {
        ffi::av_packet_get_side_data(packet.as_ptr(), ffi::AV_PKT_DATA_QUALITY_STATS, &mut size)
    };
    if data.is_null() {
        None
    } else {
        QualityStats::parse(unsafe { std::slice::from_raw_parts(data, size) })
    }
}

impl Encoder for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_delay(&self) -> bool {
        self.has_delay
    }

    fn time_base(&self) -> Rational {
        from_av(self.ctx.time_base)
    }

    fn parameters(&self) -> CodecParameters {
        let par = self.ctx.extract_codecpar();
        CodecParameters {
            codec: self.codec_name.clone(),
            width: par.width,
            height: par.height,
            format: pix_fmt_from_av(par.format),
            time_base: from_av(self.ctx.time_base),
            frame_rate: from_av(self.ctx.framerate),
            sample_aspect_ratio: from_av(par.sample_aspect_ratio),
            extradata: unsafe { copy_extradata(par.extradata, par.extradata_size) },
        }
    }

    fn set_field_order(&mut self, order: FieldOrder) {
        let value = match order {
            FieldOrder::Unknown => ffi::AV_FIELD_UNKNOWN,
            FieldOrder::Progressive => ffi::AV_FIELD_PROGRESSIVE,
            FieldOrder::TopFirst => ffi::AV_FIELD_TT,
            FieldOrder::BottomFirst => ffi::AV_FIELD_BB,
        };
        unsafe { (*self.ctx.as_mut_ptr()).field_order = value };
    }

    fn send_frame(&mut self, frame: Option<&mut Frame>) -> BackendResult<Outcome<()>> {
        let native = match frame {
            None => None,
            Some(frame) => {
                let (pts, quality) = (frame.pts, frame.quality);
                let native = frame_payload(&mut frame.payload)?;
                native.set_pts(pts);
                unsafe {
                    (*native.as_mut_ptr()).quality = quality;
                    (*native.as_mut_ptr()).pict_type = ffi::AV_PICTURE_TYPE_NONE;
                }
                Some(&*native)
            }
        };
        exchange(self.ctx.send_frame(native))
    }

    fn receive_packet(&mut self) -> BackendResult<Outcome<Packet>> {
        Ok(exchange(self.ctx.receive_packet())?.map(|packet| Packet {
            stream_index: 0,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            size: packet.size.max(0) as usize,
            keyframe: packet.flags & ffi::AV_PKT_FLAG_KEY as i32 != 0,
            quality: quality_stats(&packet),
            payload: Some(Payload::new(packet)),
        }))
    }
}
