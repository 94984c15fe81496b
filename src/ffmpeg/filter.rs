use super::{
    c_str_lossy, check, cstring, eagain, frame_payload, from_av, media_type, pix_fmt_from_av,
    pix_fmt_to_av, rsmpeg_error, to_av, wrap_frame,
};
use crate::backend::{
    BackendResult, FilterGraph, LinkState, NodeId, Outcome, ParsedGraph, SinkProperties,
    SourceParams,
};
use crate::error::BackendError;
use crate::filter::{FilterEndpoint, LinkHandle};
use crate::media::{Frame, PixelFormat};
use crate::rational::Rational;
use log::trace;
use rsmpeg::avfilter::{AVFilterGraph, AVFilterInOut};
use rsmpeg::avutil::AVFrame;
use rsmpeg::ffi;
use std::os::raw::c_uint;
use std::ptr::{self, NonNull};

/// (filter, pad, label) for every entry of a parser in/out list, in list order.
fn entries(list: &Option<AVFilterInOut>) -> Vec<(*mut ffi::AVFilterContext, c_uint, Option<String>)> {
    let mut entries = Vec::new();
    let mut cur = list.as_ref().map_or(ptr::null(), |list| list.as_ptr());
    while !cur.is_null() {
        unsafe {
            let name = (*cur).name;
            let label = (!name.is_null()).then(|| c_str_lossy(name));
            entries.push(((*cur).filter_ctx, (*cur).pad_idx as c_uint, label));
            cur = (*cur).next;
        }
    }
    entries
}

/// Takes ownership of a list returned by the parser.
fn adopt(list: *mut ffi::AVFilterInOut) -> Option<AVFilterInOut> {
    NonNull::new(list).map(|list| unsafe { AVFilterInOut::from_raw(list) })
}

/// Maps a buffer source/sink return code.
fn outcome(ret: i32) -> BackendResult<Outcome<()>> {
    if ret == eagain() {
        Ok(Outcome::Again)
    } else if ret == ffi::AVERROR_EOF {
        Ok(Outcome::Eof)
    } else {
        check(ret).map(|_| Outcome::Ready(()))
    }
}

pub struct FfmpegFilterGraph {
    graph: AVFilterGraph,
    /// Unmatched input pads, addressed by the endpoint's [`LinkHandle`].
    open_inputs: Vec<(*mut ffi::AVFilterContext, c_uint)>,
    open_outputs: Vec<(*mut ffi::AVFilterContext, c_uint)>,
    /// Buffer sources and sinks, addressed by [`NodeId`].
    nodes: Vec<*mut ffi::AVFilterContext>,
}

impl FfmpegFilterGraph {
    pub fn parse(description: &str, threads: usize) -> BackendResult<ParsedGraph> {
        let mut this = Self {
            graph: AVFilterGraph::new(),
            open_inputs: Vec::new(),
            open_outputs: Vec::new(),
            nodes: Vec::new(),
        };
        let c_desc = cstring(description)?;
        let (mut raw_inputs, mut raw_outputs) = (ptr::null_mut(), ptr::null_mut());
        let ret = unsafe {
            let graph = this.graph.as_mut_ptr();
            (*graph).nb_threads = threads as i32;
            ffi::avfilter_graph_parse2(graph, c_desc.as_ptr(), &mut raw_inputs, &mut raw_outputs)
        };
        let (inputs, outputs) = (adopt(raw_inputs), adopt(raw_outputs));
        check(ret)?;

        let mut input_endpoints = Vec::new();
        for (ctx, pad, label) in entries(&inputs) {
            let endpoint = unsafe {
                endpoint(ctx, pad, label, true, LinkHandle(this.open_inputs.len()))
            };
            this.open_inputs.push((ctx, pad));
            input_endpoints.push(endpoint);
        }
        let mut output_endpoints = Vec::new();
        for (ctx, pad, label) in entries(&outputs) {
            let endpoint = unsafe {
                endpoint(ctx, pad, label, false, LinkHandle(this.open_outputs.len()))
            };
            this.open_outputs.push((ctx, pad));
            output_endpoints.push(endpoint);
        }
        trace!(
            "Parsed filter graph: {} open inputs, {} open outputs",
            input_endpoints.len(),
            output_endpoints.len()
        );
        Ok(ParsedGraph {
            graph: Box::new(this),
            inputs: input_endpoints,
            outputs: output_endpoints,
        })
    }

    fn create_filter(
        &mut self,
        filter: &str,
        name: &str,
        args: &str,
    ) -> BackendResult<*mut ffi::AVFilterContext> {
        let (c_filter, c_name, c_args) = (cstring(filter)?, cstring(name)?, cstring(args)?);
        unsafe {
            let kind = ffi::avfilter_get_by_name(c_filter.as_ptr());
            if kind.is_null() {
                return Err(BackendError::other(format!("Filter {} not found", filter)));
            }
            let mut ctx = ptr::null_mut();
            check(ffi::avfilter_graph_create_filter(
                &mut ctx,
                kind,
                c_name.as_ptr(),
                if args.is_empty() { ptr::null() } else { c_args.as_ptr() },
                ptr::null_mut(),
                self.graph.as_mut_ptr(),
            ))?;
            Ok(ctx)
        }
    }

    fn node(&self, id: NodeId) -> BackendResult<*mut ffi::AVFilterContext> {
        self.nodes
            .get(id.0)
            .copied()
            .ok_or_else(|| BackendError::other(format!("No filter node {}", id.0)))
    }

    fn push_node(&mut self, ctx: *mut ffi::AVFilterContext) -> NodeId {
        self.nodes.push(ctx);
        NodeId(self.nodes.len() - 1)
    }

    fn sink_link(&self, sink: NodeId) -> Option<*mut ffi::AVFilterLink> {
        let ctx = self.node(sink).ok()?;
        unsafe {
            if (*ctx).nb_inputs == 0 {
                return None;
            }
            let link = *(*ctx).inputs;
            (!link.is_null()).then_some(link)
        }
    }
}

unsafe fn endpoint(
    ctx: *mut ffi::AVFilterContext,
    pad: c_uint,
    label: Option<String>,
    is_input: bool,
    link: LinkHandle,
) -> FilterEndpoint {
    let (pads, count) = if is_input {
        ((*ctx).input_pads, (*ctx).nb_inputs)
    } else {
        ((*ctx).output_pads, (*ctx).nb_outputs)
    };
    FilterEndpoint::new(
        label.as_deref(),
        &c_str_lossy((*(*ctx).filter).name),
        &c_str_lossy(ffi::avfilter_pad_get_name(pads, pad as i32)),
        pad as usize,
        count as usize,
        media_type(ffi::avfilter_pad_get_type(pads, pad as i32)),
        link,
    )
}

impl FilterGraph for FfmpegFilterGraph {
    fn add_source(
        &mut self,
        endpoint: &FilterEndpoint,
        name: &str,
        params: &SourceParams,
    ) -> BackendResult<NodeId> {
        let (target, pad) = *self
            .open_inputs
            .get(endpoint.link.0)
            .ok_or_else(|| BackendError::other(format!("Unknown graph input {}", endpoint.name)))?;
        let sar = if params.sample_aspect_ratio.den > 0 {
            params.sample_aspect_ratio
        } else {
            Rational::new(0, 1)
        };
        let mut args = format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
            params.width,
            params.height,
            pix_fmt_to_av(params.format),
            params.time_base.num,
            params.time_base.den,
            sar.num,
            sar.den
        );
        if params.frame_rate.num > 0 && params.frame_rate.den > 0 {
            args.push_str(&format!(":frame_rate={}/{}", params.frame_rate.num, params.frame_rate.den));
        }
        trace!("Creating buffer source {} with {}", name, args);
        let ctx = self.create_filter("buffer", name, &args)?;
        check(unsafe { ffi::avfilter_link(ctx, 0, target, pad) })?;
        Ok(self.push_node(ctx))
    }

    fn add_sink(
        &mut self,
        endpoint: &FilterEndpoint,
        format_name: &str,
        sink_name: &str,
        format: PixelFormat,
    ) -> BackendResult<NodeId> {
        let (source, pad) = *self
            .open_outputs
            .get(endpoint.link.0)
            .ok_or_else(|| BackendError::other(format!("Unknown graph output {}", endpoint.name)))?;
        let constraint = self.create_filter("format", format_name, &format!("pix_fmts={}", format))?;
        check(unsafe { ffi::avfilter_link(source, pad, constraint, 0) })?;
        let sink = self.create_filter("buffersink", sink_name, "")?;
        check(unsafe { ffi::avfilter_link(constraint, 0, sink, 0) })?;
        Ok(self.push_node(sink))
    }

    fn configure(&mut self) -> BackendResult<()> {
        self.graph.config().map_err(rsmpeg_error)
    }

    fn describe(&self) -> String {
        unsafe {
            let dump = ffi::avfilter_graph_dump(self.graph.as_ptr() as *mut ffi::AVFilterGraph, ptr::null());
            let text = c_str_lossy(dump);
            ffi::av_free(dump as *mut std::ffi::c_void);
            text
        }
    }

    fn push_frame(&mut self, source: NodeId, mut frame: Frame) -> BackendResult<()> {
        let ctx = self.node(source)?;
        let native = frame_payload(&mut frame.payload)?;
        native.set_pts(frame.pts);
        unsafe {
            let raw = native.as_mut_ptr();
            (*raw).duration = frame.duration;
            (*raw).sample_aspect_ratio = to_av(frame.sample_aspect_ratio);
            check(ffi::av_buffersrc_add_frame_flags(
                ctx,
                raw,
                ffi::AV_BUFFERSRC_FLAG_PUSH as i32,
            ))?;
        }
        Ok(())
    }

    fn close_source(&mut self, source: NodeId, pts: i64) -> BackendResult<()> {
        let ctx = self.node(source)?;
        check(unsafe { ffi::av_buffersrc_close(ctx, pts, ffi::AV_BUFFERSRC_FLAG_PUSH as c_uint) })?;
        Ok(())
    }

    fn failed_requests(&self, source: NodeId) -> u32 {
        self.node(source)
            .map(|ctx| unsafe { ffi::av_buffersrc_get_nb_failed_requests(ctx) })
            .unwrap_or(0)
    }

    fn peek_sink(&mut self, sink: NodeId, request: bool) -> BackendResult<Outcome<()>> {
        let ctx = self.node(sink)?;
        let mut flags = ffi::AV_BUFFERSINK_FLAG_PEEK as i32;
        if !request {
            flags |= ffi::AV_BUFFERSINK_FLAG_NO_REQUEST as i32;
        }
        outcome(unsafe { ffi::av_buffersink_get_frame_flags(ctx, ptr::null_mut(), flags) })
    }

    fn take_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<Frame>> {
        let ctx = self.node(sink)?;
        let mut native = AVFrame::new();
        let ret = unsafe {
            ffi::av_buffersink_get_frame_flags(
                ctx,
                native.as_mut_ptr(),
                ffi::AV_BUFFERSINK_FLAG_NO_REQUEST as i32,
            )
        };
        Ok(outcome(ret)?.map(|()| wrap_frame(native)))
    }

    fn sink_properties(&self, sink: NodeId) -> SinkProperties {
        match self.node(sink) {
            Ok(ctx) => unsafe {
                SinkProperties {
                    width: ffi::av_buffersink_get_w(ctx),
                    height: ffi::av_buffersink_get_h(ctx),
                    format: pix_fmt_from_av(ffi::av_buffersink_get_format(ctx)),
                    time_base: from_av(ffi::av_buffersink_get_time_base(ctx)),
                    frame_rate: from_av(ffi::av_buffersink_get_frame_rate(ctx)),
                    sample_aspect_ratio: from_av(ffi::av_buffersink_get_sample_aspect_ratio(ctx)),
                }
            },
            Err(_) => SinkProperties {
                width: 0,
                height: 0,
                format: PixelFormat::Unknown,
                time_base: Rational::new(0, 1),
                frame_rate: Rational::new(0, 1),
                sample_aspect_ratio: Rational::new(0, 1),
            },
        }
    }

    fn link_state(&self, sink: NodeId) -> LinkState {
        match self.sink_link(sink) {
            Some(link) => unsafe {
                LinkState {
                    frames_out: (*link).frame_count_out.max(0) as u64,
                    frame_wanted: (*link).frame_wanted_out != 0,
                    blocked_in: (*link).frame_blocked_in != 0,
                    terminated: (*link).status_out != 0,
                }
            },
            None => LinkState::default(),
        }
    }

    fn self_activating(&self, sink: NodeId) -> bool {
        self.node(sink)
            .map(|ctx| unsafe { (*(*ctx).filter).activate.is_some() })
            .unwrap_or(false)
    }

    fn run_once(&mut self) -> BackendResult<Outcome<()>> {
        match outcome(unsafe { ffi::avfilter_graph_request_oldest(self.graph.as_mut_ptr()) })? {
            Outcome::Ready(()) => Ok(Outcome::Ready(())),
            Outcome::Again | Outcome::Eof => Ok(Outcome::Again),
        }
    }

    fn request_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<()>> {
        let ctx = self.node(sink)?;
        let ret = unsafe {
            ffi::av_buffersink_get_frame_flags(
                ctx,
                ptr::null_mut(),
                ffi::AV_BUFFERSINK_FLAG_PEEK as i32,
            )
        };
        // A pending request counts as progress.
        match outcome(ret)? {
            Outcome::Again => Ok(Outcome::Ready(())),
            other => Ok(other),
        }
    }

    fn request_oldest(&mut self) -> Option<BackendResult<Outcome<()>>> {
        Some(outcome(unsafe { ffi::avfilter_graph_request_oldest(self.graph.as_mut_ptr()) }))
    }
}
