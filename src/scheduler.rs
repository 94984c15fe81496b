//! Pull scheduling across the sinks of a filter graph.
//!
//! The sink that has produced the fewest frames is served first, so no output
//! runs ahead of the others. Sinks live in an indexed binary min-heap; a sink
//! that reaches end of stream is removed in O(log n).

use crate::backend::{FilterGraph, NodeId, Outcome};
use crate::error::{BackendContext, Result};
use log::{debug, trace};

pub const DEFAULT_MAX_STEPS: usize = 64;

/// What one scheduling call achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// The oldest sink now has a frame to collect.
    Ready,
    /// Nothing can be produced until more input arrives.
    Again,
    /// Every sink has reached end of stream.
    Exhausted,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    sink: NodeId,
    age: u64,
}

/// Min-heap of sinks keyed by output frame count, with O(1) position lookup.
#[derive(Debug, Default)]
pub struct SinkHeap {
    entries: Vec<Entry>,
    /// `positions[sink.0]` is the sink's heap slot, `None` once removed.
    positions: Vec<Option<usize>>,
}

impl SinkHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sink: NodeId) -> bool {
        self.position(sink).is_some()
    }

    pub fn peek(&self) -> Option<NodeId> {
        self.entries.first().map(|e| e.sink)
    }

    fn position(&self, sink: NodeId) -> Option<usize> {
        self.positions.get(sink.0).copied().flatten()
    }

    pub fn push(&mut self, sink: NodeId, age: u64) {
        if self.contains(sink) {
            self.update(sink, age);
            return;
        }
        if self.positions.len() <= sink.0 {
            self.positions.resize(sink.0 + 1, None);
        }
        self.entries.push(Entry { sink, age });
        let slot = self.entries.len() - 1;
        self.positions[sink.0] = Some(slot);
        self.sift_up(slot);
    }

    /// Changes the key of a sink already in the heap.
    pub fn update(&mut self, sink: NodeId, age: u64) {
        let Some(slot) = self.position(sink) else {
            return;
        };
        let old = self.entries[slot].age;
        self.entries[slot].age = age;
        if age < old {
            self.sift_up(slot);
        } else {
            self.sift_down(slot);
        }
    }

    pub fn remove(&mut self, sink: NodeId) -> bool {
        let Some(slot) = self.position(sink) else {
            return false;
        };
        let last = self.entries.len() - 1;
        self.swap(slot, last);
        self.entries.pop();
        self.positions[sink.0] = None;
        if slot < self.entries.len() {
            self.sift_down(slot);
            self.sift_up(slot);
        }
        true
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions[self.entries[a].sink.0] = Some(a);
        self.positions[self.entries[b].sink.0] = Some(b);
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (x, y) = (&self.entries[a], &self.entries[b]);
        (x.age, x.sink) < (y.age, y.sink)
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.less(slot, parent) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < self.entries.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.entries.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}

pub struct FilterGraphScheduler {
    heap: SinkHeap,
    max_steps: usize,
}

impl FilterGraphScheduler {
    pub fn new(sinks: &[NodeId], graph: &dyn FilterGraph, max_steps: usize) -> Self {
        let mut heap = SinkHeap::new();
        for &sink in sinks {
            heap.push(sink, graph.link_state(sink).frames_out);
        }
        Self {
            heap,
            max_steps: max_steps.max(1),
        }
    }

    /// Sinks that have not reached end of stream.
    pub fn active(&self) -> usize {
        self.heap.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drives the graph until the oldest sink has a new frame, it runs out of
    /// input, or the step bound is hit.
    pub fn request_oldest(&mut self, graph: &mut dyn FilterGraph) -> Result<Schedule> {
        if let Some(native) = graph.request_oldest() {
            return Ok(match native.backend_context(|| "request oldest sink".to_string())? {
                Outcome::Ready(()) => Schedule::Ready,
                Outcome::Again => Schedule::Again,
                Outcome::Eof => {
                    self.heap = SinkHeap::new();
                    Schedule::Exhausted
                }
            });
        }

        let oldest = loop {
            let Some(oldest) = self.heap.peek() else {
                return Ok(Schedule::Exhausted);
            };
            let requested = if graph.self_activating(oldest) {
                let peeked = graph
                    .peek_sink(oldest, true)
                    .backend_context(|| format!("peek sink {}", oldest.0))?;
                if !peeked.is_eof() {
                    self.heap.update(oldest, graph.link_state(oldest).frames_out);
                    return Ok(match peeked {
                        Outcome::Ready(()) => Schedule::Ready,
                        _ => Schedule::Again,
                    });
                }
                peeked
            } else {
                graph
                    .request_frame(oldest)
                    .backend_context(|| format!("request frame on sink {}", oldest.0))?
            };
            if !requested.is_eof() {
                break oldest;
            }
            debug!("Sink {} reached end of stream, {} left", oldest.0, self.heap.len() - 1);
            self.heap.remove(oldest);
        };

        let start = graph.link_state(oldest).frames_out;
        for step in 0..self.max_steps {
            let state = graph.link_state(oldest);
            if state.frames_out != start {
                self.heap.update(oldest, state.frames_out);
                trace!("Sink {} produced a frame after {} steps", oldest.0, step);
                return Ok(Schedule::Ready);
            }
            let ran = graph
                .run_once()
                .backend_context(|| "run filter graph".to_string())?;
            if let Outcome::Again = ran {
                let state = graph.link_state(oldest);
                if state.frames_out != start {
                    continue;
                }
                if state.frame_wanted || state.blocked_in || state.terminated {
                    return Ok(Schedule::Again);
                }
                graph
                    .request_frame(oldest)
                    .backend_context(|| format!("request frame on sink {}", oldest.0))?;
            }
        }
        let state = graph.link_state(oldest);
        if state.frames_out != start {
            self.heap.update(oldest, state.frames_out);
            return Ok(Schedule::Ready);
        }
        Ok(Schedule::Again)
    }
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;
    use crate::backend::memory::MemoryFilterGraph;
    use crate::backend::{BackendResult, LinkState, SinkProperties, SourceParams};
    use crate::filter::FilterEndpoint;
    use crate::media::{Frame, PixelFormat};
    use crate::rational::Rational;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Call {
        Request,
        Peek,
    }

    /// One request or peek as the graph saw it.
    #[derive(Clone, Debug)]
    struct Traced {
        call: Call,
        sink: NodeId,
        before: LinkState,
        after_idle_run: bool,
        eof: bool,
    }

    /// Delegates to a graph and records every request and peek the scheduler makes.
    struct Tracing {
        inner: Box<dyn FilterGraph>,
        idle_run: bool,
        calls: Vec<Traced>,
    }

    impl Tracing {
        fn record(
            &mut self,
            call: Call,
            sink: NodeId,
            before: LinkState,
            result: &BackendResult<Outcome<()>>,
        ) {
            self.calls.push(Traced {
                call,
                sink,
                before,
                after_idle_run: self.idle_run,
                eof: matches!(result, Ok(Outcome::Eof)),
            });
            self.idle_run = false;
        }

        fn eofs(&self, sink: NodeId) -> usize {
            self.calls.iter().filter(|c| c.sink == sink && c.eof).count()
        }
    }

    impl FilterGraph for Tracing {
        fn add_source(
            &mut self,
            endpoint: &FilterEndpoint,
            name: &str,
            params: &SourceParams,
        ) -> BackendResult<NodeId> {
            self.inner.add_source(endpoint, name, params)
        }

        fn add_sink(
            &mut self,
            endpoint: &FilterEndpoint,
            format_name: &str,
            sink_name: &str,
            format: PixelFormat,
        ) -> BackendResult<NodeId> {
            self.inner.add_sink(endpoint, format_name, sink_name, format)
        }

        fn configure(&mut self) -> BackendResult<()> {
            self.inner.configure()
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }

        fn push_frame(&mut self, source: NodeId, frame: Frame) -> BackendResult<()> {
            self.inner.push_frame(source, frame)
        }

        fn close_source(&mut self, source: NodeId, pts: i64) -> BackendResult<()> {
            self.inner.close_source(source, pts)
        }

        fn failed_requests(&self, source: NodeId) -> u32 {
            self.inner.failed_requests(source)
        }

        fn peek_sink(&mut self, sink: NodeId, request: bool) -> BackendResult<Outcome<()>> {
            let before = self.inner.link_state(sink);
            let result = self.inner.peek_sink(sink, request);
            self.record(Call::Peek, sink, before, &result);
            result
        }

        fn take_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<Frame>> {
            self.inner.take_frame(sink)
        }

        fn sink_properties(&self, sink: NodeId) -> SinkProperties {
            self.inner.sink_properties(sink)
        }

        fn link_state(&self, sink: NodeId) -> LinkState {
            self.inner.link_state(sink)
        }

        fn self_activating(&self, sink: NodeId) -> bool {
            self.inner.self_activating(sink)
        }

        fn run_once(&mut self) -> BackendResult<Outcome<()>> {
            let result = self.inner.run_once();
            self.idle_run = matches!(result, Ok(Outcome::Again));
            result
        }

        fn request_frame(&mut self, sink: NodeId) -> BackendResult<Outcome<()>> {
            let before = self.inner.link_state(sink);
            let result = self.inner.request_frame(sink);
            self.record(Call::Request, sink, before, &result);
            result
        }
    }

    fn frame(pts: i64) -> Frame {
        Frame {
            pts,
            width: 64,
            height: 48,
            format: PixelFormat::Yuv420p,
            ..Frame::default()
        }
    }

    /// Three chains capped at 2, 3 and unbounded frames; every source is fed then closed.
    fn three_sinks(self_activating: bool) -> (Tracing, Vec<NodeId>) {
        let parsed =
            MemoryFilterGraph::parse("[0:v]trim=2[a];[1:v]trim=3[b];[2:v]null[c]", self_activating)
                .unwrap();
        let mut graph = Tracing {
            inner: parsed.graph,
            idle_run: false,
            calls: Vec::new(),
        };
        let params = SourceParams {
            width: 64,
            height: 48,
            format: PixelFormat::Yuv420p,
            time_base: Rational::new(1, 25),
            sample_aspect_ratio: Rational::new(1, 1),
            frame_rate: Rational::new(25, 1),
        };
        let mut sinks = Vec::new();
        for (i, (input, output)) in parsed.inputs.iter().zip(&parsed.outputs).enumerate() {
            let source = graph
                .add_source(input, &format!("input stream {}:0", i), &params)
                .unwrap();
            let fed = if i == 2 { 1 } else { 5 };
            for pts in 0..fed {
                graph.push_frame(source, frame(pts)).unwrap();
            }
            graph.close_source(source, fed).unwrap();
            sinks.push(
                graph
                    .add_sink(output, &format!("format :{}", i), &format!("output stream :{}", i), PixelFormat::Yuv420p)
                    .unwrap(),
            );
        }
        graph.configure().unwrap();
        (graph, sinks)
    }

    /// Schedules until every sink is exhausted, collecting frames per sink.
    fn run_to_exhaustion(graph: &mut Tracing, sinks: &[NodeId]) -> Vec<usize> {
        let mut scheduler = FilterGraphScheduler::new(sinks, &*graph, DEFAULT_MAX_STEPS);
        let mut taken = vec![0; sinks.len()];
        for _ in 0..100 {
            graph.idle_run = false;
            let active = scheduler.active();
            let schedule = scheduler.request_oldest(graph).unwrap();
            assert!(scheduler.active() <= active);
            if schedule == Schedule::Exhausted {
                assert!(scheduler.is_exhausted());
                for &sink in sinks {
                    assert!(graph.link_state(sink).terminated, "sink {} still open", sink.0);
                }
                assert_eq!(scheduler.request_oldest(graph).unwrap(), Schedule::Exhausted);
                return taken;
            }
            assert!(!scheduler.is_exhausted());
            for (i, &sink) in sinks.iter().enumerate() {
                while let Outcome::Ready(_) = graph.take_frame(sink).unwrap() {
                    taken[i] += 1;
                }
            }
        }
        panic!("scheduler never exhausted its sinks");
    }

    #[test]
    fn every_sink_ends_before_the_graph_is_exhausted() {
        let (mut graph, sinks) = three_sinks(false);
        assert_eq!(run_to_exhaustion(&mut graph, &sinks), vec![2, 3, 1]);
        for &sink in &sinks {
            assert_eq!(graph.eofs(sink), 1, "sink {} removed more than once", sink.0);
        }
        assert!(graph.calls.iter().all(|c| c.call == Call::Request));
    }

    #[test]
    fn self_activating_sinks_are_peeked() {
        let (mut graph, sinks) = three_sinks(true);
        assert_eq!(run_to_exhaustion(&mut graph, &sinks), vec![2, 3, 1]);
        for &sink in &sinks {
            assert_eq!(graph.eofs(sink), 1);
        }
        assert!(graph.calls.iter().all(|c| c.call == Call::Peek));
        // Oldest first: the first three peeks visit each sink once.
        let first: Vec<usize> = graph.calls.iter().take(3).map(|c| c.sink.0).collect();
        assert_eq!(first, vec![0, 1, 2]);
    }

    #[test]
    fn idle_runs_request_only_idle_links() {
        let (mut graph, sinks) = three_sinks(false);
        run_to_exhaustion(&mut graph, &sinks);
        for traced in graph.calls.iter().filter(|c| c.after_idle_run) {
            assert!(!traced.before.frame_wanted, "{:?}", traced);
            assert!(!traced.before.blocked_in, "{:?}", traced);
            assert!(!traced.before.terminated, "{:?}", traced);
        }

        let mut graph = Stalled::default();
        let mut scheduler = FilterGraphScheduler::new(&[NodeId(0)], &graph, 4);
        assert_eq!(scheduler.request_oldest(&mut graph).unwrap(), Schedule::Again);
        assert_eq!(graph.runs, 4);
        assert_eq!(graph.requests, 5);

        for state in [
            LinkState { frame_wanted: true, ..LinkState::default() },
            LinkState { blocked_in: true, ..LinkState::default() },
        ] {
            let mut graph = Stalled { state, ..Stalled::default() };
            let mut scheduler = FilterGraphScheduler::new(&[NodeId(0)], &graph, 4);
            assert_eq!(scheduler.request_oldest(&mut graph).unwrap(), Schedule::Again);
            assert_eq!(graph.runs, 1, "{:?}", state);
            assert_eq!(graph.requests, 1, "{:?}", state);
        }
    }

    #[test]
    fn busy_graph_stops_after_max_steps() {
        let mut graph = Stalled {
            busy: true,
            ..Stalled::default()
        };
        let mut scheduler = FilterGraphScheduler::new(&[NodeId(0)], &graph, DEFAULT_MAX_STEPS);
        assert_eq!(scheduler.request_oldest(&mut graph).unwrap(), Schedule::Again);
        assert_eq!(graph.runs, DEFAULT_MAX_STEPS);
        assert_eq!(graph.requests, 1);
        assert_eq!(scheduler.active(), 1);

        let mut scheduler = FilterGraphScheduler::new(&[NodeId(0)], &graph, 0);
        graph.runs = 0;
        assert_eq!(scheduler.request_oldest(&mut graph).unwrap(), Schedule::Again);
        assert_eq!(graph.runs, 1);
    }

    #[test]
    fn native_scheduling_is_passed_through() {
        let mut graph = Stalled {
            native: Some(Outcome::Ready(())),
            ..Stalled::default()
        };
        let mut scheduler = FilterGraphScheduler::new(&[NodeId(0), NodeId(1)], &graph, DEFAULT_MAX_STEPS);
        assert_eq!(scheduler.request_oldest(&mut graph).unwrap(), Schedule::Ready);
        assert_eq!((graph.runs, graph.requests), (0, 0));

        graph.native = Some(Outcome::Eof);
        assert_eq!(scheduler.request_oldest(&mut graph).unwrap(), Schedule::Exhausted);
        assert!(scheduler.is_exhausted());
        assert_eq!((graph.runs, graph.requests), (0, 0));
    }

    /// A single sink that never produces a frame.
    #[derive(Default)]
    struct Stalled {
        state: LinkState,
        /// `run_once` reports work without ever producing.
        busy: bool,
        native: Option<Outcome<()>>,
        runs: usize,
        requests: usize,
    }

    impl FilterGraph for Stalled {
        fn add_source(&mut self, _: &FilterEndpoint, _: &str, _: &SourceParams) -> BackendResult<NodeId> {
            Ok(NodeId(0))
        }

        fn add_sink(&mut self, _: &FilterEndpoint, _: &str, _: &str, _: PixelFormat) -> BackendResult<NodeId> {
            Ok(NodeId(0))
        }

        fn configure(&mut self) -> BackendResult<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            String::new()
        }

        fn push_frame(&mut self, _: NodeId, _: Frame) -> BackendResult<()> {
            Ok(())
        }

        fn close_source(&mut self, _: NodeId, _: i64) -> BackendResult<()> {
            Ok(())
        }

        fn failed_requests(&self, _: NodeId) -> u32 {
            0
        }

        fn peek_sink(&mut self, _: NodeId, _: bool) -> BackendResult<Outcome<()>> {
            Ok(Outcome::Again)
        }

        fn take_frame(&mut self, _: NodeId) -> BackendResult<Outcome<Frame>> {
            Ok(Outcome::Again)
        }

        fn sink_properties(&self, _: NodeId) -> SinkProperties {
            SinkProperties {
                width: 0,
                height: 0,
                format: PixelFormat::Unknown,
                time_base: Rational::new(0, 1),
                frame_rate: Rational::new(0, 1),
                sample_aspect_ratio: Rational::new(0, 1),
            }
        }

        fn link_state(&self, _: NodeId) -> LinkState {
            self.state
        }

        fn self_activating(&self, _: NodeId) -> bool {
            false
        }

        fn run_once(&mut self) -> BackendResult<Outcome<()>> {
            self.runs += 1;
            Ok(if self.busy { Outcome::Ready(()) } else { Outcome::Again })
        }

        fn request_frame(&mut self, _: NodeId) -> BackendResult<Outcome<()>> {
            self.requests += 1;
            Ok(Outcome::Ready(()))
        }

        fn request_oldest(&mut self) -> Option<BackendResult<Outcome<()>>> {
            self.native.take().map(Ok)
        }
    }

    #[test]
    fn heap_orders_by_age_and_removes_anywhere() {
        let mut heap = SinkHeap::new();
        for (sink, age) in [(0, 5), (1, 2), (2, 9), (3, 2), (4, 0)] {
            heap.push(NodeId(sink), age);
        }
        assert_eq!(heap.peek(), Some(NodeId(4)));
        assert!(heap.remove(NodeId(4)));
        assert!(!heap.remove(NodeId(4)));
        assert_eq!(heap.peek(), Some(NodeId(1)));
        heap.update(NodeId(1), 10);
        assert_eq!(heap.peek(), Some(NodeId(3)));
        assert!(heap.remove(NodeId(0)));

        let mut order = Vec::new();
        while let Some(sink) = heap.peek() {
            order.push(sink.0);
            heap.remove(sink);
        }
        assert_eq!(order, vec![3, 2, 1]);
        assert!(heap.is_empty());
    }

    #[test]
    fn heap_stays_consistent_under_mixed_operations() {
        let mut heap = SinkHeap::new();
        for sink in 0..32 {
            heap.push(NodeId(sink), ((sink * 7919) % 13) as u64);
        }
        for sink in (0..32).step_by(3) {
            heap.remove(NodeId(sink));
        }
        for sink in (1..32).step_by(4) {
            heap.update(NodeId(sink), (sink as u64 * 31) % 17);
        }
        let mut last = (0u64, NodeId(0));
        let mut first = true;
        while let Some(sink) = heap.peek() {
            let slot = heap.position(sink).unwrap();
            let key = (heap.entries[slot].age, sink);
            if !first {
                assert!(key >= last, "{:?} popped after {:?}", key, last);
            }
            first = false;
            last = key;
            heap.remove(sink);
        }
    }
}
