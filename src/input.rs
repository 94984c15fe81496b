//! Input files and their reader threads.
//!
//! Each input file runs one reader thread that owns the demuxer and pushes
//! packets into a bounded [`crate::queue`]. Closing the file signals the queue,
//! drains it, joins the thread and only then releases the demuxer.

use crate::backend::{Demuxer, MediaBackend, Options, Outcome};
use crate::error::{BackendContext, PipelineError, Result};
use crate::media::{Packet, StreamInfo};
use crate::queue::{packet_queue, QueueEnd, QueueReceiver, QueueSender, Received, RecvMode, SendError};
use log::{debug, error, warn};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause before retrying a demuxer that had nothing ready or a full queue.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Longest the orchestrator waits on a seekable input per receive.
pub const DEFAULT_RECV_WAIT: Duration = Duration::from_millis(10);

enum Reader {
    Idle {
        demuxer: Box<dyn Demuxer>,
        sender: QueueSender,
    },
    Running(JoinHandle<Box<dyn Demuxer>>),
    Closed,
}

pub struct InputFile {
    index: usize,
    url: String,
    streams: Vec<StreamInfo>,
    live: bool,
    receiver: QueueReceiver,
    reader: Reader,
    recv_wait: Duration,
    eof: bool,
}

impl InputFile {
    pub fn open(
        index: usize,
        backend: &dyn MediaBackend,
        url: &str,
        options: &Options,
        queue_capacity: usize,
    ) -> Result<Self> {
        let demuxer = backend
            .open_input(url, options)
            .backend_context(|| format!("Could not open input file '{}'", url))?;
        Ok(Self::from_demuxer(index, demuxer, queue_capacity))
    }

    pub fn from_demuxer(index: usize, demuxer: Box<dyn Demuxer>, queue_capacity: usize) -> Self {
        let (sender, receiver) = packet_queue(queue_capacity);
        let live = !demuxer.is_seekable();
        debug!(
            "Opened input #{} '{}' ({} streams{})",
            index,
            demuxer.url(),
            demuxer.streams().len(),
            if live { ", live" } else { "" }
        );
        Self {
            index,
            url: demuxer.url().to_string(),
            streams: demuxer.streams().to_vec(),
            live,
            receiver,
            reader: Reader::Idle { demuxer, sender },
            recv_wait: DEFAULT_RECV_WAIT,
            eof: false,
        }
    }

    pub fn with_recv_wait(mut self, wait: Duration) -> Self {
        self.recv_wait = wait;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn is_running(&self) -> bool {
        matches!(self.reader, Reader::Running(_))
    }

    /// Spawns the reader thread. Calling it again is a no-op.
    pub fn start(&mut self) -> Result<()> {
        let (demuxer, sender) = match std::mem::replace(&mut self.reader, Reader::Closed) {
            Reader::Idle { demuxer, sender } => (demuxer, sender),
            other => {
                self.reader = other;
                return Ok(());
            }
        };
        let live = self.live;
        let handle = thread::Builder::new()
            .name(format!("demux{}:{}", self.index, short_name(&self.url)))
            .spawn(move || read_loop(demuxer, sender, live))?;
        self.reader = Reader::Running(handle);
        Ok(())
    }

    /// Next packet from the reader thread. Never blocks longer than the receive wait.
    pub fn read_packet(&mut self) -> Result<Outcome<Packet>> {
        if self.eof {
            return Ok(Outcome::Eof);
        }
        let mode = if self.live {
            RecvMode::NonBlocking
        } else {
            RecvMode::Wait(self.recv_wait)
        };
        match self.receiver.recv(mode) {
            Received::Packet(packet) => Ok(Outcome::Ready(packet)),
            Received::Empty => Ok(Outcome::Again),
            Received::Closed(QueueEnd::Eof) => {
                self.eof = true;
                Ok(Outcome::Eof)
            }
            Received::Closed(QueueEnd::Failed(source)) => Err(PipelineError::backend(
                format!("Error reading input file '{}'", self.url),
                source,
            )),
        }
    }

    /// Stops the reader and releases the demuxer. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.reader, Reader::Closed) {
            Reader::Closed => Ok(()),
            Reader::Idle { demuxer, sender } => {
                drop(sender);
                drop(demuxer);
                Ok(())
            }
            Reader::Running(handle) => {
                self.receiver.close(QueueEnd::Eof);
                let mut dropped = self.receiver.drain();
                let joined = handle.join();
                dropped += self.receiver.drain();
                if dropped > 0 {
                    debug!("Discarded {} queued packets of '{}'", dropped, self.url);
                }
                match joined {
                    Ok(demuxer) => {
                        drop(demuxer);
                        debug!("Closed input #{} '{}'", self.index, self.url);
                        Ok(())
                    }
                    Err(_) => Err(PipelineError::ReaderPanicked(self.url.clone())),
                }
            }
        }
    }
}

impl Drop for InputFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}", e);
        }
    }
}

fn short_name(url: &str) -> &str {
    url.rsplit(['/', '\\']).next().unwrap_or(url)
}

fn read_loop(mut demuxer: Box<dyn Demuxer>, sender: QueueSender, live: bool) -> Box<dyn Demuxer> {
    loop {
        let packet = match demuxer.read_packet() {
            Ok(Outcome::Ready(packet)) => packet,
            Ok(Outcome::Again) => {
                if sender.is_closed() {
                    break;
                }
                thread::sleep(RETRY_DELAY);
                continue;
            }
            Ok(Outcome::Eof) => {
                debug!("Reached end of '{}'", demuxer.url());
                sender.close(QueueEnd::Eof);
                break;
            }
            Err(e) => {
                debug!("Reading '{}' failed: {}", demuxer.url(), e);
                sender.close(QueueEnd::Failed(e));
                break;
            }
        };

        let sent = if live {
            send_with_retry(&sender, packet)
        } else {
            sender.send(packet).map_err(closed_end)
        };
        if let Err(end) = sent {
            if end != QueueEnd::Eof {
                error!("Unable to send packet from '{}' to the main thread", demuxer.url());
            }
            sender.close(end);
            break;
        }
    }
    demuxer
}

fn send_with_retry(sender: &QueueSender, mut packet: Packet) -> std::result::Result<(), QueueEnd> {
    loop {
        match sender.try_send(packet) {
            Ok(()) => return Ok(()),
            Err(SendError::Full(p)) => {
                packet = p;
                thread::sleep(RETRY_DELAY);
            }
            Err(SendError::Closed(end)) => return Err(end),
        }
    }
}

fn closed_end(err: SendError) -> QueueEnd {
    match err {
        SendError::Closed(end) => end,
        SendError::Full(_) => QueueEnd::Eof,
    }
}

#[cfg(test)]
mod input_tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryInput, ReadEvent};
    use crate::error::BackendError;
    use crate::rational::Rational;
    use std::time::Instant;

    fn stream() -> StreamInfo {
        StreamInfo::video(0, "h264", Rational::new(1, 25), 64, 48)
    }

    fn open(url: &str, input: MemoryInput, capacity: usize) -> InputFile {
        let backend = MemoryBackend::new().with_input(input);
        InputFile::open(0, &backend, url, &Options::new(), capacity).unwrap()
    }

    /// Reads until end of file or an error, collecting packet timestamps.
    fn read_all(file: &mut InputFile) -> Result<Vec<i64>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut pts = Vec::new();
        while Instant::now() < deadline {
            match file.read_packet()? {
                Outcome::Ready(packet) => pts.push(packet.pts),
                Outcome::Again => thread::sleep(Duration::from_millis(1)),
                Outcome::Eof => return Ok(pts),
            }
        }
        panic!("input never reached end of file");
    }

    #[test]
    fn packets_arrive_in_order_then_eof() {
        let mut file = open("a.mkv", MemoryInput::new("a.mkv").stream(stream()).constant_rate(0, 20, 1), 8);
        assert!(!file.is_running());
        file.start().unwrap();
        assert!(file.is_running());
        assert_eq!(read_all(&mut file).unwrap(), (0..20).collect::<Vec<_>>());
        assert!(file.is_eof());
        assert!(file.read_packet().unwrap().is_eof());
        file.close().unwrap();
    }

    #[test]
    fn read_failure_reaches_the_consumer() {
        let input = MemoryInput::new("broken.mkv")
            .stream(stream())
            .packet(0, 0, 0, 1)
            .event(ReadEvent::Fail(BackendError::new(-5, "Input/output error")));
        let mut file = open("broken.mkv", input, 8);
        file.start().unwrap();
        let err = read_all(&mut file).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("broken.mkv"), "{}", text);
        assert!(text.contains("Input/output error"), "{}", text);
    }

    #[test]
    fn live_input_survives_would_block() {
        let input = MemoryInput::new("live.ts")
            .stream(stream())
            .live()
            .packet(0, 0, 0, 1)
            .event(ReadEvent::WouldBlock)
            .event(ReadEvent::WouldBlock)
            .packet(0, 1, 1, 1)
            .packet(0, 2, 2, 1);
        let mut file = open("live.ts", input, 1);
        assert!(file.is_live());
        file.start().unwrap();
        assert_eq!(read_all(&mut file).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn close_stops_a_blocked_reader_and_is_idempotent() {
        let mut file = open("long.mkv", MemoryInput::new("long.mkv").stream(stream()).constant_rate(0, 500, 1), 2);
        file.start().unwrap();
        file.close().unwrap();
        assert!(!file.is_running());
        file.close().unwrap();
    }

    #[test]
    fn close_before_start_releases_the_demuxer() {
        let mut file = open("idle.mkv", MemoryInput::new("idle.mkv").stream(stream()), 8);
        file.close().unwrap();
        file.start().unwrap();
        assert!(!file.is_running());
    }

    #[test]
    fn missing_input_names_the_url() {
        let backend = MemoryBackend::new();
        let err = InputFile::open(0, &backend, "nope.mkv", &Options::new(), 8)
            .err()
            .unwrap();
        assert!(err.to_string().contains("nope.mkv"));
    }
}
