//! Bounded packet channel between an input reader thread and the orchestrator.
//!
//! Besides the packets themselves the queue carries two out-of-band terminal
//! signals. The send-side signal makes every further send fail immediately; the
//! receive-side signal is reported to the receiver once the packets already queued
//! have been drained, and from then on every receive reports it again.

use crate::error::BackendError;
use crate::media::Packet;
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 8;

/// Granularity at which blocking operations re-check the terminal signals.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Terminal signal of one side of the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEnd {
    Eof,
    Failed(BackendError),
}

#[derive(Debug)]
pub enum SendError {
    /// Non-blocking send on a full queue; the packet is handed back.
    Full(Packet),
    Closed(QueueEnd),
}

#[derive(Debug)]
pub enum Received {
    Packet(Packet),
    /// Nothing arrived within the allowed wait.
    Empty,
    Closed(QueueEnd),
}

/// How long a receive may wait for a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvMode {
    NonBlocking,
    Wait(Duration),
}

#[derive(Debug, Default)]
struct Signals {
    send_end: Option<QueueEnd>,
    recv_end: Option<QueueEnd>,
    delivered: bool,
}

#[derive(Debug, Default)]
struct Shared {
    signals: Mutex<Signals>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_end(&self) -> Option<QueueEnd> {
        self.lock().send_end.clone()
    }
}

/// Creates a queue holding at most `capacity` packets.
pub fn packet_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        QueueSender {
            tx,
            shared: Arc::clone(&shared),
        },
        QueueReceiver { rx, shared },
    )
}

/// Producer half, owned by the reader thread.
#[derive(Debug)]
pub struct QueueSender {
    tx: Sender<Packet>,
    shared: Arc<Shared>,
}

impl QueueSender {
    /// Waits for space, failing as soon as the send side has been closed.
    pub fn send(&self, mut packet: Packet) -> Result<(), SendError> {
        loop {
            if let Some(end) = self.shared.send_end() {
                return Err(SendError::Closed(end));
            }
            match self.tx.send_timeout(packet, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(p)) => packet = p,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(SendError::Closed(QueueEnd::Eof))
                }
            }
        }
    }

    pub fn try_send(&self, packet: Packet) -> Result<(), SendError> {
        if let Some(end) = self.shared.send_end() {
            return Err(SendError::Closed(end));
        }
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(p)) => Err(SendError::Full(p)),
            Err(TrySendError::Disconnected(_)) => Err(SendError::Closed(QueueEnd::Eof)),
        }
    }

    /// Sets the terminal signal the receiver will see after draining. The first signal wins.
    pub fn close(&self, end: QueueEnd) {
        let mut signals = self.shared.lock();
        if signals.recv_end.is_none() {
            signals.recv_end = Some(end);
        }
    }

    /// True once the receiving side has asked the producer to stop.
    pub fn is_closed(&self) -> bool {
        self.shared.send_end().is_some()
    }
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        self.close(QueueEnd::Eof);
    }
}

/// Consumer half, owned by the orchestrator.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: Receiver<Packet>,
    shared: Arc<Shared>,
}

impl QueueReceiver {
    pub fn recv(&self, mode: RecvMode) -> Received {
        {
            let signals = self.shared.lock();
            if signals.delivered {
                if let Some(end) = &signals.recv_end {
                    return Received::Closed(end.clone());
                }
            }
        }

        match self.rx.try_recv() {
            Ok(packet) => return Received::Packet(packet),
            Err(TryRecvError::Disconnected) => return self.deliver_end(),
            Err(TryRecvError::Empty) => {}
        }
        if self.shared.lock().recv_end.is_some() {
            return self.last_or_end();
        }

        let RecvMode::Wait(timeout) = mode else {
            return Received::Empty;
        };
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Received::Packet(packet),
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.lock().recv_end.is_some() {
                    self.last_or_end()
                } else {
                    Received::Empty
                }
            }
            Err(RecvTimeoutError::Disconnected) => self.deliver_end(),
        }
    }

    /// The producer queues before it signals, so a packet may still be in flight here.
    fn last_or_end(&self) -> Received {
        match self.rx.try_recv() {
            Ok(packet) => Received::Packet(packet),
            Err(_) => self.deliver_end(),
        }
    }

    fn deliver_end(&self) -> Received {
        let mut signals = self.shared.lock();
        let end = signals.recv_end.get_or_insert(QueueEnd::Eof).clone();
        signals.delivered = true;
        Received::Closed(end)
    }

    /// Makes every pending and future send on the producer side fail with `end`.
    pub fn close(&self, end: QueueEnd) {
        let mut signals = self.shared.lock();
        if signals.send_end.is_none() {
            signals.send_end = Some(end);
        }
    }

    /// Discards everything currently queued, returning how many packets were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod queue_tests {
    use super::*;
    use std::thread;

    fn pkt(n: i64) -> Packet {
        Packet::new(0, n, n, 1, 10)
    }

    #[test]
    fn packets_are_delivered_before_terminal_signal() {
        let (tx, rx) = packet_queue(4);
        tx.try_send(pkt(1)).unwrap();
        tx.try_send(pkt(2)).unwrap();
        tx.close(QueueEnd::Eof);

        assert!(matches!(rx.recv(RecvMode::NonBlocking), Received::Packet(p) if p.pts == 1));
        assert!(matches!(rx.recv(RecvMode::NonBlocking), Received::Packet(p) if p.pts == 2));
        assert!(matches!(rx.recv(RecvMode::NonBlocking), Received::Closed(QueueEnd::Eof)));
    }

    #[test]
    fn terminal_signal_is_repeated_and_first_wins() {
        let (tx, rx) = packet_queue(2);
        let failure = BackendError::new(-5, "I/O error");
        tx.close(QueueEnd::Failed(failure.clone()));
        tx.close(QueueEnd::Eof);
        for _ in 0..3 {
            match rx.recv(RecvMode::Wait(Duration::from_millis(1))) {
                Received::Closed(QueueEnd::Failed(err)) => assert_eq!(err, failure),
                other => panic!("unexpected {:?}", other),
            }
        }
        drop(tx);
        assert!(matches!(rx.recv(RecvMode::NonBlocking), Received::Closed(QueueEnd::Failed(_))));
    }

    #[test]
    fn full_queue_hands_packet_back() {
        let (tx, rx) = packet_queue(1);
        tx.try_send(pkt(1)).unwrap();
        match tx.try_send(pkt(2)) {
            Err(SendError::Full(p)) => assert_eq!(p.pts, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.len(), 1);
        assert!(matches!(rx.recv(RecvMode::NonBlocking), Received::Packet(_)));
        assert!(matches!(rx.recv(RecvMode::NonBlocking), Received::Empty));
    }

    #[test]
    fn closing_send_side_unblocks_a_waiting_producer() {
        let (tx, rx) = packet_queue(1);
        tx.try_send(pkt(0)).unwrap();
        let producer = thread::spawn(move || tx.send(pkt(1)));
        thread::sleep(Duration::from_millis(30));
        rx.close(QueueEnd::Eof);
        let result = producer.join().unwrap();
        assert!(matches!(result, Err(SendError::Closed(QueueEnd::Eof))));
        assert_eq!(rx.drain(), 1);
        assert!(rx.is_empty());
    }

    #[test]
    fn dropped_sender_reads_as_end_of_stream() {
        let (tx, rx) = packet_queue(2);
        drop(tx);
        assert!(matches!(rx.recv(RecvMode::Wait(Duration::from_millis(5))), Received::Closed(QueueEnd::Eof)));
    }
}
