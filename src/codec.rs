//! Send/receive state machine shared by the decode and encode bridges.
//!
//! A codec alternates between accepting input and producing output. The pump
//! always drains output after a send attempt, retries a send that was refused
//! while output was pending, and treats a refusal that freed nothing as a stall.

use crate::backend::{BackendResult, Decoder, Encoder, Outcome};
use crate::error::{PipelineError, Result};
use crate::media::{Frame, Packet};
use log::trace;

/// One side of a two-phase codec.
pub trait Exchange {
    type Input;
    type Output;

    fn send(&mut self, input: Option<&mut Self::Input>) -> BackendResult<Outcome<()>>;
    fn receive(&mut self) -> BackendResult<Outcome<Self::Output>>;
}

/// Decoder viewed as a packet-in, frame-out exchange.
pub struct Decoding<'a>(pub &'a mut dyn Decoder);

impl Exchange for Decoding<'_> {
    type Input = Packet;
    type Output = Frame;

    fn send(&mut self, input: Option<&mut Packet>) -> BackendResult<Outcome<()>> {
        self.0.send_packet(input)
    }

    fn receive(&mut self) -> BackendResult<Outcome<Frame>> {
        self.0.receive_frame()
    }
}

/// Encoder viewed as a frame-in, packet-out exchange.
pub struct Encoding<'a>(pub &'a mut dyn Encoder);

impl Exchange for Encoding<'_> {
    type Input = Frame;
    type Output = Packet;

    fn send(&mut self, input: Option<&mut Frame>) -> BackendResult<Outcome<()>> {
        self.0.send_frame(input)
    }

    fn receive(&mut self) -> BackendResult<Outcome<Packet>> {
        self.0.receive_packet()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpState {
    NeedInput,
    HasOutput,
    Eof,
}

#[derive(Debug)]
pub struct Pump {
    label: String,
    state: PumpState,
    flushing: bool,
}

impl Pump {
    /// `label` names the codec in error messages, e.g. `decoder for stream #0:0`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: PumpState::NeedInput,
            flushing: false,
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Feeds one input, handing every output produced along the way to `emit`.
    /// Returns the number of outputs emitted.
    pub fn push<E: Exchange>(
        &mut self,
        codec: &mut E,
        mut input: E::Input,
        mut emit: impl FnMut(E::Output) -> Result<()>,
    ) -> Result<usize> {
        if self.flushing || self.state == PumpState::Eof {
            return Err(PipelineError::AlreadyFlushed(self.label.clone()));
        }
        let mut produced = 0;
        loop {
            let sent = codec
                .send(Some(&mut input))
                .map_err(|e| PipelineError::backend(format!("{}: send", self.label), e))?;
            match sent {
                Outcome::Ready(()) => {
                    produced += self.drain(codec, &mut emit)?;
                    return Ok(produced);
                }
                Outcome::Again => {
                    self.state = PumpState::HasOutput;
                    let drained = self.drain(codec, &mut emit)?;
                    if drained == 0 {
                        return Err(PipelineError::Stalled(self.label.clone()));
                    }
                    trace!("{}: input refused, drained {} before retry", self.label, drained);
                    produced += drained;
                }
                Outcome::Eof => return Err(PipelineError::AlreadyFlushed(self.label.clone())),
            }
        }
    }

    /// Signals end of input and drains until the codec reports it is exhausted.
    pub fn flush<E: Exchange>(
        &mut self,
        codec: &mut E,
        mut emit: impl FnMut(E::Output) -> Result<()>,
    ) -> Result<usize> {
        if self.state == PumpState::Eof {
            return Ok(0);
        }
        let mut produced = 0;
        if !self.flushing {
            loop {
                let sent = codec
                    .send(None)
                    .map_err(|e| PipelineError::backend(format!("{}: flush", self.label), e))?;
                match sent {
                    Outcome::Ready(()) | Outcome::Eof => break,
                    Outcome::Again => {
                        let drained = self.drain(codec, &mut emit)?;
                        if drained == 0 {
                            return Err(PipelineError::Stalled(self.label.clone()));
                        }
                        produced += drained;
                    }
                }
            }
            self.flushing = true;
        }
        produced += self.drain(codec, &mut emit)?;
        if self.state != PumpState::Eof {
            return Err(PipelineError::FlushIncomplete(self.label.clone()));
        }
        Ok(produced)
    }

    /// Receives until the codec needs input or is exhausted.
    pub fn drain<E: Exchange>(
        &mut self,
        codec: &mut E,
        mut emit: impl FnMut(E::Output) -> Result<()>,
    ) -> Result<usize> {
        let mut produced = 0;
        loop {
            let received = codec
                .receive()
                .map_err(|e| PipelineError::backend(format!("{}: receive", self.label), e))?;
            match received {
                Outcome::Ready(output) => {
                    self.state = PumpState::HasOutput;
                    produced += 1;
                    emit(output)?;
                }
                Outcome::Again => {
                    self.state = PumpState::NeedInput;
                    return Ok(produced);
                }
                Outcome::Eof => {
                    self.state = PumpState::Eof;
                    return Ok(produced);
                }
            }
        }
    }
}

#[cfg(test)]
mod pump_tests {
    use super::*;
    use crate::error::BackendError;
    use std::collections::VecDeque;

    /// Holds up to `capacity` items and releases them in order.
    struct FakeCodec {
        capacity: usize,
        pending: VecDeque<u32>,
        draining: bool,
        sends: usize,
        stuck: bool,
        never_ends: bool,
    }

    impl FakeCodec {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                pending: VecDeque::new(),
                draining: false,
                sends: 0,
                stuck: false,
                never_ends: false,
            }
        }
    }

    impl Exchange for FakeCodec {
        type Input = u32;
        type Output = u32;

        fn send(&mut self, input: Option<&mut u32>) -> BackendResult<Outcome<()>> {
            self.sends += 1;
            if self.stuck {
                return Ok(Outcome::Again);
            }
            match input {
                None if self.draining => Ok(Outcome::Eof),
                None => {
                    self.draining = true;
                    Ok(Outcome::Ready(()))
                }
                Some(_) if self.draining => Ok(Outcome::Eof),
                Some(_) if self.pending.len() >= self.capacity => Ok(Outcome::Again),
                Some(value) => {
                    self.pending.push_back(*value);
                    Ok(Outcome::Ready(()))
                }
            }
        }

        fn receive(&mut self) -> BackendResult<Outcome<u32>> {
            if self.stuck {
                return Ok(Outcome::Again);
            }
            if self.draining {
                return Ok(match self.pending.pop_front() {
                    Some(v) => Outcome::Ready(v),
                    None if self.never_ends => Outcome::Again,
                    None => Outcome::Eof,
                });
            }
            // Keep one item buffered to model codec delay.
            if self.pending.len() > 1 {
                Ok(Outcome::Ready(self.pending.pop_front().unwrap_or_default()))
            } else {
                Ok(Outcome::Again)
            }
        }
    }

    #[test]
    fn push_then_flush_emits_everything_in_order() {
        let mut codec = FakeCodec::new(2);
        let mut pump = Pump::new("fake");
        let mut out = Vec::new();
        for i in 0..5 {
            pump.push(&mut codec, i, |v| {
                out.push(v);
                Ok(())
            })
            .unwrap();
            assert_eq!(pump.state(), PumpState::NeedInput);
        }
        let flushed = pump
            .flush(&mut codec, |v| {
                out.push(v);
                Ok(())
            })
            .unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert_eq!(pump.state(), PumpState::Eof);
        assert!(pump.flush(&mut codec, |_| Ok(())).unwrap() == 0);
    }

    #[test]
    fn refused_send_with_nothing_to_drain_is_a_stall() {
        let mut codec = FakeCodec::new(1);
        codec.stuck = true;
        let mut pump = Pump::new("stuck codec");
        let err = pump.push(&mut codec, 1, |_| Ok(())).unwrap_err();
        assert!(matches!(err, PipelineError::Stalled(label) if label == "stuck codec"));
    }

    #[test]
    fn input_after_flush_is_rejected() {
        let mut codec = FakeCodec::new(1);
        let mut pump = Pump::new("fake");
        pump.flush(&mut codec, |_| Ok(())).unwrap();
        assert!(matches!(
            pump.push(&mut codec, 3, |_| Ok(())),
            Err(PipelineError::AlreadyFlushed(_))
        ));
    }

    #[test]
    fn flush_without_end_of_stream_is_fatal() {
        let mut codec = FakeCodec::new(1);
        codec.never_ends = true;
        let mut pump = Pump::new("fake");
        assert!(matches!(
            pump.flush(&mut codec, |_| Ok(())),
            Err(PipelineError::FlushIncomplete(_))
        ));
    }

    #[test]
    fn backend_errors_carry_the_label() {
        struct Broken;
        impl Exchange for Broken {
            type Input = u32;
            type Output = u32;
            fn send(&mut self, _: Option<&mut u32>) -> BackendResult<Outcome<()>> {
                Err(BackendError::new(-22, "Invalid argument"))
            }
            fn receive(&mut self) -> BackendResult<Outcome<u32>> {
                Ok(Outcome::Again)
            }
        }
        let mut pump = Pump::new("decoder for stream #0:0");
        let err = pump.push(&mut Broken, 1, |_| Ok(())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "decoder for stream #0:0: send: Invalid argument (code -22)"
        );
    }
}
