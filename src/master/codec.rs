use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;
use log::*;

use crate::{
    command::{START_BYTE, LEADIN_BYTE},
    packet::Packet,
    };


/// reason a frame was dropped by the [PacketCodec]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("inter-byte gap exceeded before the frame completed")]
    Timeout,
    #[error("frame checksum mismatch (computed {computed:#04x}, received {received:#04x})")]
    ChecksumMismatch {computed: u8, received: u8},
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Step {
    Start,
    Leadin,
    Destination,
    Source,
    Command,
    Length,
    Data,
    Checksum,
}

/**
    assemble packets from the raw bytes received on the bus

    once a frame header started, every received byte must follow the previous one within the frame timeout,
    otherwise the partial frame is dropped. Time is given by the caller so the codec can be driven by any timer.
*/
pub struct PacketCodec {
    step: Step,
    packet: Packet,
    remaining: u8,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl PacketCodec {
    pub fn new(timeout: Duration) -> Self {
        Self {
            step: Step::Start,
            packet: Packet::new(0, 0),
            remaining: 0,
            timeout,
            deadline: None,
        }
    }

    /// drop any partial frame and wait for a new start byte
    pub fn reset(&mut self) {
        self.step = Step::Start;
        self.deadline = None;
    }
    /// true when no frame is being assembled
    pub fn is_idle(&self) -> bool {
        self.step == Step::Start
    }
    /// instant at which the partial frame will be dropped, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
    /// drop the partial frame if its deadline has passed
    pub fn expire(&mut self, now: Instant) -> Option<FrameError> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                debug!("frame timeout in step {:?}", self.step);
                self.reset();
                Some(FrameError::Timeout)
            },
            _ => None,
        }
    }

    /// process one received byte, using the current time
    pub fn feed(&mut self, byte: u8) -> Result<Option<Packet>, FrameError> {
        self.feed_at(byte, Instant::now())
    }
    /**
        process one byte received at the given instant

        returns a packet when this byte completes a valid frame, an error when a frame was dropped
        (the byte itself is then processed as the possible start of a new frame)
    */
    pub fn feed_at(&mut self, byte: u8, now: Instant) -> Result<Option<Packet>, FrameError> {
        if let Some(error) = self.expire(now) {
            self.step(byte, now)?;
            return Err(error);
        }
        self.step(byte, now)
    }
    /// process a buffer of received bytes, reporting every packet and error in order
    pub fn feed_buffer(&mut self, bytes: &[u8], now: Instant, mut report: impl FnMut(Result<Packet, FrameError>)) {
        for &byte in bytes {
            match self.feed_at(byte, now) {
                Ok(Some(packet)) => report(Ok(packet)),
                Ok(None) => {},
                Err(error) => report(Err(error)),
            }
        }
    }

    fn step(&mut self, byte: u8, now: Instant) -> Result<Option<Packet>, FrameError> {
        match self.step {
            Step::Start => {
                if byte == START_BYTE
                    {self.step = Step::Leadin}
            },
            Step::Leadin => {
                self.step = if byte == LEADIN_BYTE {Step::Destination} else {Step::Start};
            },
            Step::Destination => {
                self.packet = Packet::new(byte, 0);
                self.step = Step::Source;
            },
            Step::Source => {
                self.packet.source = byte;
                self.step = Step::Command;
            },
            Step::Command => {
                self.packet.command = byte;
                self.step = Step::Length;
            },
            Step::Length => {
                self.remaining = byte;
                self.step = if byte == 0 {Step::Checksum} else {Step::Data};
            },
            Step::Data => {
                // length is at most 255 so the data buffer cannot overflow
                let _ = self.packet.data.push(byte);
                self.remaining -= 1;
                if self.remaining == 0
                    {self.step = Step::Checksum}
            },
            Step::Checksum => {
                self.reset();
                let packet = core::mem::replace(&mut self.packet, Packet::new(0, 0));
                let computed = packet.checksum();
                if computed != byte {
                    return Err(FrameError::ChecksumMismatch {computed, received: byte});
                }
                trace!("received {:?}", packet);
                return Ok(Some(packet));
            },
        }
        // the deadline only runs once the header started
        if matches!(self.step, Step::Start | Step::Leadin | Step::Destination)
            {self.deadline = None}
        else
            {self.deadline = Some(now + self.timeout)}
        Ok(None)
    }
}
