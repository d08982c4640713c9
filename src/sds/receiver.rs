// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.


use std::marker::PhantomData;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{DumpHeader, Handshake, PacketError, Sample, SdsQuirks, check_packet, decode_words, dump_request};
use crate::error::{Error, Rejection, Result};
use crate::job::JobControl;
use crate::session::SessionIo;

// ============================================================================
// States
// ============================================================================

pub struct RequestDump;
pub struct WaitHeader;
pub struct ReceivePacket;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<'a, State> {
    state: PhantomData<State>,
    io: &'a mut SessionIo,
    job: &'a JobControl,
    channel: u8,
    sample: u16,
    quirks: SdsQuirks,
    header: Option<DumpHeader>,
    data: Vec<i16>,
    packet: usize,
    packets: usize,
    retries: u32,
    // Set by the first receive of a wait, cleared once the wait is over
    deadline: Option<Instant>,
}

pub enum Step<'a> {
    Next(Box<dyn ReceiverState<'a> + 'a>),
    Done(Sample),
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState<'a> {
    fn step(self: Box<Self>) -> Result<Step<'a>>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<'a, S> ReceiverFsm<'a, S> {
    fn transition<T>(self) -> Box<ReceiverFsm<'a, T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            io: self.io,
            job: self.job,
            channel: self.channel,
            sample: self.sample,
            quirks: self.quirks,
            header: self.header,
            data: self.data,
            packet: self.packet,
            packets: self.packets,
            retries: self.retries,
            deadline: None,
        })
    }

    /// Receives within the current wait. Messages the caller ignores do not
    /// extend it.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + timeout);
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(None);
        }
        self.io.receive(left, false, self.job)
    }

    fn handshake(&mut self, kind: Handshake) -> Result<()> {
        let number = (self.packet % 128) as u8;
        self.io.send(&kind.encode(self.channel, number))
    }

    /// Tells the device to stop before giving up locally, so it does not
    /// sit waiting for handshakes that will never come.
    fn abort(mut self, error: Error) -> Error {
        if let Err(e) = self.handshake(Handshake::Cancel) {
            warn!("Could not send CANCEL: {}", e);
        }
        error
    }

    fn finish(self) -> Step<'a> {
        let header = self.header.unwrap_or_else(|| DumpHeader {
            channel: self.channel,
            sample: self.sample,
            bits: 16,
            period_ns: 0,
            words: 0,
            loop_start: 0,
            loop_end: 0,
            loop_type: super::LOOP_OFF,
        });
        self.job.set_progress(1.0);
        info!("Received sample {} ({} words)", self.sample, self.data.len());
        Step::Done(Sample {
            bits: header.bits,
            period_ns: header.period_ns,
            loop_start: header.loop_start,
            loop_end: header.loop_end,
            loop_type: header.loop_type,
            data: self.data,
        })
    }

    fn retry(mut self, error: Error) -> Result<Step<'a>>
    where
        ReceiverFsm<'a, S>: ReceiverState<'a> + 'a,
    {
        self.retries += 1;
        if self.retries > self.io.config().sds_retries {
            warn!("Packet {} failed {} times, giving up", self.packet, self.retries);
            return Err(self.abort(error));
        }
        warn!("Requesting packet {} again ({})", self.packet, error);
        self.deadline = None;
        self.handshake(Handshake::Nak)?;
        Ok(Step::Next(Box::new(self)))
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, RequestDump> {
    fn step(self: Box<Self>) -> Result<Step<'a>> {
        let mut fsm = *self;
        if !fsm.job.is_active() {
            return Err(Error::Cancelled);
        }

        fsm.io.send(&dump_request(fsm.channel, fsm.sample))?;
        debug!("Requested sample {}", fsm.sample);
        Ok(Step::Next(fsm.transition::<WaitHeader>()))
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, WaitHeader> {
    fn step(self: Box<Self>) -> Result<Step<'a>> {
        let mut fsm = *self;
        let timeout = fsm.io.config().timeout;

        let msg = match fsm.receive(timeout) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Err(Error::Timeout),
            Err(Error::Cancelled) => return Err(fsm.abort(Error::Cancelled)),
            Err(e) => return Err(e),
        };

        if let Some((Handshake::Cancel, _)) = Handshake::parse(&msg, fsm.channel) {
            return Err(Error::Rejected(Rejection::Cancelled));
        }

        let Some(header) = DumpHeader::parse(&msg).filter(|h| h.channel == fsm.channel) else {
            debug!("Waiting for dump header, ignoring message");
            return Ok(Step::Next(Box::new(fsm)));
        };

        fsm.packets = match header.packets() {
            Ok(packets) => packets,
            Err(e) => return Err(fsm.abort(Error::desync(e.to_string()))),
        };
        info!(
            "Dump header: {} bits, {} words, {} packets",
            header.bits, header.words, fsm.packets
        );
        fsm.data = Vec::with_capacity(header.words as usize);
        fsm.header = Some(header);
        fsm.packet = 0;
        fsm.retries = 0;
        fsm.job.set_parts(u32::try_from(fsm.packets).unwrap_or(u32::MAX));
        fsm.job.set_progress(0.0);

        fsm.handshake(Handshake::Ack)?;

        if fsm.packets == 0 {
            return Ok(fsm.finish());
        }
        Ok(Step::Next(fsm.transition::<ReceivePacket>()))
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, ReceivePacket> {
    fn step(self: Box<Self>) -> Result<Step<'a>> {
        let mut fsm = *self;
        if !fsm.job.is_active() {
            return Err(fsm.abort(Error::Cancelled));
        }

        let Some(header) = fsm.header.clone() else {
            return Err(fsm.abort(Error::desync("No dump header")));
        };
        let timeout = fsm.io.config().sds_packet_timeout;

        let msg = match fsm.receive(timeout) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                let last = fsm.packet + 1 == fsm.packets;
                if fsm.quirks.tolerate_missing_single_word_packet && header.words == 1 && last {
                    warn!("Device skipped the packet of a one-word sample, assuming silence");
                    fsm.data.push(0);
                    return Ok(fsm.finish());
                }
                return fsm.retry(Error::Timeout);
            }
            Err(Error::Cancelled) => return Err(fsm.abort(Error::Cancelled)),
            Err(e) => return Err(e),
        };

        if let Some((Handshake::Cancel, _)) = Handshake::parse(&msg, fsm.channel) {
            info!("Device cancelled the dump");
            return Err(Error::Rejected(Rejection::Cancelled));
        }

        let expected = (fsm.packet % 128) as u8;
        match check_packet(&msg, fsm.channel) {
            Ok((number, payload)) if number == expected => {
                let remaining = header.words as usize - fsm.data.len();
                let per_packet = super::words_per_packet(header.bits)?;
                let words = decode_words(payload, header.bits, remaining.min(per_packet))?;
                fsm.data.extend(words);
                fsm.retries = 0;
                fsm.deadline = None;

                fsm.handshake(Handshake::Ack)?;
                fsm.packet += 1;
                fsm.job.set_progress(1.0);
                fsm.job.next_part();

                if fsm.packet == fsm.packets {
                    return Ok(fsm.finish());
                }
                Ok(Step::Next(Box::new(fsm)))
            }
            Ok((number, _)) => {
                let error = Error::desync(format!("Expected packet {}, got {}", expected, number));
                fsm.retry(error)
            }
            Err(PacketError::Checksum) => {
                fsm.retry(Error::desync(format!("Bad checksum in packet {}", expected)))
            }
            Err(PacketError::NotAPacket) => {
                debug!("Ignoring message while waiting for packet {}", expected);
                Ok(Step::Next(Box::new(fsm)))
            }
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> ReceiverFsm<'a, RequestDump> {
    pub fn new(
        io: &'a mut SessionIo,
        job: &'a JobControl,
        channel: u8,
        sample: u16,
        quirks: SdsQuirks,
    ) -> Box<dyn ReceiverState<'a> + 'a> {
        Box::new(ReceiverFsm {
            state: PhantomData::<RequestDump>,
            io,
            job,
            channel,
            sample,
            quirks,
            header: None,
            data: Vec::new(),
            packet: 0,
            packets: 0,
            retries: 0,
            deadline: None,
        })
    }
}

/// Fetches sample `sample` from the device on `channel`.
///
/// Partial data is never returned: cancellation, a CANCEL from the device
/// or running out of retries all end in an error.
pub fn download(
    io: &mut SessionIo,
    job: &JobControl,
    channel: u8,
    sample: u16,
    quirks: SdsQuirks,
) -> Result<Sample> {
    let mut state = ReceiverFsm::new(io, job, channel, sample, quirks);
    loop {
        match state.step()? {
            Step::Next(next) => state = next,
            Step::Done(sample) => return Ok(sample),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
