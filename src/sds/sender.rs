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

use super::{DumpHeader, Handshake, Sample, SdsQuirks, encode_packet, encode_words};
use crate::error::{Error, Rejection, Result};
use crate::job::JobControl;
use crate::protocol::SDS_PACKET_PAYLOAD;
use crate::session::SessionIo;

// ============================================================================
// States
// ============================================================================

pub struct SendHeader;
pub struct WaitHeaderReply;
pub struct SendPacket;
pub struct WaitPacketReply;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<'a, State> {
    state: PhantomData<State>,
    io: &'a mut SessionIo,
    job: &'a JobControl,
    quirks: SdsQuirks,
    header: DumpHeader,
    payload: Vec<u8>,
    packet: usize,
    packets: usize,
    retries: u32,
    waiting: bool,
    // The device answered the header at least once
    handshook: bool,
    open_loop: bool,
    deadline: Option<Instant>,
}

pub enum Step<'a> {
    Next(Box<dyn SenderState<'a> + 'a>),
    Done,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState<'a> {
    fn step(self: Box<Self>) -> Result<Step<'a>>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<'a, S> SenderFsm<'a, S> {
    fn transition<T>(self) -> Box<SenderFsm<'a, T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            io: self.io,
            job: self.job,
            quirks: self.quirks,
            header: self.header,
            payload: self.payload,
            packet: self.packet,
            packets: self.packets,
            retries: self.retries,
            waiting: self.waiting,
            handshook: self.handshook,
            open_loop: self.open_loop,
            deadline: None,
        })
    }

    /// Receives within the current wait. Ignored messages do not extend it.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + timeout);
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(None);
        }
        self.io.receive(left, false, self.job)
    }

    /// The first WAIT gives the device `sds_wait_timeout` to answer. Later
    /// ones do not push that further out.
    fn wait(&mut self) {
        if !self.waiting {
            debug!("Device asked to wait");
            self.waiting = true;
            self.deadline = Some(Instant::now() + self.io.config().sds_wait_timeout);
        } else {
            debug!("Device asked to wait again");
        }
    }

    fn number(&self) -> u8 {
        (self.packet % 128) as u8
    }

    fn abort(self, error: Error) -> Error {
        let cancel = Handshake::Cancel.encode(self.header.channel, self.number());
        if let Err(e) = self.io.send(&cancel) {
            warn!("Could not send CANCEL: {}", e);
        }
        error
    }

    fn parts(&self) -> u32 {
        u32::try_from(self.packets).unwrap_or(u32::MAX)
    }

    fn count_retry(&mut self) -> bool {
        self.retries += 1;
        self.retries <= self.io.config().sds_retries
    }

    /// Moves past an acknowledged (or open-loop) packet.
    fn advance(mut self) -> Step<'a> {
        self.packet += 1;
        self.retries = 0;
        self.waiting = false;
        self.job.set_progress(1.0);
        self.job.next_part();

        if self.packet == self.packets {
            info!("Sent sample {} ({} packets)", self.header.sample, self.packets);
            return Step::Done;
        }
        Step::Next(self.transition::<SendPacket>())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> SenderState<'a> for SenderFsm<'a, SendHeader> {
    fn step(self: Box<Self>) -> Result<Step<'a>> {
        let fsm = *self;
        if !fsm.job.is_active() {
            return Err(Error::Cancelled);
        }

        fsm.io.send(&fsm.header.encode())?;
        debug!("Sent dump header for sample {}", fsm.header.sample);
        Ok(Step::Next(fsm.transition::<WaitHeaderReply>()))
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, WaitHeaderReply> {
    fn step(self: Box<Self>) -> Result<Step<'a>> {
        let mut fsm = *self;
        let timeout = fsm.io.config().sds_header_timeout;

        let msg = match fsm.receive(timeout) {
            Ok(Some(msg)) => msg,
            Ok(None) if fsm.waiting => {
                warn!("Device asked to wait but never answered");
                return Err(fsm.abort(Error::Timeout));
            }
            Ok(None) if fsm.handshook => {
                warn!("Device stopped answering the dump header");
                return Err(fsm.abort(Error::Timeout));
            }
            Ok(None) => {
                // No handshake at all: the device is listening open loop.
                warn!("No reply to dump header, sending without handshakes");
                fsm.open_loop = true;
                fsm.job.set_parts(fsm.parts());
                return Ok(Step::Next(fsm.transition::<SendPacket>()));
            }
            Err(Error::Cancelled) => return Err(fsm.abort(Error::Cancelled)),
            Err(e) => return Err(e),
        };

        match Handshake::parse(&msg, fsm.header.channel) {
            Some((Handshake::Ack, _)) => {
                debug!("Dump header acknowledged");
                fsm.waiting = false;
                fsm.handshook = true;
                fsm.retries = 0;
                fsm.job.set_parts(fsm.parts());
                Ok(Step::Next(fsm.transition::<SendPacket>()))
            }
            Some((Handshake::Nak, _)) => {
                fsm.handshook = true;
                fsm.waiting = false;
                if !fsm.count_retry() {
                    return Err(fsm.abort(Error::desync("Dump header refused")));
                }
                warn!("Dump header NAKed, sending it again");
                Ok(Step::Next(fsm.transition::<SendHeader>()))
            }
            Some((Handshake::Wait, _)) => {
                fsm.handshook = true;
                fsm.wait();
                Ok(Step::Next(Box::new(fsm)))
            }
            Some((Handshake::Cancel, _)) => {
                info!("Device cancelled the dump");
                Err(Error::Rejected(Rejection::Cancelled))
            }
            _ => {
                debug!("Ignoring message while waiting for header reply");
                Ok(Step::Next(Box::new(fsm)))
            }
        }
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, SendPacket> {
    fn step(self: Box<Self>) -> Result<Step<'a>> {
        let fsm = *self;
        if !fsm.job.is_active() {
            return Err(fsm.abort(Error::Cancelled));
        }

        let start = fsm.packet * SDS_PACKET_PAYLOAD;
        let end = (start + SDS_PACKET_PAYLOAD).min(fsm.payload.len());
        let msg = encode_packet(fsm.header.channel, fsm.number(), &fsm.payload[start..end]);
        fsm.io.send(&msg)?;

        if fsm.open_loop {
            let delay = fsm.io.config().sds_open_loop_delay;
            if !fsm.job.wait(delay) {
                return Err(fsm.abort(Error::Cancelled));
            }
            return Ok(fsm.advance());
        }

        Ok(Step::Next(fsm.transition::<WaitPacketReply>()))
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, WaitPacketReply> {
    fn step(self: Box<Self>) -> Result<Step<'a>> {
        let mut fsm = *self;
        let timeout = fsm.io.config().sds_packet_timeout;

        let msg = match fsm.receive(timeout) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                let last = fsm.packet + 1 == fsm.packets;
                if last && fsm.quirks.tolerate_missing_close_ack {
                    warn!("Device did not acknowledge the last packet, assuming success");
                    return Ok(fsm.advance());
                }
                if !fsm.count_retry() {
                    return Err(fsm.abort(Error::Timeout));
                }
                warn!("No reply to packet {}, sending it again", fsm.packet);
                fsm.waiting = false;
                return Ok(Step::Next(fsm.transition::<SendPacket>()));
            }
            Err(Error::Cancelled) => return Err(fsm.abort(Error::Cancelled)),
            Err(e) => return Err(e),
        };

        let expected = fsm.number();
        match Handshake::parse(&msg, fsm.header.channel) {
            Some((Handshake::Ack, number)) if number == expected => Ok(fsm.advance()),
            Some((Handshake::Nak, number)) if number == expected => {
                if !fsm.count_retry() {
                    let error = Error::desync(format!("Packet {} refused", fsm.packet));
                    return Err(fsm.abort(error));
                }
                warn!("Packet {} NAKed, sending it again", fsm.packet);
                fsm.waiting = false;
                Ok(Step::Next(fsm.transition::<SendPacket>()))
            }
            Some((Handshake::Wait, _)) => {
                fsm.wait();
                Ok(Step::Next(Box::new(fsm)))
            }
            Some((Handshake::Cancel, _)) => {
                info!("Device cancelled the dump");
                Err(Error::Rejected(Rejection::Cancelled))
            }
            _ => {
                debug!("Ignoring message while waiting for packet {} reply", expected);
                Ok(Step::Next(Box::new(fsm)))
            }
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> SenderFsm<'a, SendHeader> {
    pub fn new(
        io: &'a mut SessionIo,
        job: &'a JobControl,
        channel: u8,
        number: u16,
        sample: &Sample,
        quirks: SdsQuirks,
    ) -> Result<Box<dyn SenderState<'a> + 'a>> {
        if sample.data.is_empty() {
            return Err(Error::invalid("Cannot send an empty sample"));
        }
        if number > 0x3FFF {
            return Err(Error::invalid(format!("Sample number {} out of range", number)));
        }

        let header = DumpHeader::for_sample(channel, number, sample);
        header.check_fields()?;
        let packets = header.packets()?;
        let payload = encode_words(&sample.data, sample.bits)?;

        Ok(Box::new(SenderFsm {
            state: PhantomData::<SendHeader>,
            io,
            job,
            quirks,
            header,
            payload,
            packet: 0,
            packets,
            retries: 0,
            waiting: false,
            handshook: false,
            open_loop: false,
            deadline: None,
        }))
    }
}

/// Sends `sample` to slot `number` of the device on `channel`.
pub fn upload(
    io: &mut SessionIo,
    job: &JobControl,
    channel: u8,
    number: u16,
    sample: &Sample,
    quirks: SdsQuirks,
) -> Result<()> {
    let mut state = SenderFsm::new(io, job, channel, number, sample, quirks)?;
    loop {
        match state.step()? {
            Step::Next(next) => state = next,
            Step::Done => return Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::*;
    use crate::sds::MAX_FIELD;
    use crate::sds::sim::SdsDevice;
    use crate::serial::{MockHandle, MockPort};
    use crate::session::Session;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn session_with(device: SdsDevice) -> (Session, MockHandle, Arc<Mutex<SdsDevice>>) {
        let device = Arc::new(Mutex::new(device));
        let sim = Arc::clone(&device);
        let port = MockPort::responder(move |msg| sim.lock().respond(msg));
        let handle = port.handle();
        (Session::new(Box::new(port), Config::for_tests()), handle, device)
    }

    fn packets_sent(handle: &MockHandle) -> usize {
        handle
            .messages()
            .iter()
            .filter(|m| m.len() == SDS_PACKET_LEN && m[3] == SDS_DATA_PACKET)
            .count()
    }

    fn count(handle: &MockHandle, len: usize, kind: u8) -> usize {
        handle.messages().iter().filter(|m| m.len() == len && m[3] == kind).count()
    }

    fn sample(words: usize) -> Sample {
        Sample::new(44100, (0..words).map(|i| (i as i16).wrapping_mul(97)).collect())
    }

    #[test]
    fn test_upload_closed_loop() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Ack];
        let (session, handle, device) = session_with(device);
        let sample = sample(100);

        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        let job = JobControl::with_progress(move |f| sink.lock().push(f));

        upload(&mut session.lock(), &job, 0, 5, &sample, SdsQuirks::default())
            .expect("Upload should succeed");

        assert_eq!(packets_sent(&handle), 3);
        assert_eq!(device.lock().uploaded(), sample.data);
        assert_eq!(device.lock().received_header.as_ref().unwrap().sample, 5);
        assert_eq!(progress.lock().last().copied(), Some(1.0));
    }

    #[test]
    fn test_upload_resends_naked_packet() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Ack];
        device.nak_once.insert(1);
        let (session, handle, device) = session_with(device);
        let sample = sample(100);

        upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample, SdsQuirks::default())
            .expect("Upload should recover");

        assert_eq!(packets_sent(&handle), 4);
        assert_eq!(device.lock().uploaded(), sample.data);
    }

    #[test]
    fn test_upload_wait_then_ack() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Wait, Handshake::Ack];
        let (session, handle, device) = session_with(device);
        let sample = sample(10);

        upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample, SdsQuirks::default())
            .expect("Upload should succeed");

        let headers = handle.messages().iter().filter(|m| m.len() == SDS_HEADER_LEN).count();
        assert_eq!(headers, 1, "WAIT must not trigger a resend");
        assert_eq!(device.lock().uploaded(), sample.data);
    }

    #[test]
    fn test_upload_open_loop_fallback() {
        let mut device = SdsDevice::empty(0);
        device.silent = true;
        let (session, handle, device) = session_with(device);
        let sample = sample(200);

        upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample, SdsQuirks::default())
            .expect("Open loop upload should succeed");

        // Every packet goes out exactly once: no per-packet timeouts or resends.
        assert_eq!(packets_sent(&handle), 5);
        assert_eq!(device.lock().uploaded(), sample.data);
    }

    #[test]
    fn test_upload_device_cancel() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Cancel];
        let (session, handle, _) = session_with(device);

        let result = upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample(10), SdsQuirks::default());

        assert!(matches!(result, Err(Error::Rejected(Rejection::Cancelled))));
        assert_eq!(packets_sent(&handle), 0);
    }

    #[test]
    fn test_upload_missing_close_ack() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Ack];
        device.silent_last = true;
        let sample = sample(100);

        let (session, _, _) = session_with(device);
        let quirks = SdsQuirks { tolerate_missing_close_ack: true, ..Default::default() };
        upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample, quirks)
            .expect("Quirk should accept the missing ACK");
    }

    #[test]
    fn test_upload_missing_close_ack_without_quirk() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Ack];
        device.silent_last = true;
        let (session, handle, _) = session_with(device);

        let result = upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample(100), SdsQuirks::default());

        assert!(matches!(result, Err(Error::Timeout)));
        let cancels = handle
            .messages()
            .iter()
            .filter(|m| m.len() == SDS_HANDSHAKE_LEN && m[3] == SDS_CANCEL)
            .count();
        assert_eq!(cancels, 1);
    }

    #[test]
    fn test_upload_rejects_empty_sample() {
        let (session, handle, _) = session_with(SdsDevice::empty(0));
        let result = upload(&mut session.lock(), &JobControl::new(), 0, 0, &Sample::new(44100, Vec::new()), SdsQuirks::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_upload_one_part_per_packet() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Ack];
        let (session, _, _) = session_with(device);
        let job = JobControl::new();

        upload(&mut session.lock(), &job, 0, 0, &sample(100), SdsQuirks::default())
            .expect("Upload should succeed");

        assert_eq!(job.parts(), 3);
        assert_eq!(job.part(), 2);
        assert_eq!(job.progress(), 1.0);
    }

    #[test]
    fn test_upload_rejects_oversized_header_fields() {
        let too_long = Sample::new(44100, vec![0; (MAX_FIELD as usize) + 2]);
        // 400 Hz is a 2.5 ms period, past what 21 bits of nanoseconds hold
        let too_slow = Sample::new(400, vec![0; 10]);

        for sample in [too_long, too_slow] {
            let (session, handle, _) = session_with(SdsDevice::empty(0));
            let result = upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample, SdsQuirks::default());
            assert!(matches!(result, Err(Error::InvalidArgument(_))));
            assert!(handle.written().is_empty());
        }
    }

    #[test]
    fn test_upload_stops_when_device_goes_quiet_after_nak() {
        let mut headers = 0;
        let port = MockPort::responder(move |msg| {
            if DumpHeader::parse(msg).is_some() {
                headers += 1;
                if headers == 1 {
                    return Handshake::Nak.encode(0, 0);
                }
            }
            Vec::new()
        });
        let handle = port.handle();
        let session = Session::new(Box::new(port), Config::for_tests());

        let result = upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample(100), SdsQuirks::default());

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(count(&handle, SDS_HEADER_LEN, SDS_DUMP_HEADER), 2);
        assert_eq!(packets_sent(&handle), 0);
        assert_eq!(count(&handle, SDS_HANDSHAKE_LEN, SDS_CANCEL), 1);
    }

    #[test]
    fn test_upload_repeated_wait_does_not_extend_deadline() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Wait];
        let (session, handle, _) = session_with(device);

        let stop = Arc::new(AtomicBool::new(false));
        let waits = {
            let stop = Arc::clone(&stop);
            let handle = handle.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    handle.push_reads(&Handshake::Wait.encode(0, 0));
                    std::thread::sleep(Duration::from_millis(10));
                }
            })
        };

        let start = Instant::now();
        let result = upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample(100), SdsQuirks::default());
        let elapsed = start.elapsed();
        stop.store(true, Ordering::Relaxed);
        waits.join().expect("wait thread panicked");

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(elapsed < Duration::from_secs(1), "waited {:?}", elapsed);
        assert_eq!(packets_sent(&handle), 0);
    }

    #[test]
    fn test_upload_deadline_ignores_foreign_traffic() {
        let mut device = SdsDevice::empty(0);
        device.header_reply = vec![Handshake::Ack];
        device.silent_last = true;
        let (session, handle, _) = session_with(device);

        let stop = Arc::new(AtomicBool::new(false));
        let noise = {
            let stop = Arc::clone(&stop);
            let handle = handle.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    handle.push_reads(&[0xF0, 0x43, 0x10, 0x01, 0xF7]);
                    std::thread::sleep(Duration::from_millis(20));
                }
            })
        };

        let start = Instant::now();
        let result = upload(&mut session.lock(), &JobControl::new(), 0, 0, &sample(100), SdsQuirks::default());
        let elapsed = start.elapsed();
        stop.store(true, Ordering::Relaxed);
        noise.join().expect("noise thread panicked");

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(elapsed < Duration::from_secs(2), "waited {:?}", elapsed);
    }
}
