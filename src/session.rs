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


//! One live connection to a device.

use parking_lot::{Mutex, MutexGuard};
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::codec::SysexScanner;
use crate::config::Config;
use crate::connector::DeviceIdentity;
use crate::connectors::{elektron::ElektronState, sds::SdsState};
use crate::error::{Error, Result};
use crate::job::JobControl;
use crate::serial::MidiPort;
use crate::transfer::Transfer;

/// What the active dialect keeps between requests.
#[derive(Debug, Clone, Default)]
pub enum DialectState {
    #[default]
    None,
    Sds(SdsState),
    Elektron(ElektronState),
}

/// Mutable side of a session, only reachable through [`Session::lock`].
pub struct SessionIo {
    port: Option<Box<dyn MidiPort>>,
    scanner: SysexScanner,
    seq: u16,
    config: Config,
    identity: Option<DeviceIdentity>,
    state: DialectState,
}

/// A transport plus everything needed to talk over it.
///
/// All traffic goes through the session mutex, so at most one exchange (or
/// one whole multi-packet transfer, if the caller keeps the guard) is in
/// flight at a time.
pub struct Session {
    name: String,
    config: Config,
    io: Mutex<SessionIo>,
}

impl Session {
    pub fn new(port: Box<dyn MidiPort>, config: Config) -> Self {
        let name = port.name().to_string();
        Session {
            name,
            config: config.clone(),
            io: Mutex::new(SessionIo {
                port: Some(port),
                scanner: SysexScanner::with_limit(config.max_message),
                seq: 0,
                config,
                identity: None,
                state: DialectState::None,
            }),
        }
    }

    /// Port name as reported by the host.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Blocks until no other thread is using the session.
    pub fn lock(&self) -> MutexGuard<'_, SessionIo> {
        self.io.lock()
    }

    pub fn is_open(&self) -> bool {
        self.io.lock().is_open()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.io.lock().identity.clone()
    }

    pub fn state(&self) -> DialectState {
        self.io.lock().state.clone()
    }

    pub fn close(&self) {
        self.io.lock().teardown();
    }

    /// Sends the message built for the next sequence number and waits for
    /// the reply `accept` recognises. Anything else that arrives meanwhile
    /// is dropped.
    pub fn request_reply<B, A>(&self, build: B, accept: A, job: &JobControl) -> Result<Vec<u8>>
    where
        B: FnOnce(u16) -> Vec<u8>,
        A: Fn(u16, &[u8]) -> bool,
    {
        let mut io = self.lock();
        let seq = io.next_seq();
        let timeout = io.config.timeout;
        Transfer::new(build(seq), timeout).exchange(&mut io, job, |msg| accept(seq, msg))
    }
}

impl SessionIo {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Returns the current sequence number and advances it, wrapping at 65536.
    pub fn next_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: DeviceIdentity) {
        self.identity = Some(identity);
    }

    pub fn state(&self) -> &DialectState {
        &self.state
    }

    pub fn set_state(&mut self, state: DialectState) {
        self.state = state;
    }

    /// Closes both directions. The session is unusable afterwards.
    pub fn teardown(&mut self) {
        if self.port.take().is_some() {
            warn!("Closing MIDI port");
        }
        self.scanner.clear();
    }

    fn port(&mut self) -> Result<&mut Box<dyn MidiPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::new(ErrorKind::NotConnected, "Session closed")))
    }

    /// Writes one complete message, in bounded chunks, until all of it is out.
    pub fn send(&mut self, msg: &[u8]) -> Result<()> {
        let chunk = self.config.write_chunk.max(1);
        let poll = self.config.poll_interval;
        let deadline = Instant::now() + self.config.timeout;
        debug!("Sent: {:02X?}", msg);

        let mut sent = 0;
        while sent < msg.len() {
            let end = (sent + chunk).min(msg.len());
            let result = self.port()?.write(&msg[sent..end]);
            match result {
                Ok(0) => {
                    self.teardown();
                    return Err(std::io::Error::from(ErrorKind::WriteZero).into());
                }
                Ok(n) => sent += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => {
                    self.teardown();
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Waits for the next SysEx message.
    ///
    /// Returns `None` when `timeout` passes without a complete message. In
    /// batch mode every message that arrives is collected until the stream
    /// has been quiet for `timeout`, and the concatenation is returned.
    /// Otherwise the deadline runs from the call, so a noisy stream cannot
    /// hold it open.
    pub fn receive(&mut self, timeout: Duration, batch: bool, job: &JobControl) -> Result<Option<Vec<u8>>> {
        let poll = self.config.poll_interval;
        let mut last_data = Instant::now();
        let mut buf = [0u8; 512];

        loop {
            if !batch {
                if let Some(msg) = self.scanner.next_message() {
                    debug!("Received: {:02X?}", msg);
                    return Ok(Some(msg));
                }
            }

            if !job.is_active() {
                return Err(Error::Cancelled);
            }

            let result = self.port()?.read(&mut buf);
            match result {
                Ok(n) if n > 0 => {
                    trace!("Read {} bytes", n);
                    self.scanner.push(&buf[..n]);
                    if batch {
                        last_data = Instant::now();
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
                Err(e) => {
                    self.teardown();
                    return Err(e.into());
                }
            }

            if last_data.elapsed() >= timeout {
                if batch {
                    let msgs = self.scanner.take_all();
                    if let Some(msgs) = &msgs {
                        debug!("Received batch: {:02X?}", msgs);
                    }
                    return Ok(msgs);
                }
                trace!("Nothing received in {:?}", timeout);
                return Ok(None);
            }

            job.wait(poll);
        }
    }
}
