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


//! Single request/response exchange.

use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::job::JobControl;
use crate::session::SessionIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Sending,
    Receiving,
    Finished,
}

/// One outstanding request. Holds the outgoing message until it is sent and
/// the reply once one arrives.
#[derive(Debug)]
pub struct Transfer {
    raw: Vec<u8>,
    active: bool,
    status: Status,
    timeout: Duration,
    batch: bool,
}

impl Transfer {
    pub fn new(raw: Vec<u8>, timeout: Duration) -> Self {
        Transfer { raw, active: false, status: Status::Waiting, timeout, batch: false }
    }

    /// Keep reading past the first terminator until the stream goes quiet.
    pub fn batch(mut self) -> Self {
        self.batch = true;
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The request before [`Transfer::send`], the reply after a receive.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn send(&mut self, io: &mut SessionIo) -> Result<()> {
        self.active = true;
        self.status = Status::Sending;
        let result = io.send(&self.raw);
        self.status = Status::Waiting;
        if result.is_err() {
            self.finish();
        }
        result
    }

    /// Waits for whatever comes next, without looking at it.
    pub fn receive(&mut self, io: &mut SessionIo, job: &JobControl) -> Result<Option<Vec<u8>>> {
        self.status = Status::Receiving;
        let result = io.receive(self.timeout, self.batch, job);
        self.finish();
        if let Ok(Some(msg)) = &result {
            self.raw.clone_from(msg);
        }
        result
    }

    /// Sends the request and waits for the reply `accept` recognises.
    ///
    /// Replies that do not match are dropped without resending; the whole
    /// exchange fails with [`Error::Timeout`] once the deadline passes.
    pub fn exchange<A>(&mut self, io: &mut SessionIo, job: &JobControl, accept: A) -> Result<Vec<u8>>
    where
        A: Fn(&[u8]) -> bool,
    {
        self.send(io)?;
        self.status = Status::Receiving;
        let deadline = Instant::now() + self.timeout;

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                self.finish();
                return Err(Error::Timeout);
            }

            match io.receive(left, false, job) {
                Ok(Some(msg)) if accept(&msg) => {
                    self.finish();
                    self.raw.clone_from(&msg);
                    return Ok(msg);
                }
                Ok(Some(msg)) => debug!("Discarding unexpected message: {:02X?}", msg),
                Ok(None) => {
                    self.finish();
                    return Err(Error::Timeout);
                }
                Err(e) => {
                    self.finish();
                    return Err(e);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.active = false;
        self.status = Status::Finished;
    }
}
