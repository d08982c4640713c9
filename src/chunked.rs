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


//! Lock-step open/partial/close jobs.
//!
//! The device hands out a job id on open. Data then moves in numbered chunks
//! of at most [`MAX_CHUNK`] bytes, each carrying a CRC-32, until the last one
//! is flagged. Nothing is retried here: the first bad status, CRC or shape
//! aborts the whole job, and close verifies the byte count.

use tracing::{debug, info, warn};

use crate::codec::crc32;
use crate::error::{Error, Result};
use crate::job::JobControl;

/// Upper bound for a chunk on the wire
pub const MAX_CHUNK: usize = 2048;

/// What the device answers to an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub id: u32,
    /// Total size for reads, accepted size for writes.
    pub size: u64,
    pub chunk_size: usize,
}

/// One chunk coming from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partial {
    pub is_last: bool,
    pub crc: u32,
    pub data: Vec<u8>,
}

/// Dialect side of a job. Each call is one request/response round trip and
/// fails on any status other than success.
pub trait JobProtocol {
    fn open_read(&self, path: &str, job: &JobControl) -> Result<Opened>;
    fn read_partial(&self, id: u32, seq: u32, job: &JobControl) -> Result<Partial>;
    fn close_read(&self, id: u32, job: &JobControl) -> Result<()>;

    fn open_write(&self, path: &str, size: u64, job: &JobControl) -> Result<Opened>;
    fn write_partial(&self, id: u32, seq: u32, crc: u32, data: &[u8], job: &JobControl) -> Result<()>;
    /// Returns the number of bytes the device says it stored.
    fn close_write(&self, id: u32, size: u64, job: &JobControl) -> Result<u64>;
}

/// Host-side bookkeeping for an open job.
#[derive(Debug)]
pub struct ChunkedJob {
    id: u32,
    seq: u32,
    transferred: u64,
    chunk_size: usize,
}

impl ChunkedJob {
    pub fn new(opened: &Opened) -> Result<Self> {
        if opened.chunk_size == 0 || opened.chunk_size > MAX_CHUNK {
            return Err(Error::desync(format!("Bad chunk size {}", opened.chunk_size)));
        }
        Ok(ChunkedJob { id: opened.id, seq: 0, transferred: 0, chunk_size: opened.chunk_size })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Sequence number for the next chunk. Never wraps within a job.
    fn next_seq(&mut self) -> Result<u32> {
        let seq = self.seq;
        self.seq = self
            .seq
            .checked_add(1)
            .ok_or_else(|| Error::desync("Job sequence overflow"))?;
        Ok(seq)
    }

    fn record(&mut self, bytes: usize) {
        self.transferred += bytes as u64;
    }

    /// Fails unless exactly `expected` bytes went through.
    pub fn verify(&self, expected: u64) -> Result<()> {
        if self.transferred != expected {
            return Err(Error::SizeMismatch { expected, actual: self.transferred });
        }
        Ok(())
    }

    /// Closes a read job and checks the byte count.
    pub fn close_read<P: JobProtocol + ?Sized>(self, protocol: &P, expected: u64, job: &JobControl) -> Result<()> {
        protocol.close_read(self.id, job)?;
        self.verify(expected)
    }

    /// Closes a write job and checks both our count and the device's.
    pub fn close_write<P: JobProtocol + ?Sized>(self, protocol: &P, expected: u64, job: &JobControl) -> Result<()> {
        let stored = protocol.close_write(self.id, expected, job)?;
        self.verify(expected)?;
        if stored != expected {
            return Err(Error::SizeMismatch { expected, actual: stored });
        }
        Ok(())
    }
}

/// One part per chunk, so the caller sees every round trip.
fn chunk_parts(size: u64, chunk_size: usize) -> u32 {
    let parts = size.div_ceil(chunk_size as u64).max(1);
    u32::try_from(parts).unwrap_or(u32::MAX)
}

fn chunk_done(job: &JobControl) {
    job.set_progress(1.0);
    job.next_part();
}

/// Reads a whole file through a job.
pub fn read_job<P: JobProtocol + ?Sized>(protocol: &P, path: &str, job: &JobControl) -> Result<Vec<u8>> {
    let opened = protocol.open_read(path, job)?;
    let mut state = ChunkedJob::new(&opened)?;
    debug!("Opened read job {} for {} ({} bytes)", opened.id, path, opened.size);
    job.set_parts(chunk_parts(opened.size, state.chunk_size));

    let mut data = Vec::new();
    let result = (|| -> Result<()> {
        loop {
            if !job.is_active() {
                return Err(Error::Cancelled);
            }

            let seq = state.next_seq()?;
            let partial = protocol.read_partial(state.id, seq, job)?;
            if partial.data.len() > state.chunk_size {
                return Err(Error::desync(format!(
                    "Chunk {} has {} bytes, limit is {}",
                    seq,
                    partial.data.len(),
                    state.chunk_size
                )));
            }
            if crc32(&partial.data) != partial.crc {
                return Err(Error::desync(format!("CRC mismatch in chunk {}", seq)));
            }

            state.record(partial.data.len());
            data.extend_from_slice(&partial.data);
            chunk_done(job);

            if partial.is_last {
                return Ok(());
            }
            if state.transferred > opened.size {
                return Err(Error::SizeMismatch { expected: opened.size, actual: state.transferred });
            }
        }
    })();

    if let Err(e) = result {
        warn!("Aborting read job {}: {}", opened.id, e);
        if let Err(close) = protocol.close_read(opened.id, &JobControl::new()) {
            debug!("Close after abort failed: {}", close);
        }
        return Err(e);
    }

    state.close_read(protocol, opened.size, job)?;
    info!("Read {} bytes from {}", data.len(), path);
    Ok(data)
}

/// Writes `data` to `path` through a job.
pub fn write_job<P: JobProtocol + ?Sized>(protocol: &P, path: &str, data: &[u8], job: &JobControl) -> Result<()> {
    let size = data.len() as u64;
    let opened = protocol.open_write(path, size, job)?;
    let mut state = ChunkedJob::new(&opened)?;
    debug!("Opened write job {} for {} ({} bytes)", opened.id, path, size);

    let chunk_size = state.chunk_size;
    job.set_parts(chunk_parts(size, chunk_size));
    let result = (|| -> Result<()> {
        for chunk in data.chunks(chunk_size) {
            if !job.is_active() {
                return Err(Error::Cancelled);
            }
            let seq = state.next_seq()?;
            protocol.write_partial(state.id, seq, crc32(chunk), chunk, job)?;
            state.record(chunk.len());
            chunk_done(job);
        }
        Ok(())
    })();

    if let Err(e) = result {
        warn!("Aborting write job {}: {}", opened.id, e);
        if let Err(close) = protocol.close_write(opened.id, state.transferred, &JobControl::new()) {
            debug!("Close after abort failed: {}", close);
        }
        return Err(e);
    }

    state.close_write(protocol, size, job)?;
    job.set_progress(1.0);
    info!("Wrote {} bytes to {}", size, path);
    Ok(())
}
