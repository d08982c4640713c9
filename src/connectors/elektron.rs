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


//! Elektron devices.
//!
//! Every message is `F0 00 20 3C 10 00 <packed payload> F7`, where the
//! payload starts with a big-endian sequence number and a command byte. A
//! reply repeats the sequence number, sets bit 7 of the command and starts
//! its arguments with a status byte.

use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::chunked::{self, JobProtocol, Opened, Partial};
use crate::codec::{frame, unframe};
use crate::connector::{Connector, Device};
use crate::device::{DeviceDescriptor, DeviceRegistry, DeviceTable};
use crate::error::{Error, Rejection, Result};
use crate::fs::{
    Filesystem, FsOptions, Item, ItemIter, Operations, join, parse_slot, slot_label, split_parent,
    split_path,
};
use crate::job::JobControl;
use crate::session::{DialectState, Session};

const HEADER: [u8; 5] = [0x00, 0x20, 0x3C, 0x10, 0x00];
const REPLY_BIT: u8 = 0x80;
const MAX_NAME_LEN: usize = 32;

/// First byte of every reply body.
mod status {
    pub const FAILED: u8 = 0x00;
    pub const OK: u8 = 0x01;
    pub const EXISTS: u8 = 0x02;
    pub const NOT_FOUND: u8 = 0x03;
    pub const NOT_A_DIRECTORY: u8 = 0x04;
    pub const NOT_PERMITTED: u8 = 0x05;
    pub const NO_SPACE: u8 = 0x06;
    pub const BUSY: u8 = 0x07;
}

mod cmd {
    pub const PING: u8 = 0x01;
    pub const VERSION: u8 = 0x02;
    pub const READDIR: u8 = 0x10;
    pub const MKDIR: u8 = 0x11;
    pub const RMDIR: u8 = 0x12;
    pub const DELETE: u8 = 0x20;
    pub const RENAME: u8 = 0x21;
    pub const READ_OPEN: u8 = 0x30;
    pub const READ_CLOSE: u8 = 0x31;
    pub const READ_PARTIAL: u8 = 0x32;
    pub const WRITE_OPEN: u8 = 0x40;
    pub const WRITE_CLOSE: u8 = 0x41;
    pub const WRITE_PARTIAL: u8 = 0x42;
    pub const DATA_LIST: u8 = 0x53;
    pub const DATA_READ_OPEN: u8 = 0x54;
    pub const DATA_READ_CLOSE: u8 = 0x55;
    pub const DATA_READ_PARTIAL: u8 = 0x56;
    pub const DATA_WRITE_OPEN: u8 = 0x57;
    pub const DATA_WRITE_CLOSE: u8 = 0x58;
    pub const DATA_WRITE_PARTIAL: u8 = 0x59;
    pub const DATA_MOVE: u8 = 0x5A;
    pub const DATA_COPY: u8 = 0x5B;
    pub const DATA_CLEAR: u8 = 0x5C;
    pub const DATA_SWAP: u8 = 0x5D;
}

pub const FS_SAMPLES: u32 = 1 << 0;
pub const FS_PROJECTS: u32 = 1 << 1;
pub const FS_SOUNDS: u32 = 1 << 2;

static PORT_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)elektron|digitakt|digitone|syntakt|analog (rytm|four|heat|keys)|model:(samples|cycles)").ok()
});

// ============================================================================
// Wire format
// ============================================================================

/// Builds the message for `cmd` with sequence number `seq`.
pub fn encode(seq: u16, cmd: u8, args: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(args.len() + 3);
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.push(cmd);
    payload.extend_from_slice(args);
    frame(&HEADER, &payload)
}

/// Splits a message into sequence number, command and arguments.
pub fn decode(msg: &[u8]) -> Option<(u16, u8, Vec<u8>)> {
    let payload = unframe(&HEADER, msg)?;
    if payload.len() < 3 {
        return None;
    }
    Some((u16::from_be_bytes([payload[0], payload[1]]), payload[2], payload[3..].to_vec()))
}

/// Request arguments.
#[derive(Debug, Default)]
struct Args(Vec<u8>);

impl Args {
    fn new() -> Self {
        Args(Vec::new())
    }

    fn u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    fn u32(mut self, value: u32) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn str(mut self, value: &str) -> Self {
        self.0.extend_from_slice(value.as_bytes());
        self.0.push(0);
        self
    }

    fn bytes(mut self, value: &[u8]) -> Self {
        self.0.extend_from_slice(value);
        self
    }
}

/// Cursor over reply arguments.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::desync("Truncated reply"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::desync("Unterminated string in reply"))?;
        let value = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[end + 1..];
        Ok(value)
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// Maps a failure status to a rejection. Only a generic failure falls back
/// to reading the reason text, which older firmware fills in alone.
fn rejection(code: u8, reason: &str) -> Rejection {
    match code {
        status::EXISTS => Rejection::AlreadyExists,
        status::NOT_FOUND => Rejection::NoSuchSlot,
        status::NOT_A_DIRECTORY => Rejection::NotADirectory,
        status::NOT_PERMITTED => Rejection::NotPermitted,
        status::NO_SPACE => Rejection::NoSpace,
        status::BUSY => Rejection::Busy,
        code => {
            if code != status::FAILED {
                debug!("Unknown status {:02X}", code);
            }
            rejection_from_text(reason)
        }
    }
}

fn rejection_from_text(reason: &str) -> Rejection {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("not a directory") {
        Rejection::NotADirectory
    } else if lower.contains("no such") || lower.contains("not found") || lower.contains("not exist") {
        Rejection::NoSuchSlot
    } else if lower.contains("exist") {
        Rejection::AlreadyExists
    } else if lower.contains("permi") || lower.contains("protected") {
        Rejection::NotPermitted
    } else if lower.contains("space") || lower.contains("full") {
        Rejection::NoSpace
    } else if lower.contains("busy") {
        Rejection::Busy
    } else {
        Rejection::Other(reason.to_string())
    }
}

/// Sends `cmd` and returns the reply arguments after the status byte.
fn request(session: &Session, cmd: u8, args: &[u8], job: &JobControl) -> Result<Vec<u8>> {
    let reply = session.request_reply(
        |seq| encode(seq, cmd, args),
        |seq, msg| decode(msg).is_some_and(|(s, c, _)| s == seq && c == cmd | REPLY_BIT),
        job,
    )?;

    let (_, _, body) = decode(&reply).ok_or_else(|| Error::desync("Undecodable reply"))?;
    let (&code, rest) = body.split_first().ok_or_else(|| Error::desync("Reply without status"))?;
    if code != status::OK {
        let reason = Reader::new(rest).string().unwrap_or_default();
        debug!("Command {:02X} failed with status {:02X}: {}", cmd, code, reason);
        return Err(Error::Rejected(rejection(code, &reason)));
    }
    Ok(rest.to_vec())
}

fn control(session: &Session, cmd: u8, args: Args) -> Result<Vec<u8>> {
    request(session, cmd, &args.0, &JobControl::new())
}

// ============================================================================
// Connector
// ============================================================================

fn builtin_devices() -> DeviceTable {
    let all = FS_SAMPLES | FS_PROJECTS | FS_SOUNDS;
    let entry = |id, name: &str, filesystems, storage| DeviceDescriptor {
        id,
        name: name.to_string(),
        filesystems,
        storage,
    };
    DeviceTable::new(vec![
        entry(8, "Analog Rytm", all, true),
        entry(12, "Digitakt", all, true),
        entry(16, "Analog Rytm MKII", all, true),
        entry(25, "Model:Samples", FS_SAMPLES | FS_PROJECTS, false),
    ])
}

/// Per-session state of an Elektron device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElektronState {
    pub descriptor: DeviceDescriptor,
    pub version: String,
}

pub struct ElektronConnector {
    registry: Arc<dyn DeviceRegistry>,
}

impl ElektronConnector {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(builtin_devices()))
    }

    pub fn with_registry(registry: Arc<dyn DeviceRegistry>) -> Self {
        ElektronConnector { registry }
    }
}

impl Default for ElektronConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for ElektronConnector {
    fn name(&self) -> &'static str {
        "elektron"
    }

    fn device_pattern(&self) -> Option<&Regex> {
        (*PORT_PATTERN).as_ref()
    }

    fn handshake(&self, session: &Session) -> Result<Device> {
        let pong = match control(session, cmd::PING, Args::new()) {
            Ok(pong) => pong,
            Err(Error::Timeout) => return Err(Error::NoDevice),
            Err(e) => return Err(e),
        };
        let id = Reader::new(&pong).u8()?;
        let Some(descriptor) = self.registry.lookup(id) else {
            warn!("Unknown Elektron device id {}", id);
            return Err(Error::NoDevice);
        };

        let version = Reader::new(&control(session, cmd::VERSION, Args::new())?).string()?;
        info!("Found {} running {}", descriptor.name, version);

        let mut filesystems: Vec<Arc<dyn Filesystem>> = Vec::new();
        if descriptor.has_filesystem(FS_SAMPLES) {
            filesystems.push(Arc::new(SampleFs));
        }
        if descriptor.has_filesystem(FS_PROJECTS) {
            filesystems.push(Arc::new(PROJECTS));
        }
        if descriptor.has_filesystem(FS_SOUNDS) {
            filesystems.push(Arc::new(SOUNDS));
        }

        session.lock().set_state(DialectState::Elektron(ElektronState {
            descriptor: descriptor.clone(),
            version: version.clone(),
        }));

        Ok(Device { name: descriptor.name, version, connector: self.name(), filesystems })
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct JobCommands {
    open_read: u8,
    close_read: u8,
    read_partial: u8,
    open_write: u8,
    close_write: u8,
    write_partial: u8,
}

const SAMPLE_JOBS: JobCommands = JobCommands {
    open_read: cmd::READ_OPEN,
    close_read: cmd::READ_CLOSE,
    read_partial: cmd::READ_PARTIAL,
    open_write: cmd::WRITE_OPEN,
    close_write: cmd::WRITE_CLOSE,
    write_partial: cmd::WRITE_PARTIAL,
};

const DATA_JOBS: JobCommands = JobCommands {
    open_read: cmd::DATA_READ_OPEN,
    close_read: cmd::DATA_READ_CLOSE,
    read_partial: cmd::DATA_READ_PARTIAL,
    open_write: cmd::DATA_WRITE_OPEN,
    close_write: cmd::DATA_WRITE_CLOSE,
    write_partial: cmd::DATA_WRITE_PARTIAL,
};

enum Target {
    Path,
    Slot(DataFs),
}

/// Job commands of one filesystem, bound to a session.
struct Jobs<'s> {
    session: &'s Session,
    commands: JobCommands,
    target: Target,
}

impl Jobs<'_> {
    fn address(&self, path: &str) -> Result<Args> {
        match &self.target {
            Target::Path => Ok(Args::new().str(path)),
            Target::Slot(fs) => Ok(Args::new().u8(fs.kind).u32(fs.slot(path)?)),
        }
    }

    fn echo(reader: &mut Reader, id: u32, seq: u32) -> Result<()> {
        let (rid, rseq) = (reader.u32()?, reader.u32()?);
        if rid != id || rseq != seq {
            return Err(Error::desync(format!(
                "Reply for job {} chunk {}, expected job {} chunk {}",
                rid, rseq, id, seq
            )));
        }
        Ok(())
    }
}

impl JobProtocol for Jobs<'_> {
    fn open_read(&self, path: &str, job: &JobControl) -> Result<Opened> {
        let body = request(self.session, self.commands.open_read, &self.address(path)?.0, job)?;
        let mut reader = Reader::new(&body);
        Ok(Opened {
            id: reader.u32()?,
            size: reader.u32()? as u64,
            chunk_size: reader.u32()? as usize,
        })
    }

    fn read_partial(&self, id: u32, seq: u32, job: &JobControl) -> Result<Partial> {
        let args = Args::new().u32(id).u32(seq);
        let body = request(self.session, self.commands.read_partial, &args.0, job)?;
        let mut reader = Reader::new(&body);
        Self::echo(&mut reader, id, seq)?;
        let is_last = reader.u8()? != 0;
        let crc = reader.u32()?;
        let len = reader.u32()? as usize;
        let data = reader.take(len)?.to_vec();
        Ok(Partial { is_last, crc, data })
    }

    fn close_read(&self, id: u32, job: &JobControl) -> Result<()> {
        request(self.session, self.commands.close_read, &Args::new().u32(id).0, job)?;
        Ok(())
    }

    fn open_write(&self, path: &str, size: u64, job: &JobControl) -> Result<Opened> {
        let size32 = u32::try_from(size).map_err(|_| Error::invalid(format!("{} bytes is too large", size)))?;
        let args = self.address(path)?.u32(size32);
        let body = request(self.session, self.commands.open_write, &args.0, job)?;
        let mut reader = Reader::new(&body);
        Ok(Opened { id: reader.u32()?, size, chunk_size: reader.u32()? as usize })
    }

    fn write_partial(&self, id: u32, seq: u32, crc: u32, data: &[u8], job: &JobControl) -> Result<()> {
        let args = Args::new().u32(id).u32(seq).u32(crc).u32(data.len() as u32).bytes(data);
        let body = request(self.session, self.commands.write_partial, &args.0, job)?;
        Self::echo(&mut Reader::new(&body), id, seq)
    }

    fn close_write(&self, id: u32, size: u64, job: &JobControl) -> Result<u64> {
        let args = Args::new().u32(id).u32(size as u32);
        let body = request(self.session, self.commands.close_write, &args.0, job)?;
        let mut reader = Reader::new(&body);
        let rid = reader.u32()?;
        if rid != id {
            return Err(Error::desync(format!("Close reply for job {}, expected {}", rid, id)));
        }
        Ok(reader.u32()? as u64)
    }
}

// ============================================================================
// Sample filesystem
// ============================================================================

/// Directory tree of samples on the device drive, addressed by path.
#[derive(Debug)]
pub struct SampleFs;

/// Lazily parses a directory listing reply.
struct SampleEntries {
    body: Vec<u8>,
    pos: usize,
    next_id: u32,
}

impl SampleEntries {
    fn parse_next(&mut self) -> Result<Item> {
        let mut reader = Reader::new(&self.body[self.pos..]);
        let size = reader.u32()?;
        let kind = reader.u8()?;
        let name = reader.string()?;
        self.pos = self.body.len() - reader.remaining();

        let id = self.next_id;
        self.next_id += 1;
        match kind {
            b'D' => Ok(Item::dir(id, name)),
            b'F' => Ok(Item::file(id, name, Some(size as u64))),
            other => Err(Error::desync(format!("Unknown entry type {:02X}", other))),
        }
    }
}

impl Iterator for SampleEntries {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Result<Item>> {
        if self.pos >= self.body.len() {
            return None;
        }
        let item = self.parse_next();
        if item.is_err() {
            self.pos = self.body.len();
        }
        Some(item)
    }
}

impl SampleFs {
    fn jobs<'s>(&self, session: &'s Session) -> Jobs<'s> {
        Jobs { session, commands: SAMPLE_JOBS, target: Target::Path }
    }

    /// Rebuilds `path` with a device-legal last component.
    fn legal_path(&self, path: &str) -> Result<String> {
        let (dir, name) = split_parent(path)?;
        let name = self.sanitize_name(name);
        if name.is_empty() {
            return Err(Error::invalid(format!("No usable name in '{}'", path)));
        }
        Ok(join(&dir, &name))
    }
}

impl Filesystem for SampleFs {
    fn id(&self) -> u32 {
        FS_SAMPLES
    }

    fn name(&self) -> &'static str {
        "samples"
    }

    fn icon(&self) -> &'static str {
        "sample"
    }

    fn options(&self) -> FsOptions {
        FsOptions { show_size: true, ..FsOptions::default() }
    }

    fn operations(&self) -> Operations {
        Operations::READDIR
            | Operations::DOWNLOAD
            | Operations::UPLOAD
            | Operations::RENAME
            | Operations::MOVE
            | Operations::DELETE
            | Operations::MKDIR
    }

    fn max_name_len(&self) -> usize {
        MAX_NAME_LEN
    }

    fn readdir<'a>(&'a self, session: &'a Session, path: &str) -> Result<ItemIter<'a>> {
        let body = control(session, cmd::READDIR, Args::new().str(path))?;
        Ok(Box::new(SampleEntries { body, pos: 0, next_id: 0 }))
    }

    fn download(&self, session: &Session, path: &str, job: &JobControl) -> Result<Vec<u8>> {
        chunked::read_job(&self.jobs(session), path, job)
    }

    fn upload(&self, session: &Session, path: &str, data: &[u8], job: &JobControl) -> Result<()> {
        let path = self.legal_path(path)?;
        chunked::write_job(&self.jobs(session), &path, data, job)
    }

    /// `to` is either a new name in the same directory or a full path.
    fn rename(&self, session: &Session, from: &str, to: &str) -> Result<()> {
        let to = if to.contains('/') {
            self.legal_path(to)?
        } else {
            let (dir, _) = split_parent(from)?;
            self.legal_path(&join(&dir, to))?
        };
        control(session, cmd::RENAME, Args::new().str(from).str(&to))?;
        Ok(())
    }

    fn move_item(&self, session: &Session, from: &str, to: &str) -> Result<()> {
        let to = self.legal_path(to)?;
        control(session, cmd::RENAME, Args::new().str(from).str(&to))?;
        Ok(())
    }

    /// Deletes a file, or a directory with everything below it.
    fn delete(&self, session: &Session, path: &str) -> Result<()> {
        if split_path(path).is_empty() {
            return Err(Error::Rejected(Rejection::NotPermitted));
        }
        match self.readdir(session, path) {
            Ok(items) => {
                let items = items.collect::<Result<Vec<_>>>()?;
                for item in items {
                    self.delete(session, &join(path, &item.name))?;
                }
                control(session, cmd::RMDIR, Args::new().str(path))?;
            }
            Err(Error::Rejected(Rejection::NotADirectory)) => {
                control(session, cmd::DELETE, Args::new().str(path))?;
            }
            Err(e) => return Err(e),
        }
        debug!("Deleted {}", path);
        Ok(())
    }

    fn mkdir(&self, session: &Session, path: &str) -> Result<()> {
        let path = self.legal_path(path)?;
        control(session, cmd::MKDIR, Args::new().str(&path))?;
        Ok(())
    }
}

// ============================================================================
// Data filesystems
// ============================================================================

/// Slot-addressed storage for projects or sounds.
#[derive(Debug, Clone, Copy)]
pub struct DataFs {
    id: u32,
    name: &'static str,
    kind: u8,
    slots: u32,
    bank_size: u32,
}

const PROJECTS: DataFs = DataFs { id: FS_PROJECTS, name: "projects", kind: 1, slots: 128, bank_size: 0 };
const SOUNDS: DataFs = DataFs { id: FS_SOUNDS, name: "sounds", kind: 2, slots: 256, bank_size: 16 };

impl DataFs {
    fn slot(&self, path: &str) -> Result<u32> {
        let slot = parse_slot(path, self.bank_size)?;
        if slot >= self.slots {
            return Err(Error::Rejected(Rejection::NoSuchSlot));
        }
        Ok(slot)
    }

    fn jobs<'s>(&self, session: &'s Session) -> Jobs<'s> {
        Jobs { session, commands: DATA_JOBS, target: Target::Slot(*self) }
    }

    fn pair(&self, session: &Session, cmd: u8, a: &str, b: &str) -> Result<()> {
        let args = Args::new().u8(self.kind).u32(self.slot(a)?).u32(self.slot(b)?);
        control(session, cmd, args)?;
        Ok(())
    }
}

impl Filesystem for DataFs {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn icon(&self) -> &'static str {
        "data"
    }

    fn options(&self) -> FsOptions {
        FsOptions { slots: true, bank_size: self.bank_size, single_item: true, show_size: true }
    }

    fn operations(&self) -> Operations {
        Operations::READDIR
            | Operations::DOWNLOAD
            | Operations::UPLOAD
            | Operations::MOVE
            | Operations::COPY
            | Operations::CLEAR
            | Operations::SWAP
    }

    fn max_name_len(&self) -> usize {
        0
    }

    fn readdir<'a>(&'a self, session: &'a Session, path: &str) -> Result<ItemIter<'a>> {
        if !split_path(path).is_empty() {
            return Err(Error::Rejected(Rejection::NotADirectory));
        }
        let body = control(session, cmd::DATA_LIST, Args::new().u8(self.kind))?;
        let bank_size = self.bank_size;
        let mut pos = 0;

        Ok(Box::new(std::iter::from_fn(move || {
            if pos >= body.len() {
                return None;
            }
            let mut reader = Reader::new(&body[pos..]);
            let item = (|| -> Result<Item> {
                let slot = reader.u32()?;
                let size = reader.u32()?;
                let name = reader.string()?;
                Ok(Item::file(slot, name, Some(size as u64)).with_slot(slot_label(slot, bank_size)))
            })();
            pos = if item.is_ok() { body.len() - reader.remaining() } else { body.len() };
            Some(item)
        })))
    }

    fn download(&self, session: &Session, path: &str, job: &JobControl) -> Result<Vec<u8>> {
        chunked::read_job(&self.jobs(session), path, job)
    }

    fn upload(&self, session: &Session, path: &str, data: &[u8], job: &JobControl) -> Result<()> {
        chunked::write_job(&self.jobs(session), path, data, job)
    }

    fn move_item(&self, session: &Session, from: &str, to: &str) -> Result<()> {
        self.pair(session, cmd::DATA_MOVE, from, to)
    }

    fn copy(&self, session: &Session, from: &str, to: &str) -> Result<()> {
        self.pair(session, cmd::DATA_COPY, from, to)
    }

    fn clear(&self, session: &Session, path: &str) -> Result<()> {
        control(session, cmd::DATA_CLEAR, Args::new().u8(self.kind).u32(self.slot(path)?))?;
        Ok(())
    }

    fn swap(&self, session: &Session, a: &str, b: &str) -> Result<()> {
        self.pair(session, cmd::DATA_SWAP, a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc32;
    use crate::config::Config;
    use crate::serial::MockPort;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    enum Dest {
        File(String),
        Slot(u8, u32),
    }

    enum SimJob {
        Read(Vec<u8>),
        Write { dest: Dest, data: Vec<u8> },
    }

    /// Device side of the dialect, backed by in-memory storage.
    struct Sim {
        id: u8,
        chunk: u32,
        dirs: BTreeSet<String>,
        files: BTreeMap<String, Vec<u8>>,
        slots: BTreeMap<(u8, u32), (String, Vec<u8>)>,
        jobs: HashMap<u32, SimJob>,
        next_job: u32,
        seqs: Vec<u16>,
        commands: Vec<u8>,
        cancel_on_partial: Option<JobControl>,
    }

    fn parent(path: &str) -> String {
        split_parent(path).map(|(dir, _)| dir).unwrap_or_else(|_| "/".to_string())
    }

    fn name_of(path: &str) -> &str {
        split_parent(path).map(|(_, name)| name).unwrap_or("")
    }

    impl Sim {
        fn new(id: u8) -> Self {
            Sim {
                id,
                chunk: 64,
                dirs: BTreeSet::from(["/".to_string()]),
                files: BTreeMap::new(),
                slots: BTreeMap::new(),
                jobs: HashMap::new(),
                next_job: 100,
                seqs: Vec::new(),
                commands: Vec::new(),
                cancel_on_partial: None,
            }
        }

        fn with_content(mut self) -> Self {
            self.dirs.insert("/drums".into());
            self.files.insert("/drums/kick".into(), vec![1, 2, 3]);
            self.files.insert("/pad".into(), vec![9; 5]);
            self.slots.insert((1, 0), ("SONG A".into(), vec![0xAA; 10]));
            self.slots.insert((2, 5), ("BASS".into(), (0..20).collect()));
            self
        }

        fn respond(&mut self, msg: &[u8]) -> Vec<u8> {
            let Some((seq, command, args)) = decode(msg) else {
                return Vec::new();
            };
            self.seqs.push(seq);
            self.commands.push(command);

            let body = match self.handle(command, &mut Reader::new(&args)) {
                Ok(body) => [vec![status::OK], body].concat(),
                Err((code, reason)) => Args::new().u8(code).str(reason).0,
            };
            encode(seq, command | REPLY_BIT, &body)
        }

        fn open_job(&mut self, job: SimJob) -> u32 {
            let id = self.next_job;
            self.next_job += 1;
            self.jobs.insert(id, job);
            id
        }

        fn handle(&mut self, command: u8, r: &mut Reader) -> std::result::Result<Vec<u8>, (u8, &'static str)> {
            const NO_SUCH: (u8, &str) = (status::NOT_FOUND, "No such file or directory");

            match command {
                cmd::PING => Ok(vec![self.id]),
                cmd::VERSION => Ok(Args::new().str("1.51A").0),
                cmd::READDIR => {
                    let path = r.string().unwrap();
                    if self.files.contains_key(&path) {
                        return Err((status::NOT_A_DIRECTORY, "Not a directory"));
                    }
                    if !self.dirs.contains(&path) {
                        return Err(NO_SUCH);
                    }
                    let mut out = Args::new();
                    for dir in self.dirs.iter().filter(|d| *d != "/" && parent(d) == path) {
                        out = out.u32(0).u8(b'D').str(name_of(dir));
                    }
                    for (file, data) in self.files.iter().filter(|(f, _)| parent(f) == path) {
                        out = out.u32(data.len() as u32).u8(b'F').str(name_of(file));
                    }
                    Ok(out.0)
                }
                cmd::MKDIR => {
                    let path = r.string().unwrap();
                    if self.dirs.contains(&path) || self.files.contains_key(&path) {
                        return Err((status::EXISTS, "File exists"));
                    }
                    if !self.dirs.contains(&parent(&path)) {
                        return Err(NO_SUCH);
                    }
                    self.dirs.insert(path);
                    Ok(Vec::new())
                }
                cmd::RMDIR => {
                    let path = r.string().unwrap();
                    if !self.dirs.contains(&path) {
                        return Err(NO_SUCH);
                    }
                    let busy = self.dirs.iter().any(|d| d != "/" && parent(d) == path)
                        || self.files.keys().any(|f| parent(f) == path);
                    if busy {
                        return Err((status::FAILED, "Directory not empty"));
                    }
                    self.dirs.remove(&path);
                    Ok(Vec::new())
                }
                cmd::DELETE => {
                    let path = r.string().unwrap();
                    self.files.remove(&path).map(|_| Vec::new()).ok_or(NO_SUCH)
                }
                cmd::RENAME => {
                    let (from, to) = (r.string().unwrap(), r.string().unwrap());
                    if self.files.contains_key(&to) || self.dirs.contains(&to) {
                        return Err((status::EXISTS, "File exists"));
                    }
                    if let Some(data) = self.files.remove(&from) {
                        self.files.insert(to, data);
                    } else if self.dirs.remove(&from) {
                        self.dirs.insert(to);
                    } else {
                        return Err(NO_SUCH);
                    }
                    Ok(Vec::new())
                }
                cmd::READ_OPEN | cmd::DATA_READ_OPEN => {
                    let data = if command == cmd::READ_OPEN {
                        let path = r.string().unwrap();
                        self.files.get(&path).cloned().ok_or(NO_SUCH)?
                    } else {
                        let key = (r.u8().unwrap(), r.u32().unwrap());
                        self.slots.get(&key).map(|(_, d)| d.clone()).ok_or((status::NOT_FOUND, "No such slot"))?
                    };
                    let size = data.len() as u32;
                    let id = self.open_job(SimJob::Read(data));
                    Ok(Args::new().u32(id).u32(size).u32(self.chunk).0)
                }
                cmd::READ_PARTIAL | cmd::DATA_READ_PARTIAL => {
                    let (id, chunk_seq) = (r.u32().unwrap(), r.u32().unwrap());
                    if chunk_seq == 1 {
                        if let Some(job) = &self.cancel_on_partial {
                            job.cancel();
                        }
                    }
                    let Some(SimJob::Read(data)) = self.jobs.get(&id) else {
                        return Err((status::FAILED, "Bad job"));
                    };
                    let chunk = self.chunk as usize;
                    let start = (chunk_seq as usize * chunk).min(data.len());
                    let end = (start + chunk).min(data.len());
                    let bytes = &data[start..end];
                    Ok(Args::new()
                        .u32(id)
                        .u32(chunk_seq)
                        .u8((end == data.len()) as u8)
                        .u32(crc32(bytes))
                        .u32(bytes.len() as u32)
                        .bytes(bytes)
                        .0)
                }
                cmd::READ_CLOSE | cmd::DATA_READ_CLOSE => {
                    let id = r.u32().unwrap();
                    self.jobs.remove(&id).map(|_| Args::new().u32(id).0).ok_or((status::FAILED, "Bad job"))
                }
                cmd::WRITE_OPEN | cmd::DATA_WRITE_OPEN => {
                    let dest = if command == cmd::WRITE_OPEN {
                        let path = r.string().unwrap();
                        if !self.dirs.contains(&parent(&path)) {
                            return Err(NO_SUCH);
                        }
                        Dest::File(path)
                    } else {
                        Dest::Slot(r.u8().unwrap(), r.u32().unwrap())
                    };
                    let _size = r.u32().unwrap();
                    let id = self.open_job(SimJob::Write { dest, data: Vec::new() });
                    Ok(Args::new().u32(id).u32(self.chunk).0)
                }
                cmd::WRITE_PARTIAL | cmd::DATA_WRITE_PARTIAL => {
                    let (id, chunk_seq, crc, len) =
                        (r.u32().unwrap(), r.u32().unwrap(), r.u32().unwrap(), r.u32().unwrap());
                    let bytes = r.take(len as usize).unwrap();
                    if crc32(bytes) != crc {
                        return Err((status::FAILED, "Bad CRC"));
                    }
                    let Some(SimJob::Write { data, .. }) = self.jobs.get_mut(&id) else {
                        return Err((status::FAILED, "Bad job"));
                    };
                    data.extend_from_slice(bytes);
                    Ok(Args::new().u32(id).u32(chunk_seq).0)
                }
                cmd::WRITE_CLOSE | cmd::DATA_WRITE_CLOSE => {
                    let id = r.u32().unwrap();
                    let Some(SimJob::Write { dest, data }) = self.jobs.remove(&id) else {
                        return Err((status::FAILED, "Bad job"));
                    };
                    let stored = data.len() as u32;
                    match dest {
                        Dest::File(path) => {
                            self.files.insert(path, data);
                        }
                        Dest::Slot(kind, slot) => {
                            self.slots.insert((kind, slot), ("UNTITLED".into(), data));
                        }
                    }
                    Ok(Args::new().u32(id).u32(stored).0)
                }
                cmd::DATA_LIST => {
                    let kind = r.u8().unwrap();
                    let mut out = Args::new();
                    for ((_, slot), (name, data)) in self.slots.iter().filter(|((k, _), _)| *k == kind) {
                        out = out.u32(*slot).u32(data.len() as u32).str(name);
                    }
                    Ok(out.0)
                }
                cmd::DATA_MOVE | cmd::DATA_COPY | cmd::DATA_SWAP => {
                    let (kind, a, b) = (r.u8().unwrap(), r.u32().unwrap(), r.u32().unwrap());
                    let first = self.slots.get(&(kind, a)).cloned().ok_or((status::NOT_FOUND, "No such slot"))?;
                    match command {
                        cmd::DATA_MOVE => {
                            self.slots.remove(&(kind, a));
                        }
                        cmd::DATA_SWAP => match self.slots.remove(&(kind, b)) {
                            Some(second) => {
                                self.slots.insert((kind, a), second);
                            }
                            None => {
                                self.slots.remove(&(kind, a));
                            }
                        },
                        _ => {}
                    }
                    self.slots.insert((kind, b), first);
                    Ok(Vec::new())
                }
                cmd::DATA_CLEAR => {
                    let key = (r.u8().unwrap(), r.u32().unwrap());
                    self.slots.remove(&key);
                    Ok(Vec::new())
                }
                _ => Err((status::FAILED, "Unknown command")),
            }
        }
    }

    fn session_for(sim: Sim) -> (Session, Arc<Mutex<Sim>>) {
        let sim = Arc::new(Mutex::new(sim));
        let responder = Arc::clone(&sim);
        let port = MockPort::responder(move |msg| responder.lock().respond(msg)).named("Elektron Digitakt");
        (Session::new(Box::new(port), Config::for_tests()), sim)
    }

    fn connected(sim: Sim) -> (Session, Device, Arc<Mutex<Sim>>) {
        let (session, sim) = session_for(sim);
        let device = ElektronConnector::new().handshake(&session).expect("Handshake should succeed");
        (session, device, sim)
    }

    fn list(fs: &Arc<dyn Filesystem>, session: &Session, path: &str) -> Vec<Item> {
        fs.readdir(session, path)
            .expect("Should list")
            .collect::<Result<Vec<_>>>()
            .expect("Entries should parse")
    }

    #[test]
    fn test_message_layout() {
        let msg = encode(0x0102, cmd::READDIR, b"/\0");
        assert_eq!(&msg[..6], &[0xF0, 0x00, 0x20, 0x3C, 0x10, 0x00]);
        assert_eq!(msg.last(), Some(&0xF7));
        assert!(msg[1..msg.len() - 1].iter().all(|&b| b < 0x80));
        assert_eq!(decode(&msg), Some((0x0102, cmd::READDIR, b"/\0".to_vec())));
        assert_eq!(decode(&[0xF0, 0x43, 0x10, 0x00, 0xF7]), None);
    }

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(rejection(status::EXISTS, ""), Rejection::AlreadyExists);
        assert_eq!(rejection(status::NOT_FOUND, ""), Rejection::NoSuchSlot);
        assert_eq!(rejection(status::NOT_A_DIRECTORY, ""), Rejection::NotADirectory);
        assert_eq!(rejection(status::NOT_PERMITTED, ""), Rejection::NotPermitted);
        assert_eq!(rejection(status::NO_SPACE, ""), Rejection::NoSpace);
        assert_eq!(rejection(status::BUSY, ""), Rejection::Busy);
        // The code wins over text that reads like something else
        assert_eq!(rejection(status::NOT_FOUND, "File exists"), Rejection::NoSuchSlot);
        assert_eq!(rejection(status::BUSY, "Storage full"), Rejection::Busy);
    }

    #[test]
    fn test_rejection_text_fallback() {
        assert_eq!(rejection(status::FAILED, "File exists"), Rejection::AlreadyExists);
        assert_eq!(rejection(status::FAILED, "File does not exist"), Rejection::NoSuchSlot);
        assert_eq!(rejection(0x7F, "Storage full"), Rejection::NoSpace);
        assert_eq!(rejection(status::FAILED, "Write protected"), Rejection::NotPermitted);
        assert_eq!(
            rejection(status::FAILED, "Directory not empty"),
            Rejection::Other("Directory not empty".into())
        );
    }

    #[test]
    fn test_handshake() {
        let (session, device, sim) = connected(Sim::new(12));

        assert_eq!(device.name, "Digitakt");
        assert_eq!(device.version, "1.51A");
        let names: Vec<_> = device.filesystems.iter().map(|fs| fs.name()).collect();
        assert_eq!(names, vec!["samples", "projects", "sounds"]);

        let DialectState::Elektron(state) = session.state() else {
            panic!("Expected Elektron state");
        };
        assert_eq!(state.descriptor.id, 12);
        assert_eq!(sim.lock().commands, vec![cmd::PING, cmd::VERSION]);
    }

    #[test]
    fn test_handshake_other_devices() {
        let (session, _) = session_for(Sim::new(99));
        assert!(matches!(ElektronConnector::new().handshake(&session), Err(Error::NoDevice)));

        let silent = MockPort::responder(|_| Vec::new());
        let session = Session::new(Box::new(silent), Config::for_tests());
        assert!(matches!(ElektronConnector::new().handshake(&session), Err(Error::NoDevice)));
    }

    #[test]
    fn test_custom_registry() {
        let table = DeviceTable::parse("99 1 0 Prototype").unwrap();
        let (session, _) = session_for(Sim::new(99));
        let device = ElektronConnector::with_registry(Arc::new(table)).handshake(&session).unwrap();
        assert_eq!(device.name, "Prototype");
        assert_eq!(device.filesystems.len(), 1);
    }

    #[test]
    fn test_port_pattern() {
        let connector = ElektronConnector::new();
        let re = connector.device_pattern().expect("Pattern compiles");
        assert!(re.is_match("Elektron Digitakt MIDI 1"));
        assert!(re.is_match("Analog Rytm MKII"));
        assert!(!re.is_match("USB MIDI Interface"));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (session, device, sim) = connected(Sim::new(12).with_content());
        let samples = device.filesystem("samples").unwrap();
        list(samples, &session, "/");
        list(samples, &session, "/drums");

        assert_eq!(sim.lock().seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sample_readdir() {
        let (session, device, _) = connected(Sim::new(12).with_content());
        let samples = device.filesystem("samples").unwrap();

        let items = list(samples, &session, "/");
        assert_eq!(items.len(), 2);
        assert!(items[0].is_dir());
        assert_eq!(items[0].name, "drums");
        assert_eq!(items[1].name, "pad");
        assert_eq!(items[1].size, Some(5));

        assert!(matches!(
            samples.readdir(&session, "/pad"),
            Err(Error::Rejected(Rejection::NotADirectory))
        ));
        assert!(matches!(
            samples.readdir(&session, "/nope"),
            Err(Error::Rejected(Rejection::NoSuchSlot))
        ));
    }

    #[test]
    fn test_sample_upload_and_download() {
        let (session, device, sim) = connected(Sim::new(12).with_content());
        let samples = device.filesystem("samples").unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        let job = JobControl::with_progress(move |f| sink.lock().push(f));

        samples.upload(&session, "/drums/snare 01", &content, &job).expect("Upload should succeed");
        let partials = sim.lock().commands.iter().filter(|&&c| c == cmd::WRITE_PARTIAL).count();
        assert_eq!(partials, 16);
        assert_eq!(progress.lock().last().copied(), Some(1.0));

        let back = samples.download(&session, "/drums/snare 01", &JobControl::new()).expect("Download should succeed");
        assert_eq!(back, content);
        assert!(sim.lock().jobs.is_empty(), "Every job is closed");
    }

    #[test]
    fn test_upload_sanitizes_name() {
        let (session, device, sim) = connected(Sim::new(12).with_content());
        let samples = device.filesystem("samples").unwrap();
        let long = format!("/drums/{}é", "x".repeat(40));

        samples.upload(&session, &long, &[1, 2], &JobControl::new()).unwrap();
        assert!(sim.lock().files.contains_key(&format!("/drums/{}", "x".repeat(32))));
    }

    #[test]
    fn test_download_cancelled_closes_job() {
        let job = JobControl::new();
        let mut sim = Sim::new(12).with_content();
        sim.files.insert("/long".into(), vec![7; 500]);
        sim.cancel_on_partial = Some(job.clone());
        let (session, device, sim) = connected(sim);
        let samples = device.filesystem("samples").unwrap();

        let result = samples.download(&session, "/long", &job);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(sim.lock().commands.last(), Some(&cmd::READ_CLOSE));
    }

    #[test]
    fn test_mkdir_and_recursive_delete() {
        let (session, device, sim) = connected(Sim::new(12).with_content());
        let samples = device.filesystem("samples").unwrap();

        assert!(matches!(
            samples.mkdir(&session, "/drums"),
            Err(Error::Rejected(Rejection::AlreadyExists))
        ));
        samples.mkdir(&session, "/drums/909").unwrap();

        samples.delete(&session, "/drums").expect("Delete should succeed");
        let sim = sim.lock();
        assert!(!sim.dirs.contains("/drums"));
        assert!(!sim.dirs.contains("/drums/909"));
        assert!(!sim.files.contains_key("/drums/kick"));
        assert!(sim.files.contains_key("/pad"));
    }

    #[test]
    fn test_rename_and_move() {
        let (session, device, sim) = connected(Sim::new(12).with_content());
        let samples = device.filesystem("samples").unwrap();

        samples.rename(&session, "/pad", "strings").unwrap();
        samples.move_item(&session, "/strings", "/drums/strings").unwrap();
        assert!(matches!(
            samples.rename(&session, "/drums/strings", "kick"),
            Err(Error::Rejected(Rejection::AlreadyExists))
        ));

        let sim = sim.lock();
        assert!(sim.files.contains_key("/drums/strings"));
        assert!(!sim.files.contains_key("/pad"));
    }

    #[test]
    fn test_data_filesystems() {
        let (session, device, sim) = connected(Sim::new(12).with_content());
        let sounds = device.filesystem("sounds").unwrap();
        let projects = device.filesystem("projects").unwrap();

        let items = list(sounds, &session, "/");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 5);
        assert_eq!(items[0].name, "BASS");
        assert_eq!(items[0].slot.as_deref(), Some("A06"));
        assert_eq!(items[0].size, Some(20));

        let bass = sounds.download(&session, "/A06", &JobControl::new()).unwrap();
        assert_eq!(bass, (0..20).collect::<Vec<u8>>());

        sounds.swap(&session, "/A06", "/A01").unwrap();
        sounds.copy(&session, "/A01", "/B01").unwrap();
        sounds.clear(&session, "/A01").unwrap();
        sounds.move_item(&session, "/B01", "/P16").unwrap();
        projects.upload(&session, "/3", &[5; 100], &JobControl::new()).unwrap();

        let sim = sim.lock();
        let kinds: Vec<_> = sim.slots.keys().copied().collect();
        assert_eq!(kinds, vec![(1, 0), (1, 2), (2, 255)]);
        assert_eq!(sim.slots[&(2, 255)].0, "BASS");
        assert_eq!(sim.slots[&(1, 2)].1, vec![5; 100]);

        drop(sim);
        assert!(matches!(
            sounds.clear(&session, "/Q01"),
            Err(Error::Rejected(Rejection::NoSuchSlot))
        ));
    }

    fn exercise(fs: &dyn Filesystem, session: &Session, op: Operations) -> Result<()> {
        let job = JobControl::new();
        let (a, b) = if fs.options().slots { ("/1", "/2") } else { ("/x", "/y") };
        match op {
            Operations::READDIR => fs.readdir(session, "/").map(|_| ()),
            Operations::DOWNLOAD => fs.download(session, a, &job).map(|_| ()),
            Operations::UPLOAD => fs.upload(session, a, &[1, 2, 3], &job),
            Operations::RENAME => fs.rename(session, a, "z"),
            Operations::MOVE => fs.move_item(session, a, b),
            Operations::COPY => fs.copy(session, a, b),
            Operations::DELETE => fs.delete(session, a),
            Operations::CLEAR => fs.clear(session, a),
            Operations::SWAP => fs.swap(session, a, b),
            Operations::MKDIR => fs.mkdir(session, "/m"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_advertised_operations_are_implemented() {
        let all = [
            Operations::READDIR,
            Operations::DOWNLOAD,
            Operations::UPLOAD,
            Operations::RENAME,
            Operations::MOVE,
            Operations::COPY,
            Operations::DELETE,
            Operations::CLEAR,
            Operations::SWAP,
            Operations::MKDIR,
        ];
        let (session, device, _) = connected(Sim::new(12).with_content());

        for fs in &device.filesystems {
            for op in all {
                let result = exercise(&**fs, &session, op);
                if fs.supports(op) {
                    assert!(!matches!(result, Err(Error::Unsupported(_))), "{} {}", fs.name(), op);
                } else {
                    assert!(matches!(result, Err(Error::Unsupported(_))), "{} {}", fs.name(), op);
                }
            }
        }
    }
}
