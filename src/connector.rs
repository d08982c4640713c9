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


//! Device identification and the list of known dialects.

use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

use crate::codec::SysexScanner;
use crate::connectors::{elektron::ElektronConnector, sds::SdsConnector};
use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::job::JobControl;
use crate::protocol::*;
use crate::session::Session;
use crate::transfer::Transfer;

/// Answer to a MIDI identity request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device id (channel) the unit answered on.
    pub channel: u8,
    /// Manufacturer id, one byte or `00 xx yy`.
    pub company: Vec<u8>,
    pub family: u16,
    pub model: u16,
    pub version: [u8; 4],
}

impl DeviceIdentity {
    /// Parses `F0 7E <ch> 06 02 <company> <family> <model> <version> F7`.
    pub fn parse(msg: &[u8]) -> Option<Self> {
        if msg.len() < 6
            || msg[0] != SOX
            || msg[1] != UNIVERSAL_NON_REALTIME
            || msg[3] != GENERAL_INFO
            || msg[4] != IDENTITY_REPLY
            || msg[msg.len() - 1] != EOX
        {
            return None;
        }

        let body = &msg[5..msg.len() - 1];
        let company_len = if body.first() == Some(&0) { 3 } else { 1 };
        if body.len() != company_len + 8 {
            return None;
        }
        let (company, rest) = body.split_at(company_len);
        Some(DeviceIdentity {
            channel: msg[2],
            company: company.to_vec(),
            family: rest[0] as u16 | (rest[1] as u16) << 7,
            model: rest[2] as u16 | (rest[3] as u16) << 7,
            version: [rest[4], rest[5], rest[6], rest[7]],
        })
    }

    pub fn version_string(&self) -> String {
        let v = self.version;
        format!("{}.{}.{}.{}", v[0], v[1], v[2], v[3])
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "company {:02X?} family {:04X} model {:04X} version {}",
            self.company,
            self.family,
            self.model,
            self.version_string()
        )
    }
}

pub fn identity_request() -> Vec<u8> {
    vec![SOX, UNIVERSAL_NON_REALTIME, ALL_CALL, GENERAL_INFO, IDENTITY_REQUEST, EOX]
}

/// Sends an identity request and returns the first identity reply.
///
/// Replies are collected in batch mode so that every unit on the bus has a
/// chance to answer before the stream goes quiet.
pub fn identify(session: &Session, job: &JobControl) -> Result<DeviceIdentity> {
    let mut io = session.lock();
    let idle = io.config().batch_idle;

    let mut transfer = Transfer::new(identity_request(), idle).batch();
    transfer.send(&mut io)?;
    let Some(batch) = transfer.receive(&mut io, job)? else {
        return Err(Error::NoDevice);
    };

    let mut scanner = SysexScanner::new();
    scanner.push(&batch);
    while let Some(msg) = scanner.next_message() {
        if let Some(identity) = DeviceIdentity::parse(&msg) {
            debug!("Identity: {}", identity);
            io.set_identity(identity.clone());
            return Ok(identity);
        }
    }
    Err(Error::NoDevice)
}

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub version: String,
    pub connector: &'static str,
    pub filesystems: Vec<Arc<dyn Filesystem>>,
}

impl Device {
    pub fn filesystem(&self, name: &str) -> Option<&Arc<dyn Filesystem>> {
        self.filesystems.iter().find(|fs| fs.name() == name)
    }
}

/// One device family's dialect.
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Port names matching this pattern are probed before the others.
    fn device_pattern(&self) -> Option<&Regex> {
        None
    }

    /// Identifies the device behind `session`. Fails with
    /// [`Error::NoDevice`] when the device is not one of ours.
    fn handshake(&self, session: &Session) -> Result<Device>;
}

static CONNECTORS: LazyLock<Vec<Box<dyn Connector>>> =
    LazyLock::new(|| vec![Box::new(ElektronConnector::new()), Box::new(SdsConnector::new())]);

/// Registered connectors in priority order.
pub fn connectors() -> &'static [Box<dyn Connector>] {
    &CONNECTORS
}

/// Handshakes with the named connector only.
pub fn connect(session: &Session, name: &str) -> Result<Device> {
    let connector = connectors()
        .iter()
        .find(|c| c.name() == name)
        .ok_or_else(|| Error::invalid(format!("Unknown connector '{}'", name)))?;
    connector.handshake(session)
}

/// Tries every connector against the device behind `session`.
pub fn autodetect(session: &Session) -> Result<Device> {
    detect(session, connectors())
}

fn detect(session: &Session, candidates: &[Box<dyn Connector>]) -> Result<Device> {
    let port = session.name();
    let matching = |c: &&Box<dyn Connector>| c.device_pattern().is_some_and(|re| re.is_match(port));
    let (first, rest): (Vec<_>, Vec<_>) = candidates.iter().partition(matching);

    for connector in first.into_iter().chain(rest) {
        debug!("Trying connector {}", connector.name());
        match connector.handshake(session) {
            Ok(device) => {
                info!("Connected to {} {} via {}", device.name, device.version, connector.name());
                return Ok(device);
            }
            Err(Error::NoDevice) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(Error::NoDevice)
}
