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


//! Samplers that speak the MIDI Sample Dump Standard and answer identity
//! requests.

use std::sync::Arc;
use tracing::{info, warn};

use crate::connector::{Connector, Device, DeviceIdentity, identify};
use crate::error::{Error, Rejection, Result};
use crate::fs::{Filesystem, FsOptions, Item, ItemIter, Operations, parse_slot, slot_label, split_path};
use crate::job::JobControl;
use crate::sds::{self, Sample, SdsQuirks};
use crate::session::{DialectState, Session};

const NO_QUIRKS: SdsQuirks = SdsQuirks {
    tolerate_missing_single_word_packet: false,
    tolerate_missing_close_ack: false,
};

/// Rate used for uploads, which carry raw PCM without a header.
pub const UPLOAD_RATE: u32 = 44100;

struct Model {
    name: &'static str,
    company: &'static [u8],
    family: u16,
    slots: u16,
    quirks: SdsQuirks,
}

const MODELS: &[Model] = &[
    Model {
        name: "E-mu ESI",
        company: &[0x18],
        family: 0x0004,
        slots: 1000,
        quirks: SdsQuirks { tolerate_missing_single_word_packet: true, ..NO_QUIRKS },
    },
    Model {
        name: "Akai S-series",
        company: &[0x47],
        family: 0x0000,
        slots: 128,
        quirks: NO_QUIRKS,
    },
    Model {
        name: "Kurzweil K2000",
        company: &[0x07],
        family: 0x0078,
        slots: 999,
        quirks: SdsQuirks { tolerate_missing_close_ack: true, ..NO_QUIRKS },
    },
];

fn lookup(identity: &DeviceIdentity) -> Option<&'static Model> {
    MODELS
        .iter()
        .find(|m| m.company == identity.company.as_slice() && m.family == identity.family)
}

/// Per-session state of an SDS device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdsState {
    pub channel: u8,
    pub quirks: SdsQuirks,
    pub slots: u16,
}

#[derive(Debug, Default)]
pub struct SdsConnector;

impl SdsConnector {
    pub fn new() -> Self {
        SdsConnector
    }
}

impl Connector for SdsConnector {
    fn name(&self) -> &'static str {
        "sds"
    }

    fn handshake(&self, session: &Session) -> Result<Device> {
        let identity = identify(session, &JobControl::new())?;
        let Some(model) = lookup(&identity) else {
            info!("No SDS model for {}", identity);
            return Err(Error::NoDevice);
        };

        let state = SdsState { channel: identity.channel, quirks: model.quirks, slots: model.slots };
        session.lock().set_state(DialectState::Sds(state));
        info!("Found {} on channel {}", model.name, identity.channel);

        Ok(Device {
            name: model.name.to_string(),
            version: identity.version_string(),
            connector: self.name(),
            filesystems: vec![Arc::new(SampleFs { state })],
        })
    }
}

/// Numbered sample memory. Items are slots, data is 16-bit LE PCM.
#[derive(Debug)]
pub struct SampleFs {
    state: SdsState,
}

impl SampleFs {
    fn slot(&self, path: &str) -> Result<u16> {
        let slot = parse_slot(path, 0)?;
        if slot >= self.state.slots as u32 {
            return Err(Error::Rejected(Rejection::NoSuchSlot));
        }
        Ok(slot as u16)
    }

    fn quirks(&self) -> SdsQuirks {
        let quirks = self.state.quirks;
        if quirks != SdsQuirks::default() {
            warn!("Using device quirks: {:?}", quirks);
        }
        quirks
    }
}

impl Filesystem for SampleFs {
    fn id(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "samples"
    }

    fn icon(&self) -> &'static str {
        "sample"
    }

    fn options(&self) -> FsOptions {
        FsOptions { slots: true, bank_size: 0, single_item: true, show_size: false }
    }

    fn operations(&self) -> Operations {
        Operations::READDIR | Operations::DOWNLOAD | Operations::UPLOAD
    }

    fn max_name_len(&self) -> usize {
        0
    }

    fn readdir<'a>(&'a self, _session: &'a Session, path: &str) -> Result<ItemIter<'a>> {
        if !split_path(path).is_empty() {
            return Err(Error::Rejected(Rejection::NotADirectory));
        }
        Ok(Box::new((0..self.state.slots as u32).map(|index| {
            let label = slot_label(index, 0);
            Ok(Item::file(index, label.clone(), None).with_slot(label))
        })))
    }

    fn download(&self, session: &Session, path: &str, job: &JobControl) -> Result<Vec<u8>> {
        let slot = self.slot(path)?;
        let sample = sds::download(&mut session.lock(), job, self.state.channel, slot, self.quirks())?;
        info!("Sample {}: {} words, {} bits, {} Hz", slot, sample.data.len(), sample.bits, sample.rate());
        Ok(sample.data.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    fn upload(&self, session: &Session, path: &str, data: &[u8], job: &JobControl) -> Result<()> {
        let slot = self.slot(path)?;
        if data.len() % 2 != 0 {
            return Err(Error::invalid("16-bit PCM data must have an even length"));
        }
        let samples = data.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        let sample = Sample::new(UPLOAD_RATE, samples);
        sds::upload(&mut session.lock(), job, self.state.channel, slot, &sample, self.quirks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connector::identity_request;
    use crate::sds::Handshake;
    use crate::sds::sim::SdsDevice;
    use crate::serial::MockPort;
    use parking_lot::Mutex;

    const EMU_REPLY: [u8; 15] = [0xF0, 0x7E, 0x03, 0x06, 0x02, 0x18, 0x04, 0x00, 0x01, 0x00, 0x02, 0x05, 0x00, 0x00, 0xF7];

    fn sampler(device: SdsDevice, reply: &'static [u8]) -> (Session, Arc<Mutex<SdsDevice>>) {
        let device = Arc::new(Mutex::new(device));
        let sim = Arc::clone(&device);
        let port = MockPort::responder(move |msg| {
            if msg == identity_request().as_slice() {
                return reply.to_vec();
            }
            sim.lock().respond(msg)
        });
        (Session::new(Box::new(port), Config::for_tests()), device)
    }

    #[test]
    fn test_handshake_known_model() {
        let (session, _) = sampler(SdsDevice::empty(3), &EMU_REPLY);

        let device = SdsConnector.handshake(&session).expect("Should connect");
        assert_eq!(device.name, "E-mu ESI");
        assert_eq!(device.version, "2.5.0.0");
        assert_eq!(device.connector, "sds");

        let DialectState::Sds(state) = session.state() else {
            panic!("Expected SDS state");
        };
        assert_eq!(state.channel, 3);
        assert!(state.quirks.tolerate_missing_single_word_packet);

        let fs = device.filesystem("samples").expect("Samples filesystem");
        let items: Vec<_> = fs.readdir(&session, "/").unwrap().take(3).map(|i| i.unwrap()).collect();
        assert_eq!(items[0].slot.as_deref(), Some("001"));
        assert_eq!(items[2].id, 2);
    }

    #[test]
    fn test_handshake_unknown_model() {
        let reply: &'static [u8] = &[0xF0, 0x7E, 0x00, 0x06, 0x02, 0x41, 0x10, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0xF7];
        let (session, _) = sampler(SdsDevice::empty(0), reply);
        assert!(matches!(SdsConnector.handshake(&session), Err(Error::NoDevice)));
    }

    #[test]
    fn test_download_returns_le_pcm() {
        let data: Vec<i16> = vec![0, -2, 300, i16::MAX, i16::MIN];
        let mut device = SdsDevice::holding(3, 16, &data);
        device.header.as_mut().unwrap().sample = 4;
        let (session, _) = sampler(device, &EMU_REPLY);
        let device = SdsConnector.handshake(&session).unwrap();
        let fs = device.filesystem("samples").unwrap();

        let bytes = fs.download(&session, "/005", &JobControl::new()).expect("Download should succeed");
        let expected: Vec<u8> = data.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_upload_from_le_pcm() {
        let mut sim = SdsDevice::empty(3);
        sim.header_reply = vec![Handshake::Ack];
        let (session, sim) = sampler(sim, &EMU_REPLY);
        let device = SdsConnector.handshake(&session).unwrap();
        let fs = device.filesystem("samples").unwrap();

        fs.upload(&session, "/2", &[0x01, 0x00, 0xFF, 0xFF], &JobControl::new())
            .expect("Upload should succeed");
        let sim = sim.lock();
        assert_eq!(sim.uploaded(), vec![1, -1]);
        assert_eq!(sim.received_header.as_ref().unwrap().sample, 1);
    }

    #[test]
    fn test_slot_bounds_and_unsupported() {
        let (session, _) = sampler(SdsDevice::empty(3), &EMU_REPLY);
        let device = SdsConnector.handshake(&session).unwrap();
        let fs = device.filesystem("samples").unwrap();

        assert!(matches!(
            fs.download(&session, "/1001", &JobControl::new()),
            Err(Error::Rejected(Rejection::NoSuchSlot))
        ));
        assert!(matches!(
            fs.upload(&session, "/1", &[0x01], &JobControl::new()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(fs.delete(&session, "/1"), Err(Error::Unsupported(_))));
        assert!(fs.readdir(&session, "/sub").is_err());
    }
}
