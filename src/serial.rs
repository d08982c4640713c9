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


use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;
use serialport::SerialPort as SerialPortTrait;

// ============================================================================
// MidiPort Trait
// ============================================================================

/// Raw duplex MIDI byte stream.
pub trait MidiPort: Send {
    /// Name reported by the host, used to pick a connector.
    fn name(&self) -> &str;

    /// Writes some of `buf`, returning how much was taken.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads whatever is available. Fails with `WouldBlock` when the port
    /// has nothing to hand over right now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A port the host knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub kind: PortKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Serial,
    Midi,
}

/// Lists serial ports and, with the `midi-io` feature, host MIDI ports.
pub fn available_ports() -> io::Result<Vec<PortInfo>> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .map_err(|e| io::Error::other(e.to_string()))?
        .into_iter()
        .map(|p| PortInfo { name: p.port_name, kind: PortKind::Serial })
        .collect();

    #[cfg(feature = "midi-io")]
    ports.extend(
        midi::port_names()?
            .into_iter()
            .map(|name| PortInfo { name, kind: PortKind::Midi }),
    );

    Ok(ports)
}

// ============================================================================
// Serial Port Implementation
// ============================================================================

/// MIDI over a serial device, e.g. a USB-serial MIDI interface
pub struct SerialMidiPort {
    name: String,
    port: Box<dyn SerialPortTrait>,
}

/// MIDI's native bit rate
pub const MIDI_BAUD: u32 = 31250;

impl SerialMidiPort {
    /// Opens `port_name`. Reads give up after `poll`, which is reported to
    /// callers as `WouldBlock`.
    pub fn open(port_name: &str, baud_rate: u32, poll: Duration) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(poll)
            .open()?;

        Ok(SerialMidiPort { name: port_name.to_string(), port })
    }
}

fn would_block(e: io::Error) -> io::Error {
    if e.kind() == ErrorKind::TimedOut {
        io::Error::new(ErrorKind::WouldBlock, e)
    } else {
        e
    }
}

impl MidiPort for SerialMidiPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.port.write(buf).map_err(would_block)?;
        self.port.flush().map_err(would_block)?;
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf).map_err(would_block)? {
            0 => Err(ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }
}

// ============================================================================
// Host MIDI Implementation
// ============================================================================

#[cfg(feature = "midi-io")]
pub use midi::MidirPort;

#[cfg(feature = "midi-io")]
mod midi {
    use super::MidiPort;
    use crate::protocol::EOX;
    use crossbeam_channel::{Receiver, TryRecvError, unbounded};
    use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
    use std::collections::VecDeque;
    use std::io::{self, ErrorKind};

    const CLIENT_NAME: &str = "sysexfs";

    fn other(e: impl std::fmt::Display) -> io::Error {
        io::Error::other(e.to_string())
    }

    pub(super) fn port_names() -> io::Result<Vec<String>> {
        let input = MidiInput::new(CLIENT_NAME).map_err(other)?;
        Ok(input
            .ports()
            .iter()
            .filter_map(|p| input.port_name(p).ok())
            .collect())
    }

    /// A host MIDI input/output pair sharing a name.
    pub struct MidirPort {
        name: String,
        _input: MidiInputConnection<()>,
        output: MidiOutputConnection,
        rx: Receiver<Vec<u8>>,
        pending: VecDeque<u8>,
        outgoing: Vec<u8>,
    }

    impl MidirPort {
        /// Connects to the first input and output ports whose names contain `name`.
        pub fn open(name: &str) -> io::Result<Self> {
            let mut input = MidiInput::new(CLIENT_NAME).map_err(other)?;
            input.ignore(Ignore::None);
            let in_port = input
                .ports()
                .into_iter()
                .find(|p| input.port_name(p).is_ok_and(|n| n.contains(name)))
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("No MIDI input matching {}", name)))?;
            let port_name = input.port_name(&in_port).map_err(other)?;

            let output = MidiOutput::new(CLIENT_NAME).map_err(other)?;
            let out_port = output
                .ports()
                .into_iter()
                .find(|p| output.port_name(p).is_ok_and(|n| n.contains(name)))
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("No MIDI output matching {}", name)))?;

            let (tx, rx) = unbounded();
            let input_conn = input
                .connect(
                    &in_port,
                    "sysexfs-in",
                    move |_stamp, bytes, _| {
                        let _ = tx.send(bytes.to_vec());
                    },
                    (),
                )
                .map_err(other)?;
            let output_conn = output.connect(&out_port, "sysexfs-out").map_err(other)?;

            tracing::info!("Connected to MIDI port {}", port_name);

            Ok(MidirPort {
                name: port_name,
                _input: input_conn,
                output: output_conn,
                rx,
                pending: VecDeque::new(),
                outgoing: Vec::new(),
            })
        }
    }

    impl MidiPort for MidirPort {
        fn name(&self) -> &str {
            &self.name
        }

        // midir wants whole messages, so SysEx is held back until its terminator.
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            for &byte in buf {
                self.outgoing.push(byte);
                if byte == EOX {
                    self.output.send(&self.outgoing).map_err(other)?;
                    self.outgoing.clear();
                }
            }
            Ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                match self.rx.try_recv() {
                    Ok(bytes) => self.pending.extend(bytes),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        return Err(io::Error::new(ErrorKind::BrokenPipe, "MIDI input closed"));
                    }
                }
            }
            if self.pending.is_empty() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.pending.len());
            for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }
}

// ============================================================================
// Mock Port for Testing
// ============================================================================

#[cfg(test)]
pub(crate) use mock::{MockHandle, MockPort};
