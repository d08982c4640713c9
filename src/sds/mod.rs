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


//! MIDI Sample Dump Standard: numbered 127-byte packets paced by
//! ACK/NAK/WAIT/CANCEL handshakes.

pub mod receiver;
pub mod sender;

pub use receiver::download;
pub use sender::upload;

use crate::codec::xor_checksum;
use crate::error::{Error, Result};
use crate::protocol::*;

/// Device behaviour that does not follow the standard, switched per device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdsQuirks {
    /// The device never sends the data packet of a one-word sample.
    pub tolerate_missing_single_word_packet: bool,
    /// The device does not acknowledge the last packet of an upload.
    pub tolerate_missing_close_ack: bool,
}

/// A sample with the metadata the dump header carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub bits: u8,
    pub period_ns: u32,
    pub loop_start: u32,
    pub loop_end: u32,
    pub loop_type: u8,
    pub data: Vec<i16>,
}

/// Loop type value meaning "no loop"
pub const LOOP_OFF: u8 = 0x7F;

/// Largest value a three-byte header field can carry
pub const MAX_FIELD: u32 = 0x1F_FFFF;

impl Sample {
    /// 16-bit sample at `rate` Hz without a loop.
    pub fn new(rate: u32, data: Vec<i16>) -> Self {
        let end = (data.len() as u32).saturating_sub(1);
        Sample {
            bits: 16,
            period_ns: 1_000_000_000 / rate.max(1),
            loop_start: end,
            loop_end: end,
            loop_type: LOOP_OFF,
            data,
        }
    }

    pub fn rate(&self) -> u32 {
        1_000_000_000 / self.period_ns.max(1)
    }
}

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHeader {
    pub channel: u8,
    pub sample: u16,
    pub bits: u8,
    pub period_ns: u32,
    pub words: u32,
    pub loop_start: u32,
    pub loop_end: u32,
    pub loop_type: u8,
}

fn get21(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 7 | (bytes[2] as u32) << 14
}

fn put21(out: &mut Vec<u8>, value: u32) {
    out.extend([(value & 0x7F) as u8, (value >> 7 & 0x7F) as u8, (value >> 14 & 0x7F) as u8]);
}

impl DumpHeader {
    pub fn for_sample(channel: u8, number: u16, sample: &Sample) -> Self {
        DumpHeader {
            channel,
            sample: number,
            bits: sample.bits,
            period_ns: sample.period_ns,
            words: sample.data.len() as u32,
            loop_start: sample.loop_start,
            loop_end: sample.loop_end,
            loop_type: sample.loop_type,
        }
    }

    pub fn parse(msg: &[u8]) -> Option<Self> {
        if msg.len() != SDS_HEADER_LEN
            || msg[0] != SOX
            || msg[1] != UNIVERSAL_NON_REALTIME
            || msg[3] != SDS_DUMP_HEADER
            || msg[20] != EOX
        {
            return None;
        }
        Some(DumpHeader {
            channel: msg[2],
            sample: msg[4] as u16 | (msg[5] as u16) << 7,
            bits: msg[6],
            period_ns: get21(&msg[7..10]),
            words: get21(&msg[10..13]),
            loop_start: get21(&msg[13..16]),
            loop_end: get21(&msg[16..19]),
            loop_type: msg[19],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(SDS_HEADER_LEN);
        msg.extend([
            SOX,
            UNIVERSAL_NON_REALTIME,
            self.channel,
            SDS_DUMP_HEADER,
            (self.sample & 0x7F) as u8,
            (self.sample >> 7 & 0x7F) as u8,
            self.bits,
        ]);
        put21(&mut msg, self.period_ns);
        put21(&mut msg, self.words);
        put21(&mut msg, self.loop_start);
        put21(&mut msg, self.loop_end);
        msg.push(self.loop_type);
        msg.push(EOX);
        msg
    }

    pub fn packets(&self) -> Result<usize> {
        packet_count(self.bits, self.words as usize)
    }

    /// Fails if a field would be truncated on the wire.
    pub fn check_fields(&self) -> Result<()> {
        let fields = [
            ("Sample length", self.words),
            ("Sample period", self.period_ns),
            ("Loop start", self.loop_start),
            ("Loop end", self.loop_end),
        ];
        for (name, value) in fields {
            if value > MAX_FIELD {
                return Err(Error::invalid(format!("{} {} does not fit in a dump header", name, value)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Words and packets
// ============================================================================

/// Bytes used per sample word: 8 to 14 bits take two, 15 and 16 take three.
pub fn bytes_per_word(bits: u8) -> Result<usize> {
    match bits {
        8..=16 => Ok((bits as usize).div_ceil(7)),
        _ => Err(Error::invalid(format!("Unsupported sample resolution: {} bits", bits))),
    }
}

pub fn words_per_packet(bits: u8) -> Result<usize> {
    Ok(SDS_PACKET_PAYLOAD / bytes_per_word(bits)?)
}

pub fn packet_count(bits: u8, words: usize) -> Result<usize> {
    Ok(words.div_ceil(words_per_packet(bits)?))
}

/// Decodes `count` left-justified offset-binary words into signed 16-bit samples.
pub fn decode_words(payload: &[u8], bits: u8, count: usize) -> Result<Vec<i16>> {
    let bpw = bytes_per_word(bits)?;
    let shift = 7 * bpw as u32 - bits as u32;

    Ok(payload
        .chunks_exact(bpw)
        .take(count)
        .map(|word| {
            let raw = word.iter().fold(0u32, |acc, &b| acc << 7 | (b & 0x7F) as u32);
            let value = ((raw >> shift) << (16 - bits as u32)) as u16;
            (value ^ 0x8000) as i16
        })
        .collect())
}

/// Inverse of [`decode_words`].
pub fn encode_words(samples: &[i16], bits: u8) -> Result<Vec<u8>> {
    let bpw = bytes_per_word(bits)?;
    let shift = 7 * bpw as u32 - bits as u32;
    let mut out = Vec::with_capacity(samples.len() * bpw);

    for &sample in samples {
        let value = ((sample as u16 ^ 0x8000) >> (16 - bits as u32)) as u32;
        let raw = value << shift;
        for i in (0..bpw).rev() {
            out.push((raw >> (7 * i) & 0x7F) as u8);
        }
    }

    Ok(out)
}

pub fn dump_request(channel: u8, sample: u16) -> Vec<u8> {
    vec![
        SOX,
        UNIVERSAL_NON_REALTIME,
        channel,
        SDS_DUMP_REQUEST,
        (sample & 0x7F) as u8,
        (sample >> 7 & 0x7F) as u8,
        EOX,
    ]
}

/// Which answer a handshake message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Wait,
    Cancel,
    Eof,
}

impl Handshake {
    fn id(self) -> u8 {
        match self {
            Handshake::Ack => SDS_ACK,
            Handshake::Nak => SDS_NAK,
            Handshake::Wait => SDS_WAIT,
            Handshake::Cancel => SDS_CANCEL,
            Handshake::Eof => SDS_EOF,
        }
    }

    pub fn encode(self, channel: u8, packet: u8) -> Vec<u8> {
        vec![SOX, UNIVERSAL_NON_REALTIME, channel, self.id(), packet & 0x7F, EOX]
    }

    /// Returns the handshake and its packet number.
    pub fn parse(msg: &[u8], channel: u8) -> Option<(Handshake, u8)> {
        if msg.len() != SDS_HANDSHAKE_LEN
            || msg[1] != UNIVERSAL_NON_REALTIME
            || msg[2] != channel
        {
            return None;
        }
        let kind = match msg[3] {
            SDS_ACK => Handshake::Ack,
            SDS_NAK => Handshake::Nak,
            SDS_WAIT => Handshake::Wait,
            SDS_CANCEL => Handshake::Cancel,
            SDS_EOF => Handshake::Eof,
            _ => return None,
        };
        Some((kind, msg[4]))
    }
}

pub fn encode_packet(channel: u8, number: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SDS_PACKET_LEN);
    msg.extend([SOX, UNIVERSAL_NON_REALTIME, channel, SDS_DATA_PACKET, number & 0x7F]);
    msg.extend(payload.iter().take(SDS_PACKET_PAYLOAD).map(|&b| b & 0x7F));
    msg.resize(SDS_CHECKSUM_INDEX, 0);
    let checksum = xor_checksum(&msg[1..SDS_CHECKSUM_INDEX]);
    msg.push(checksum);
    msg.push(EOX);
    msg
}

/// Why a data packet was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    NotAPacket,
    Checksum,
}

/// Validates a data packet, returning its number and payload.
pub fn check_packet(msg: &[u8], channel: u8) -> std::result::Result<(u8, &[u8]), PacketError> {
    if msg.len() != SDS_PACKET_LEN
        || msg[1] != UNIVERSAL_NON_REALTIME
        || msg[2] != channel
        || msg[3] != SDS_DATA_PACKET
    {
        return Err(PacketError::NotAPacket);
    }
    if xor_checksum(&msg[1..SDS_CHECKSUM_INDEX]) != msg[SDS_CHECKSUM_INDEX] {
        return Err(PacketError::Checksum);
    }
    Ok((msg[4], &msg[5..SDS_CHECKSUM_INDEX]))
}

// ============================================================================
// Simulated device for tests
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
