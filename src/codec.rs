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


//! SysEx framing: 7-bit packing, checksums and message splitting.

use crate::protocol::{EOX, REALTIME_MIN, SOX};

// ============================================================================
// 7-bit packing
// ============================================================================

/// Packs dense 8-bit data into 7-bit clean bytes.
///
/// Every group of up to seven input bytes is preceded by a byte holding
/// their high bits: bit 6 belongs to the first byte of the group, bit 0 to
/// the seventh.
pub fn pack7(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len().div_ceil(7));

    for chunk in data.chunks(7) {
        let mut msbs = 0u8;
        for (i, &byte) in chunk.iter().enumerate() {
            msbs |= (byte >> 7) << (6 - i);
        }
        out.push(msbs);
        out.extend(chunk.iter().map(|&b| b & 0x7F));
    }

    out
}

/// Inverse of [`pack7`]. Restores bit 7 of each byte from its group header.
pub fn unpack7(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() - data.len().div_ceil(8));

    for group in data.chunks(8) {
        let msbs = group[0];
        for (i, &byte) in group[1..].iter().enumerate() {
            let msb = (msbs >> (6 - i)) & 0x01;
            out.push((byte & 0x7F) | (msb << 7));
        }
    }

    out
}

// ============================================================================
// Checksums
// ============================================================================

/// XOR of every byte in `window`, masked to 7 bits.
pub fn xor_checksum(window: &[u8]) -> u8 {
    window.iter().fold(0u8, |acc, &b| acc ^ b) & 0x7F
}

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Standard CRC-32 (reflected 0x04C11DB7, initial value 0xFFFFFFFF, final XOR).
pub fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFF_FFFFu32, |crc, &b| {
        CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}

// ============================================================================
// Framing
// ============================================================================

/// Wraps `payload` as `F0 <header> <pack7(payload)> F7`.
pub fn frame(header: &[u8], payload: &[u8]) -> Vec<u8> {
    let packed = pack7(payload);
    let mut msg = Vec::with_capacity(header.len() + packed.len() + 2);
    msg.push(SOX);
    msg.extend_from_slice(header);
    msg.extend_from_slice(&packed);
    msg.push(EOX);
    msg
}

/// Undoes [`frame`]. Returns `None` when `msg` is not a complete message
/// starting with `header`.
pub fn unframe(header: &[u8], msg: &[u8]) -> Option<Vec<u8>> {
    let body = msg.strip_prefix(&[SOX])?.strip_suffix(&[EOX])?;
    let packed = body.strip_prefix(header)?;
    if packed.iter().any(|&b| b & 0x80 != 0) {
        return None;
    }
    Some(unpack7(packed))
}

// ============================================================================
// Stream scanning
// ============================================================================

/// Splits a raw MIDI byte stream into SysEx messages.
///
/// Realtime bytes are dropped on the way in. Bytes outside of a message are
/// discarded, and a message interrupted by a new `F0` is thrown away.
/// Anything past the last terminator stays buffered for the next call.
/// An unterminated message longer than the limit is dropped.
#[derive(Debug)]
pub struct SysexScanner {
    buf: Vec<u8>,
    limit: usize,
}

/// Default cap on a single buffered message
pub const MAX_MESSAGE: usize = 4 * 1024 * 1024;

impl Default for SysexScanner {
    fn default() -> Self {
        Self::with_limit(MAX_MESSAGE)
    }
}

impl SysexScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        SysexScanner { buf: Vec::new(), limit }
    }

    /// Appends raw bytes, filtering out realtime status bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf
            .extend(bytes.iter().copied().filter(|&b| b < REALTIME_MIN));
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Takes the next complete message, `F0` through `F7` inclusive.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(start) = self.buf.iter().position(|&b| b == SOX) else {
                self.buf.clear();
                return None;
            };
            self.buf.drain(..start);

            let end = self.buf[1..]
                .iter()
                .position(|&b| b == EOX || b == SOX)
                .map(|p| p + 1);

            match end {
                Some(i) if self.buf[i] == EOX => {
                    return Some(self.buf.drain(..=i).collect());
                }
                Some(i) => {
                    tracing::trace!("Dropping {} bytes of truncated SysEx", i);
                    self.buf.drain(..i);
                }
                None => {
                    if self.buf.len() > self.limit {
                        tracing::warn!(
                            "Dropping {} bytes of unterminated SysEx (limit {})",
                            self.buf.len(),
                            self.limit
                        );
                        self.buf.clear();
                    }
                    return None;
                }
            }
        }
    }

    /// Takes every complete message currently buffered, concatenated.
    pub fn take_all(&mut self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(msg) = self.next_message() {
            out.extend_from_slice(&msg);
        }
        if out.is_empty() { None } else { Some(out) }
    }
}

// ============================================================================
// Tests
// ============================================================================
