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


//! MIDI System Exclusive protocol constants

/// Start of a System Exclusive message
pub const SOX: u8 = 0xF0;

/// End of a System Exclusive message
pub const EOX: u8 = 0xF7;

/// Lowest realtime status byte. Everything from here to 0xFF may show up
/// anywhere in the stream, including inside a SysEx message.
pub const REALTIME_MIN: u8 = 0xF8;

/// Universal non-realtime SysEx id
pub const UNIVERSAL_NON_REALTIME: u8 = 0x7E;

/// "All call" device channel
pub const ALL_CALL: u8 = 0x7F;

/// General information sub id
pub const GENERAL_INFO: u8 = 0x06;

/// Identity request (sub id 2 of general information)
pub const IDENTITY_REQUEST: u8 = 0x01;

/// Identity reply (sub id 2 of general information)
pub const IDENTITY_REPLY: u8 = 0x02;

// ============================================================================
// Sample Dump Standard
// ============================================================================

/// Dump header - describes the sample about to be sent
pub const SDS_DUMP_HEADER: u8 = 0x01;

/// Data packet - 120 bytes of packed sample words
pub const SDS_DATA_PACKET: u8 = 0x02;

/// Dump request - asks the device for a sample
pub const SDS_DUMP_REQUEST: u8 = 0x03;

/// End of file - sender has nothing more for this dump
pub const SDS_EOF: u8 = 0x7B;

/// Wait - receiver is busy, keep waiting for the real answer
pub const SDS_WAIT: u8 = 0x7C;

/// Cancel - abort the dump in progress
pub const SDS_CANCEL: u8 = 0x7D;

/// NAK - last packet was bad, send it again
pub const SDS_NAK: u8 = 0x7E;

/// ACK - last packet was good, send the next one
pub const SDS_ACK: u8 = 0x7F;

/// Length of a complete data packet message, F0 through F7
pub const SDS_PACKET_LEN: usize = 127;

/// Length of a complete dump header message, F0 through F7
pub const SDS_HEADER_LEN: usize = 21;

/// Payload bytes carried by one data packet
pub const SDS_PACKET_PAYLOAD: usize = 120;

/// Index of the checksum byte inside a data packet
pub const SDS_CHECKSUM_INDEX: usize = 125;

/// Length of a handshake message (ACK, NAK, WAIT, CANCEL, EOF)
pub const SDS_HANDSHAKE_LEN: usize = 6;
