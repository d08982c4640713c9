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


use std::time::Duration;

use crate::codec::MAX_MESSAGE;

/// Timing and retry knobs for one session.
///
/// The SDS values are tuned against real hardware rather than taken from
/// any standard.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reply deadline for control requests
    pub timeout: Duration,
    /// Receive polling slice, also the cancellation latency
    pub poll_interval: Duration,
    /// Idle gap that ends a batch receive
    pub batch_idle: Duration,
    /// Largest single write handed to the port
    pub write_chunk: usize,
    /// Header handshake window before an upload falls back to open loop
    pub sds_header_timeout: Duration,
    /// Escalated timeout after the device answers WAIT
    pub sds_wait_timeout: Duration,
    /// Per-packet wait for data or an acknowledgement
    pub sds_packet_timeout: Duration,
    /// Packet spacing when the device never acknowledges
    pub sds_open_loop_delay: Duration,
    /// NAK/timeout retries per packet
    pub sds_retries: u32,
    /// Largest message the receive buffer holds before giving up on it
    pub max_message: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            batch_idle: Duration::from_secs(1),
            write_chunk: 256,
            sds_header_timeout: Duration::from_secs(2),
            sds_wait_timeout: Duration::from_secs(10),
            sds_packet_timeout: Duration::from_secs(1),
            sds_open_loop_delay: Duration::from_millis(20),
            sds_retries: 5,
            max_message: MAX_MESSAGE,
        }
    }
}

impl Config {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Config {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(2),
            batch_idle: Duration::from_millis(30),
            write_chunk: 16,
            sds_header_timeout: Duration::from_millis(60),
            sds_wait_timeout: Duration::from_millis(200),
            sds_packet_timeout: Duration::from_millis(60),
            sds_open_loop_delay: Duration::from_millis(1),
            sds_retries: 5,
            max_message: MAX_MESSAGE,
        }
    }
}
