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


//! Virtual filesystems over MIDI System Exclusive.
//!
//! A [`session::Session`] wraps a raw MIDI port. A [`connector::Connector`]
//! identifies the device behind it and publishes its storage as
//! [`fs::Filesystem`]s, which move data with the Sample Dump Standard
//! ([`sds`]) or open/partial/close jobs ([`chunked`]).

pub mod chunked;
pub mod codec;
pub mod config;
pub mod connector;
pub mod connectors;
pub mod device;
pub mod error;
pub mod fs;
pub mod job;
pub mod protocol;
pub mod sds;
pub mod serial;
pub mod session;
pub mod transfer;

pub use config::Config;
pub use connector::{Connector, Device, autodetect, connect};
pub use error::{Error, Rejection, Result};
pub use fs::{Filesystem, Item, ItemKind, Operations};
pub use job::JobControl;
pub use session::Session;
