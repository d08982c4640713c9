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


//! Table of known devices, keyed by the id they report when probed.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: u8,
    pub name: String,
    /// Bitmask of filesystem ids the device publishes.
    pub filesystems: u32,
    /// Whether the device has user storage (a drive) besides its RAM.
    pub storage: bool,
}

impl DeviceDescriptor {
    pub fn has_filesystem(&self, id: u32) -> bool {
        self.filesystems & id != 0
    }
}

pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, id: u8) -> Option<DeviceDescriptor>;
}

/// In-memory registry.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    entries: Vec<DeviceDescriptor>,
}

impl DeviceTable {
    pub fn new(entries: Vec<DeviceDescriptor>) -> Self {
        DeviceTable { entries }
    }

    /// Reads a table with one device per line:
    /// `<id> <filesystem mask> <storage 0|1> <name...>`.
    /// Blank lines and lines starting with `#` are skipped. Numbers may be
    /// given in hex with a `0x` prefix.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let bad = || Error::invalid(format!("Device table line {}: '{}'", n + 1, line));
            let mut fields = line.splitn(4, char::is_whitespace).filter(|f| !f.is_empty());
            let id = fields.next().and_then(parse_number).ok_or_else(bad)?;
            let filesystems = fields.next().and_then(parse_number).ok_or_else(bad)?;
            let storage = match fields.next() {
                Some("0") => false,
                Some("1") => true,
                _ => return Err(bad()),
            };
            let name = fields.next().map(str::trim).filter(|n| !n.is_empty()).ok_or_else(bad)?;

            entries.push(DeviceDescriptor {
                id: u8::try_from(id).map_err(|_| bad())?,
                name: name.to_string(),
                filesystems,
                storage,
            });
        }

        Ok(DeviceTable { entries })
    }

    pub fn entries(&self) -> &[DeviceDescriptor] {
        &self.entries
    }
}

fn parse_number(field: &str) -> Option<u32> {
    match field.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    }
}

impl DeviceRegistry for DeviceTable {
    fn lookup(&self, id: u8) -> Option<DeviceDescriptor> {
        self.entries.iter().find(|d| d.id == id).cloned()
    }
}
