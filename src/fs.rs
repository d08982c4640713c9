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


//! Virtual filesystems published by a device.
//!
//! Every dialect exposes its storage as one or more [`Filesystem`]s. Callers
//! only go through this trait and check [`Filesystem::operations`] before
//! offering an action, so they never need to know which dialect is active.

use std::fmt;
use std::ops::BitOr;

use crate::error::{Error, Result};
use crate::job::JobControl;
use crate::session::Session;

/// Set of operations a filesystem implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Operations(u16);

impl Operations {
    pub const NONE: Operations = Operations(0);
    pub const READDIR: Operations = Operations(1 << 0);
    pub const DOWNLOAD: Operations = Operations(1 << 1);
    pub const UPLOAD: Operations = Operations(1 << 2);
    pub const RENAME: Operations = Operations(1 << 3);
    pub const MOVE: Operations = Operations(1 << 4);
    pub const COPY: Operations = Operations(1 << 5);
    pub const DELETE: Operations = Operations(1 << 6);
    pub const CLEAR: Operations = Operations(1 << 7);
    pub const SWAP: Operations = Operations(1 << 8);
    pub const MKDIR: Operations = Operations(1 << 9);

    const NAMES: [(Operations, &'static str); 10] = [
        (Operations::READDIR, "readdir"),
        (Operations::DOWNLOAD, "download"),
        (Operations::UPLOAD, "upload"),
        (Operations::RENAME, "rename"),
        (Operations::MOVE, "move"),
        (Operations::COPY, "copy"),
        (Operations::DELETE, "delete"),
        (Operations::CLEAR, "clear"),
        (Operations::SWAP, "swap"),
        (Operations::MKDIR, "mkdir"),
    ];

    pub fn contains(self, other: Operations) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Operations::NAMES
            .into_iter()
            .filter(move |(op, _)| self.contains(*op))
            .map(|(_, name)| name)
    }
}

impl BitOr for Operations {
    type Output = Operations;

    fn bitor(self, rhs: Operations) -> Operations {
        Operations(self.0 | rhs.0)
    }
}

impl fmt::Display for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.names().collect();
        write!(f, "{}", names.join(","))
    }
}

/// How generic UI code should present a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsOptions {
    /// Items are addressed by slot rather than by name.
    pub slots: bool,
    /// Bank size for slot labels, 0 for plain numbers.
    pub bank_size: u32,
    /// Only one item can be selected per operation.
    pub single_item: bool,
    pub show_size: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Dir,
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: u32,
    pub name: String,
    pub kind: ItemKind,
    pub size: Option<u64>,
    pub slot: Option<String>,
}

impl Item {
    pub fn file(id: u32, name: impl Into<String>, size: Option<u64>) -> Self {
        Item { id, name: name.into(), kind: ItemKind::File, size, slot: None }
    }

    pub fn dir(id: u32, name: impl Into<String>) -> Self {
        Item { id, name: name.into(), kind: ItemKind::Dir, size: None, slot: None }
    }

    pub fn with_slot(mut self, slot: String) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ItemKind::Dir
    }
}

/// Lazy listing of a directory. Dropping it releases whatever it holds.
pub type ItemIter<'a> = Box<dyn Iterator<Item = Result<Item>> + Send + 'a>;

fn unsupported<T>(op: &'static str) -> Result<T> {
    Err(Error::Unsupported(op))
}

/// Capability table of one virtual filesystem.
///
/// Every operation listed in [`Filesystem::operations`] must be implemented.
/// The others keep the default body and fail with [`Error::Unsupported`].
pub trait Filesystem: Send + Sync {
    /// Stable numeric id, also the bit used in device filesystem masks.
    fn id(&self) -> u32;
    fn name(&self) -> &'static str;

    fn icon(&self) -> &'static str {
        "folder"
    }

    fn options(&self) -> FsOptions;
    fn operations(&self) -> Operations;

    /// Longest name the device stores, 0 when items carry no name.
    fn max_name_len(&self) -> usize;

    fn readdir<'a>(&'a self, session: &'a Session, path: &str) -> Result<ItemIter<'a>>;

    fn download(&self, _session: &Session, _path: &str, _job: &JobControl) -> Result<Vec<u8>> {
        unsupported("download")
    }

    fn upload(&self, _session: &Session, _path: &str, _data: &[u8], _job: &JobControl) -> Result<()> {
        unsupported("upload")
    }

    fn rename(&self, _session: &Session, _from: &str, _to: &str) -> Result<()> {
        unsupported("rename")
    }

    fn move_item(&self, _session: &Session, _from: &str, _to: &str) -> Result<()> {
        unsupported("move")
    }

    fn copy(&self, _session: &Session, _from: &str, _to: &str) -> Result<()> {
        unsupported("copy")
    }

    fn delete(&self, _session: &Session, _path: &str) -> Result<()> {
        unsupported("delete")
    }

    fn clear(&self, _session: &Session, _path: &str) -> Result<()> {
        unsupported("clear")
    }

    fn swap(&self, _session: &Session, _a: &str, _b: &str) -> Result<()> {
        unsupported("swap")
    }

    fn mkdir(&self, _session: &Session, _path: &str) -> Result<()> {
        unsupported("mkdir")
    }

    /// Turns a host file name into one the device accepts.
    fn sanitize_name(&self, name: &str) -> String {
        sanitize_ascii(name, self.max_name_len())
    }

    fn supports(&self, op: Operations) -> bool {
        self.operations().contains(op)
    }
}

impl fmt::Debug for dyn Filesystem + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("operations", &self.operations())
            .finish()
    }
}

/// Keeps printable ASCII except `/`, cut to `max_len` characters.
pub fn sanitize_ascii(name: &str, max_len: usize) -> String {
    name.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .filter(|c| *c != '/')
        .take(max_len)
        .collect::<String>()
        .trim()
        .to_string()
}

// ============================================================================
// Paths and slots
// ============================================================================

/// Path components, ignoring empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Splits a path into its parent directory and last component.
pub fn split_parent(path: &str) -> Result<(String, &str)> {
    let mut parts = split_path(path);
    let name = parts.pop().ok_or_else(|| Error::invalid(format!("No file name in '{}'", path)))?;
    Ok((format!("/{}", parts.join("/")), name))
}

pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Label for slot `index` (0-based).
///
/// With `bank_size` 0 the label is the 1-based number padded to three
/// digits (`"007"`). Otherwise it is a bank letter and a two digit position
/// (`"A07"`).
pub fn slot_label(index: u32, bank_size: u32) -> String {
    if bank_size == 0 {
        return format!("{:03}", index + 1);
    }
    let bank = (b'A' + (index / bank_size) as u8) as char;
    format!("{}{:02}", bank, index % bank_size + 1)
}

/// Parses the last component of `path` as a slot and returns its 0-based
/// index. Accepts 1-based numbers (`"7"`, `"007"`) and bank labels (`"A07"`).
pub fn parse_slot(path: &str, bank_size: u32) -> Result<u32> {
    let invalid = || Error::invalid(format!("'{}' is not a slot", path));
    let last = *split_path(path).last().ok_or_else(invalid)?;

    if let Ok(number) = last.parse::<u32>() {
        return number.checked_sub(1).ok_or_else(invalid);
    }

    let mut chars = last.chars();
    let bank = chars.next().filter(|c| c.is_ascii_uppercase()).ok_or_else(invalid)?;
    let position: u32 = chars.as_str().parse().map_err(|_| invalid())?;
    if bank_size == 0 || position == 0 || position > bank_size {
        return Err(invalid());
    }
    Ok((bank as u32 - 'A' as u32) * bank_size + position - 1)
}
