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


//! Cancellation and progress shared between a transfer worker and its caller.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Progress {
    parts: u32,
    part: u32,
    fraction: f64,
}

struct Inner {
    active: Mutex<bool>,
    cancelled: Condvar,
    progress: Mutex<Progress>,
    callback: Option<ProgressFn>,
}

/// Handle shared by the thread running a transfer and whoever watches it.
///
/// Clearing `active` asks the worker to stop; every blocking wait in the
/// protocol code wakes up on it within one poll slice. Progress is
/// weighted across `parts`: the callback receives
/// `(part + fraction) / parts`.
#[derive(Clone)]
pub struct JobControl {
    inner: Arc<Inner>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::build(None)
    }
}

impl fmt::Debug for JobControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobControl")
            .field("active", &self.is_active())
            .field("progress", &*self.inner.progress.lock())
            .finish()
    }
}

impl JobControl {
    /// An active job without a progress callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// An active job reporting overall progress to `callback`.
    pub fn with_progress(callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(callback)))
    }

    fn build(callback: Option<ProgressFn>) -> Self {
        JobControl {
            inner: Arc::new(Inner {
                active: Mutex::new(true),
                cancelled: Condvar::new(),
                progress: Mutex::new(Progress { parts: 1, part: 0, fraction: 0.0 }),
                callback,
            }),
        }
    }

    pub fn set_active(&self, active: bool) {
        *self.inner.active.lock() = active;
        if !active {
            self.inner.cancelled.notify_all();
        }
    }

    pub fn cancel(&self) {
        self.set_active(false);
    }

    pub fn is_active(&self) -> bool {
        *self.inner.active.lock()
    }

    /// Sleeps for up to `slice`, waking early on cancellation.
    /// Returns whether the job is still active.
    pub fn wait(&self, slice: Duration) -> bool {
        let mut active = self.inner.active.lock();
        if *active {
            self.inner.cancelled.wait_for(&mut active, slice);
        }
        *active
    }

    /// Splits the job into `parts` equally weighted steps.
    pub fn set_parts(&self, parts: u32) {
        let mut progress = self.inner.progress.lock();
        progress.parts = parts.max(1);
        progress.part = 0;
        progress.fraction = 0.0;
    }

    /// Moves on to the next part, resetting the local fraction.
    pub fn next_part(&self) {
        let mut progress = self.inner.progress.lock();
        if progress.part + 1 < progress.parts {
            progress.part += 1;
            progress.fraction = 0.0;
        }
    }

    pub fn parts(&self) -> u32 {
        self.inner.progress.lock().parts
    }

    pub fn part(&self) -> u32 {
        self.inner.progress.lock().part
    }

    /// Reports how far the current part has got, clamped to [0, 1].
    pub fn set_progress(&self, fraction: f64) {
        let overall = {
            let mut progress = self.inner.progress.lock();
            progress.fraction = fraction.clamp(0.0, 1.0);
            (progress.part as f64 + progress.fraction) / progress.parts as f64
        };
        if let Some(callback) = &self.inner.callback {
            callback(overall);
        }
    }

    /// Overall progress across all parts.
    pub fn progress(&self) -> f64 {
        let progress = self.inner.progress.lock();
        (progress.part as f64 + progress.fraction) / progress.parts as f64
    }
}
