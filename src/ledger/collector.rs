// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{InvocationKey, Results};

/// Per-meter invocation counts.
///
/// Written by the event reader's single worker task, read by the caller after `stop()`.
/// The map sits behind a mutex so additional writers stay safe; the window flag and the
/// running total are atomics so the hot path checks the window without locking.
#[derive(Debug, Default)]
pub struct InvocationLedger {
    counts: Mutex<HashMap<InvocationKey, u64>>,
    total: AtomicU64,
    window_open: AtomicBool,
}

impl InvocationLedger {
    /// Creates an empty ledger with a closed window.
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<InvocationKey, u64>> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records one invocation. Returns `false` if the window is closed and nothing was
    /// counted.
    pub fn increment(&self, key: InvocationKey) -> bool {
        let mut counts = self.counts();
        // checked under the lock so close_window() orders against in-flight increments
        if !self.window_open.load(Ordering::Acquire) {
            return false;
        }
        *counts.entry(key).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Starts accepting increments.
    pub fn open_window(&self) {
        let _counts = self.counts();
        self.window_open.store(true, Ordering::Release);
    }

    /// Stops accepting increments. Once this returns no further hit is counted.
    pub fn close_window(&self) {
        let _counts = self.counts();
        self.window_open.store(false, Ordering::Release);
    }

    pub fn is_window_open(&self) -> bool {
        self.window_open.load(Ordering::Acquire)
    }

    /// Resets every count. Used at the start of each warm-up or measured pass.
    pub fn clear(&self) {
        let mut counts = self.counts();
        counts.clear();
        self.total.store(0, Ordering::Relaxed);
    }

    /// Sum of all counts.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Creates an immutable copy of the current counts.
    pub fn snapshot(&self) -> Results {
        Results::from_counts(self.counts().iter().map(|(k, v)| (k.clone(), *v)))
    }
}
