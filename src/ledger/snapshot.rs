// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use crate::signature::MethodKey;

/// The instance a method was invoked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceId {
    /// Instance detail was not requested, or could not be determined.
    All,
    /// Static method: there is no receiver.
    Static,
    /// Object identity in the target process.
    Object(u64),
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceId::All => f.write_str("all instances"),
            InstanceId::Static => f.write_str("static"),
            InstanceId::Object(id) => write!(f, "instance {id:#x}"),
        }
    }
}

/// Ledger key: a method paired with the invoking instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationKey {
    pub method: MethodKey,
    pub instance: InstanceId,
}

impl InvocationKey {
    pub fn new(method: MethodKey, instance: InstanceId) -> Self {
        Self { method, instance }
    }
}

/// Immutable copy of the ledger's counts.
///
/// Iteration is ordered by class, then method, then instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Results {
    counts: BTreeMap<InvocationKey, u64>,
}

impl Results {
    pub(crate) fn from_counts(counts: impl IntoIterator<Item = (InvocationKey, u64)>) -> Self {
        Self {
            counts: counts.into_iter().collect(),
        }
    }

    /// Sum over every key.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Count for one exact key, zero if absent.
    pub fn get(&self, key: &InvocationKey) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Count for a method summed over all instances.
    pub fn method_total(&self, method: &MethodKey) -> u64 {
        self.counts
            .iter()
            .filter(|(key, _)| &key.method == method)
            .map(|(_, count)| count)
            .sum()
    }

    /// Counts per method summed over instances.
    pub fn per_method(&self) -> BTreeMap<MethodKey, u64> {
        let mut per_method = BTreeMap::new();
        for (key, count) in &self.counts {
            *per_method.entry(key.method.clone()).or_insert(0) += count;
        }
        per_method
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InvocationKey, u64)> {
        self.counts.iter().map(|(key, count)| (key, *count))
    }

    /// Writes the per-class, per-method, per-instance dump.
    ///
    /// ```text
    /// p.Point
    ///   hashCode()I: 4
    ///     instance 0x1a: 3
    ///     instance 0x1b: 1
    /// total: 4
    /// ```
    pub fn write_report<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        let per_method = self.per_method();
        let mut current_class: Option<&str> = None;
        for (method, method_total) in &per_method {
            if current_class != Some(method.class()) {
                writeln!(out, "{}", method.class())?;
                current_class = Some(method.class());
            }
            writeln!(out, "  {}: {}", method.member(), method_total)?;
            for (key, count) in self.counts.iter().filter(|(key, _)| &key.method == method) {
                if key.instance != InstanceId::All {
                    writeln!(out, "    {}: {}", key.instance, count)?;
                }
            }
        }
        writeln!(out, "total: {}", self.total())
    }
}
