// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Invocation Ledger
//!
//! Thread-safe counting store for breakpoint hits.
//!
//! # Features
//!
//! - **Composite keys**: counts are keyed by method plus, optionally, the instance the
//!   method was invoked on
//! - **Measurement window**: hits are only recorded while the window is open; the event
//!   reader opens it once breakpoints are armed and `stop()` closes it before disarming
//! - **Snapshots**: [`Results`] is an immutable copy taken after the window closes
//!
//! # Example
//!
//! ```rust
//! use invocount::{InstanceId, InvocationKey, InvocationLedger, MethodKey};
//!
//! let ledger = InvocationLedger::new();
//! let key = InvocationKey::new(MethodKey::new("p.Point", "hashCode()I"), InstanceId::All);
//!
//! assert!(!ledger.increment(key.clone())); // window closed, not counted
//! ledger.open_window();
//! assert!(ledger.increment(key));
//! ledger.close_window();
//!
//! assert_eq!(ledger.snapshot().total(), 1);
//! ```

mod collector;
mod snapshot;

pub use collector::InvocationLedger;
pub use snapshot::{InstanceId, InvocationKey, Results};
