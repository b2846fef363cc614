//! # invocount: Invocation-count instrumentation for running JVMs
//!
//! `invocount` attaches to a separate, already-running Java process through the Java
//! Debug Wire Protocol (JDWP), places breakpoints on a chosen set of methods and
//! constructors, and counts how often each one is entered during a measurement window.
//! The target is neither modified nor recompiled; it only has to be started with a debug
//! agent listening on a socket, e.g.
//! `-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=5005`.
//!
//! ## Features
//!
//! - **Exact windows**: `start()` returns only once every breakpoint is armed, and `stop()`
//!   closes the counting window before disarming, so nothing outside the window counts.
//! - **Non-intrusive**: breakpoints suspend only the triggering thread, and the target is
//!   resumed after every event batch.
//! - **Overload-safe**: methods are matched by their encoded signature, see [`signature`].
//! - **Per-instance detail**: optionally split counts by receiving object.
//! - **Graceful degradation**: a target that exits, disconnects or goes silent yields a
//!   [`Sample`] flagged as degraded or timed out instead of an error.
//!
//! ## Core Concepts
//!
//! - **[`MethodDescriptor`]**: what to instrument, built in code or parsed from
//!   `"java.util.HashMap#put(java.lang.Object, java.lang.Object) java.lang.Object"`.
//! - **[`InvocationCountMeter`]**: the [`Meter`] driving attach, arming and counting.
//! - **[`Session`]**: an open JDWP connection resolving methods and creating breakpoints.
//! - **[`EventReader`]**: the worker task consuming the target's events.
//! - **[`InvocationLedger`]**: the thread-safe counting store behind every [`Sample`].
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use invocount::{InvocationCountMeter, Meter, MeterConfig, MethodDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // INVOCATION_METER_PORT=5005 (and optionally _HOST, _VERBOSE, ...)
//!     let config = MeterConfig::from_env()?.with_per_instance(true);
//!     let methods: Vec<MethodDescriptor> = vec![
//!         "p.Point#hashCode() int".parse()?,
//!         "p.Point#equals(java.lang.Object) boolean".parse()?,
//!     ];
//!
//!     let mut meter = InvocationCountMeter::new(config, methods)?;
//!     meter.start().await?;
//!     // ... let the target do the work being measured ...
//!     meter.stop().await?;
//!
//!     let sample = meter.sample()?;
//!     println!("{} invocations ({:?})", sample.total(), sample.status());
//!     meter.dispose().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade. Enable the `tracing` feature to add
//! `tracing` spans around attaching and the event reader's worker task.

mod attach;
mod config;
mod error;
mod jdwp;
mod ledger;
mod meter;
mod reader;
pub mod signature;

pub use attach::{BreakpointHandle, Session, TargetMethodRef};
pub use config::{MeterConfig, DEFAULT_ATTACH_TIMEOUT_MS, DEFAULT_HOST, ENV_PREFIX};
pub use error::{Error, Result};
pub use ledger::{InstanceId, InvocationKey, InvocationLedger, Results};
pub use meter::{InvocationCountMeter, Meter, Sample, SampleStatus};
pub use reader::{EventReader, ReaderOptions, ReaderOutcome, ReaderState};
pub use signature::{encode, EncodedSignature, MethodDescriptor, MethodKey, TypeDescriptor};
