// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! The invocation-count meter and the generic meter contract it fulfils.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::attach::Session;
use crate::config::MeterConfig;
use crate::error::{Error, Result};
use crate::ledger::{InvocationLedger, Results};
use crate::reader::{EventReader, ReaderOptions, ReaderOutcome, ReaderState};
use crate::signature::{MethodDescriptor, MethodKey};

/// Lifecycle shared by every meter the surrounding harness drives.
///
/// A measurement is `start()`, the measured work, `stop()`, then `sample()`. A meter may
/// run several such passes before it is disposed.
pub trait Meter: Send {
    /// Begins a measured interval. Returns once the meter is live.
    fn start(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Ends the measured interval.
    fn stop(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// The value measured by the last completed `stop()`.
    fn sample(&self) -> Result<Sample>;

    /// Releases every resource held by the meter.
    fn dispose(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Whether a sample can be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleStatus {
    /// The window ran from `start()` to `stop()` with the target attached throughout.
    Valid,
    /// Counting ended early; the total covers only part of the window.
    Degraded { reason: String },
    /// The target went silent for longer than the configured event timeout.
    TimedOut,
}

/// Result of one measured pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    total: u64,
    status: SampleStatus,
    breakdown: Option<Results>,
}

impl Sample {
    /// Sum over every counted method and instance.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn status(&self) -> &SampleStatus {
        &self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status == SampleStatus::Valid
    }

    /// Per-method, per-instance counts. Present only when per-instance counting is on.
    pub fn breakdown(&self) -> Option<&Results> {
        self.breakdown.as_ref()
    }
}

struct ActivePass {
    session: Session,
    reader: EventReader,
}

/// Counts entries into a fixed set of methods of a running target.
///
/// Every `start()` attaches to the target afresh and clears the ledger; every `stop()`
/// disarms and detaches, so passes are independent of each other.
///
/// ```no_run
/// use invocount::{InvocationCountMeter, Meter, MeterConfig, MethodDescriptor};
///
/// # async fn measure() -> invocount::Result<()> {
/// let hash_code: MethodDescriptor = "p.Point#hashCode() int".parse()?;
/// let mut meter = InvocationCountMeter::new(MeterConfig::from_env()?, [hash_code])?;
///
/// meter.start().await?;
/// // drive the target
/// meter.stop().await?;
/// println!("hashCode entered {} times", meter.sample()?.total());
///
/// meter.dispose().await
/// # }
/// ```
pub struct InvocationCountMeter {
    config: MeterConfig,
    descriptors: Vec<MethodDescriptor>,
    ledger: Arc<InvocationLedger>,
    active: Option<ActivePass>,
    last: Option<Sample>,
}

impl std::fmt::Debug for InvocationCountMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationCountMeter")
            .field("target", &format_args!("{}:{}", self.config.host, self.config.port))
            .field("methods", &self.descriptors.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl InvocationCountMeter {
    /// Creates a meter for `descriptors`, dropping duplicates with the same encoded
    /// signature.
    ///
    /// Every descriptor is encoded up front so an unrepresentable type fails here rather
    /// than halfway through attaching.
    pub fn new(
        config: MeterConfig,
        descriptors: impl IntoIterator<Item = MethodDescriptor>,
    ) -> Result<Self> {
        config.validate()?;

        let mut seen = BTreeSet::new();
        let mut unique = Vec::new();
        for descriptor in descriptors {
            if seen.insert(descriptor.key()?) {
                unique.push(descriptor);
            } else {
                debug!("Dropping duplicate descriptor {descriptor}");
            }
        }

        Ok(Self {
            config,
            descriptors: unique,
            ledger: Arc::new(InvocationLedger::new()),
            active: None,
            last: None,
        })
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// The deduplicated descriptors, in the order given.
    pub fn descriptors(&self) -> &[MethodDescriptor] {
        &self.descriptors
    }

    /// Keys the ledger uses for the configured descriptors.
    pub fn method_keys(&self) -> Vec<MethodKey> {
        self.descriptors
            .iter()
            .filter_map(|descriptor| descriptor.key().ok())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// State of the current pass's event reader, if a pass is active.
    pub fn reader_state(&self) -> Option<ReaderState> {
        self.active.as_ref().map(|pass| pass.reader.state())
    }

    /// Attaches, arms a breakpoint on every descriptor and waits until all are live.
    ///
    /// Attach and resolution errors are returned before anything is counted, and the
    /// target is left detached.
    pub async fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(Error::invalid_state("measurement already running"));
        }
        self.last = None;
        self.ledger.close_window();
        self.ledger.clear();

        let session = Session::attach(
            &self.config.host,
            self.config.port,
            self.config.attach_timeout(),
        )
        .await?;

        match self.launch_reader(&session).await {
            Ok(reader) => {
                info!(
                    "Counting {} method(s) in {}",
                    self.descriptors.len(),
                    session.address()
                );
                self.active = Some(ActivePass { session, reader });
                Ok(())
            }
            Err(e) => {
                session.delete_all_breakpoints().await;
                session.detach().await;
                Err(e)
            }
        }
    }

    async fn launch_reader(&self, session: &Session) -> Result<EventReader> {
        let mut locations = HashMap::new();
        let mut breakpoints = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let method = session.resolve_method(descriptor).await?;
            if let Some(first) = locations.get(method.location()) {
                warn!(
                    "{} resolves to the same code as {first}; its hits are counted under {first}",
                    method.key()
                );
                continue;
            }
            locations.insert(*method.location(), method.key().clone());
            breakpoints.push(session.create_breakpoint(method));
        }

        let options = ReaderOptions {
            event_timeout: self.config.event_timeout(),
            per_instance: self.config.per_instance,
            handshake_timeout: self.config.attach_timeout(),
        };
        let mut reader = EventReader::new(session.clone(), breakpoints, self.ledger.clone(), options);
        reader.start().await?;
        Ok(reader)
    }

    /// Stops counting, removes every breakpoint and detaches.
    ///
    /// Disconnects and timeouts during the pass do not fail `stop()`; they show up in the
    /// sample's status instead.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut pass) = self.active.take() else {
            if self.last.is_some() {
                debug!("stop() called twice; keeping the existing sample");
                return Ok(());
            }
            return Err(Error::invalid_state("stop() without a running measurement"));
        };

        let outcome = pass.reader.stop().await;
        pass.session.delete_all_breakpoints().await;
        pass.session.detach().await;
        let outcome = outcome?;

        let results = self.ledger.snapshot();
        let sample = Sample {
            total: results.total(),
            status: status_of(&outcome),
            breakdown: self.config.per_instance.then(|| results.clone()),
        };
        info!("Measurement ended ({outcome:?}): {} invocation(s)", sample.total);

        if self.config.verbose {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = results
                .write_report(&mut stdout)
                .and_then(|()| stdout.flush())
            {
                warn!("Could not write invocation report: {e}");
            }
        }

        self.last = Some(sample);
        Ok(())
    }

    /// The sample of the last completed `stop()`.
    pub fn sample(&self) -> Result<Sample> {
        self.last
            .clone()
            .ok_or_else(|| Error::invalid_state("sample() before stop() completed"))
    }

    /// Releases the attachment. A no-op when no pass is running.
    ///
    /// Disposing a running meter is a caller bug: the pass is stopped and detached, and
    /// [`Error::InvalidState`] is returned.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.active.is_none() {
            return Ok(());
        }
        error!("Meter disposed while its event reader is still running");
        if let Err(e) = self.stop().await {
            warn!("Stopping during dispose failed: {e}");
        }
        Err(Error::invalid_state("meter disposed while running"))
    }
}

impl Drop for InvocationCountMeter {
    fn drop(&mut self) {
        if self.active.is_some() {
            // the reader's worker disarms on its own once its stop channel closes
            warn!("InvocationCountMeter dropped while running; call stop() and dispose()");
        }
    }
}

impl Meter for InvocationCountMeter {
    fn start(&mut self) -> impl Future<Output = Result<()>> + Send {
        InvocationCountMeter::start(self)
    }

    fn stop(&mut self) -> impl Future<Output = Result<()>> + Send {
        InvocationCountMeter::stop(self)
    }

    fn sample(&self) -> Result<Sample> {
        InvocationCountMeter::sample(self)
    }

    fn dispose(&mut self) -> impl Future<Output = Result<()>> + Send {
        InvocationCountMeter::dispose(self)
    }
}

fn status_of(outcome: &ReaderOutcome) -> SampleStatus {
    match outcome {
        ReaderOutcome::Completed => SampleStatus::Valid,
        ReaderOutcome::TimedOut { .. } => SampleStatus::TimedOut,
        ReaderOutcome::TargetExited => SampleStatus::Degraded {
            reason: "target exited during measurement".to_string(),
        },
        ReaderOutcome::Disconnected { details } => SampleStatus::Degraded {
            reason: format!("target disconnected: {details}"),
        },
        ReaderOutcome::Failed { details } => SampleStatus::Degraded {
            reason: format!("event reader failed: {details}"),
        },
    }
}
