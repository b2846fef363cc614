// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Event reader: the worker that owns the target's event stream.
//!
//! # Lifecycle
//!
//! ```text
//!  STOPPED ──start()──▶ STARTING ──armed──▶ RUNNING ──stop()──▶ STOPPED
//!     ▲                    │                   │
//!     └──stop() raced──────┘                   └──no event in time──▶ TIMED_OUT
//! ```
//!
//! [`EventReader::start`] spawns one worker task and waits for its ready token. The
//! worker arms every breakpoint, opens the ledger window and only then replies, so the
//! caller's measurement never begins before instrumentation is live.
//!
//! While running, the worker takes one composite event batch at a time, counts
//! breakpoint hits, and resumes the target after each batch so that suspended threads
//! keep making progress.
//!
//! [`EventReader::stop`] closes the ledger window first, then interrupts the worker and
//! joins it; the worker disarms its breakpoints and resumes the target before exiting.
//! Disconnects, target death and event timeouts end the worker on its own and are
//! reported as a [`ReaderOutcome`] rather than as errors.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, error, info, trace, warn};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::{JoinError, JoinHandle};

use crate::attach::{BreakpointHandle, Session};
use crate::error::{Error, Result};
use crate::jdwp::{suspend_policy, Event, EventSet, EventStream};
use crate::ledger::{InstanceId, InvocationKey, InvocationLedger};
use crate::signature::MethodKey;

/// State of an [`EventReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Stopped,
    Starting,
    Running,
    TimedOut,
}

impl ReaderState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ReaderState) -> bool {
        use ReaderState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (TimedOut, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Running, TimedOut)
                | (TimedOut, Stopped)
        )
    }
}

/// How the last run of the worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderOutcome {
    /// Stopped on request with the connection intact.
    Completed,
    /// No event arrived within the configured timeout.
    TimedOut { after: Duration },
    /// The target reported `VM_DEATH`.
    TargetExited,
    /// The connection dropped mid-measurement.
    Disconnected { details: String },
    /// The worker failed before or while arming, or panicked.
    Failed { details: String },
}

impl ReaderOutcome {
    /// `true` only for a measurement that ran to `stop()` undisturbed.
    pub fn is_complete(&self) -> bool {
        matches!(self, ReaderOutcome::Completed)
    }
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Give up with `TIMED_OUT` after this long without an event.
    pub event_timeout: Option<Duration>,
    /// Resolve the receiving instance of each hit.
    pub per_instance: bool,
    /// Upper bound on waiting for the worker to arm, and for it to exit after `stop()`.
    pub handshake_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            event_timeout: None,
            per_instance: false,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

// Every state change goes through one mutex so illegal transitions are rejected.
#[derive(Debug)]
struct StateCell(Mutex<ReaderState>);

impl StateCell {
    fn new() -> Self {
        Self(Mutex::new(ReaderState::Stopped))
    }

    fn get(&self) -> ReaderState {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, next: ReaderState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.can_transition_to(next) {
            trace!("Event reader {:?} -> {:?}", *state, next);
            *state = next;
            true
        } else {
            false
        }
    }
}

struct Worker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<WorkerExit>,
}

struct WorkerExit {
    breakpoints: Vec<BreakpointHandle>,
    events: EventStream,
    outcome: ReaderOutcome,
}

/// Consumes the target's events for one meter.
pub struct EventReader {
    session: Session,
    ledger: Arc<InvocationLedger>,
    options: ReaderOptions,
    state: Arc<StateCell>,
    breakpoints: Vec<BreakpointHandle>,
    worker: Option<Worker>,
    outcome: Option<ReaderOutcome>,
}

impl std::fmt::Debug for EventReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader")
            .field("state", &self.state())
            .field("breakpoints", &self.breakpoints.len())
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl EventReader {
    pub fn new(
        session: Session,
        breakpoints: Vec<BreakpointHandle>,
        ledger: Arc<InvocationLedger>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            session,
            ledger,
            options,
            state: Arc::new(StateCell::new()),
            breakpoints,
            worker: None,
            outcome: None,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state.get()
    }

    /// `true` from `start()` until the worker has been joined by `stop()`.
    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    /// Outcome of the last completed run.
    pub fn outcome(&self) -> Option<&ReaderOutcome> {
        self.outcome.as_ref()
    }

    /// Breakpoints currently held by the reader. Empty while the worker owns them.
    pub fn breakpoints(&self) -> &[BreakpointHandle] {
        &self.breakpoints
    }

    /// Spawns the worker and waits until every breakpoint is armed.
    ///
    /// Allowed from `STOPPED` and from `TIMED_OUT`.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(worker) = &self.worker {
            // a timed-out worker has already released everything and is exiting
            if self.state() != ReaderState::TimedOut && !worker.handle.is_finished() {
                return Err(Error::invalid_state("event reader already started"));
            }
            self.join_worker().await;
        }
        let from = self.state();
        if !self.state.transition(ReaderState::Starting) {
            return Err(Error::invalid_state(format!(
                "event reader cannot start from {from:?}"
            )));
        }
        let Some(events) = self.session.take_events() else {
            self.state.transition(ReaderState::Stopped);
            return Err(Error::invalid_state(
                "event stream is owned by another reader",
            ));
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = WorkerTask {
            session: self.session.clone(),
            ledger: self.ledger.clone(),
            state: self.state.clone(),
            options: self.options.clone(),
            breakpoints: std::mem::take(&mut self.breakpoints),
            routes: HashMap::new(),
            events,
        };
        self.outcome = None;
        self.worker = Some(Worker {
            stop: stop_tx,
            handle: tokio::spawn(task.run(ready_tx, stop_rx)),
        });

        let handshake_timeout = self.options.handshake_timeout;
        match tokio::time::timeout(handshake_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!("Event reader running on {}", self.session.address());
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                self.join_worker().await;
                Err(e)
            }
            Ok(Err(_)) => {
                let outcome = self.join_worker().await;
                Err(Error::invalid_state(format!(
                    "event reader exited before arming: {outcome:?}"
                )))
            }
            Err(_) => {
                // the worker is stuck on a command; the deadline is already spent
                warn!(
                    "Breakpoints not armed within {handshake_timeout:?}; aborting the event reader"
                );
                self.ledger.close_window();
                if let Some(worker) = self.worker.take() {
                    worker.handle.abort();
                    let joined = worker.handle.await;
                    self.settle(joined);
                }
                self.state.transition(ReaderState::Stopped);
                Err(Error::Timeout {
                    operation: "arming breakpoints".to_string(),
                    timeout: handshake_timeout,
                })
            }
        }
    }

    /// Stops counting, disarms every breakpoint and joins the worker.
    ///
    /// Succeeds even if the worker is blocked waiting for an event, and also when the
    /// worker already ended on its own. A worker stuck on an unanswered command is
    /// aborted after the handshake timeout; its breakpoints are then left to
    /// [`Session::delete_all_breakpoints`].
    pub async fn stop(&mut self) -> Result<ReaderOutcome> {
        self.ledger.close_window();

        let outcome = match self.worker.take() {
            Some(worker) => {
                // the worker may already be gone after a timeout or disconnect
                let _ = worker.stop.send(());
                self.finish(worker.handle).await
            }
            None => self.outcome.clone().unwrap_or(ReaderOutcome::Completed),
        };

        if self.state() == ReaderState::TimedOut {
            self.state.transition(ReaderState::Stopped);
        }
        Ok(outcome)
    }

    async fn join_worker(&mut self) -> ReaderOutcome {
        match self.worker.take() {
            Some(worker) => self.finish(worker.handle).await,
            None => self.outcome.clone().unwrap_or(ReaderOutcome::Completed),
        }
    }

    async fn finish(&mut self, mut handle: JoinHandle<WorkerExit>) -> ReaderOutcome {
        let timeout = self.options.handshake_timeout;
        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // stuck on a command the target never answers
                warn!("Event reader did not exit within {timeout:?}; aborting it");
                handle.abort();
                handle.await
            }
        };
        self.settle(joined)
    }

    fn settle(&mut self, joined: std::result::Result<WorkerExit, JoinError>) -> ReaderOutcome {
        let outcome = match joined {
            Ok(exit) => {
                self.breakpoints = exit.breakpoints;
                self.session.return_events(exit.events);
                exit.outcome
            }
            Err(e) => {
                error!("Event reader task was lost: {e}");
                self.state.transition(ReaderState::Stopped);
                ReaderOutcome::Failed {
                    details: e.to_string(),
                }
            }
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

struct WorkerTask {
    session: Session,
    ledger: Arc<InvocationLedger>,
    state: Arc<StateCell>,
    options: ReaderOptions,
    breakpoints: Vec<BreakpointHandle>,
    routes: HashMap<i32, MethodKey>,
    events: EventStream,
}

impl WorkerTask {
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "event_reader", skip_all))]
    async fn run(
        mut self,
        ready: oneshot::Sender<Result<()>>,
        mut stop: oneshot::Receiver<()>,
    ) -> WorkerExit {
        let lifecycle = AssertUnwindSafe(self.lifecycle(ready, &mut stop));
        let outcome = match lifecycle.catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let details = panic_message(panic);
                error!("Event reader panicked: {details}");
                self.ledger.close_window();
                self.state.transition(ReaderState::Stopped);
                ReaderOutcome::Failed { details }
            }
        };
        debug!("Event reader exited: {outcome:?}");
        WorkerExit {
            breakpoints: self.breakpoints,
            events: self.events,
            outcome,
        }
    }

    async fn lifecycle(
        &mut self,
        ready: oneshot::Sender<Result<()>>,
        stop: &mut oneshot::Receiver<()>,
    ) -> ReaderOutcome {
        if stop_requested(stop) {
            debug!("Stop raced ahead of the event reader; nothing armed");
            self.state.transition(ReaderState::Stopped);
            return ReaderOutcome::Completed;
        }

        if let Err(e) = self.arm_all().await {
            warn!("Arming breakpoints failed: {e}");
            let details = e.to_string();
            self.disarm_all().await;
            self.state.transition(ReaderState::Stopped);
            let _ = ready.send(Err(e));
            return ReaderOutcome::Failed { details };
        }

        self.ledger.open_window();
        if !self.state.transition(ReaderState::Running) || ready.send(Ok(())).is_err() {
            debug!("Caller abandoned start(); disarming");
            return self.shutdown().await;
        }
        info!(
            "Armed {} breakpoint(s) in {}",
            self.routes.len(),
            self.session.address()
        );

        self.event_loop(stop).await
    }

    async fn event_loop(&mut self, stop: &mut oneshot::Receiver<()>) -> ReaderOutcome {
        loop {
            tokio::select! {
                biased;

                _ = &mut *stop => {
                    debug!("Event reader received stop");
                    return self.shutdown().await;
                }

                batch = next_batch(&mut self.events, self.options.event_timeout) => {
                    match batch {
                        Ok(Some(data)) => {
                            if let Some(outcome) = self.handle_batch(data).await {
                                return outcome;
                            }
                        }
                        Ok(None) => {
                            return self.disconnected("event stream closed".to_string()).await;
                        }
                        Err(timeout) => {
                            return self.timed_out(timeout).await;
                        }
                    }
                }
            }
        }
    }

    // Returns an outcome when the batch ends the measurement.
    async fn handle_batch(&mut self, data: Bytes) -> Option<ReaderOutcome> {
        let set = match EventSet::decode(data, self.session.id_sizes()) {
            Ok(set) => set,
            Err(e) => {
                warn!("Discarding undecodable event batch: {e}");
                return self.resume_after_batch().await;
            }
        };
        if let Some(kind) = set.truncated_at {
            warn!("Event batch truncated at unknown event kind {kind}");
        }

        let mut target_exited = false;
        for event in &set.events {
            match event {
                Event::Breakpoint {
                    request_id,
                    thread,
                    location,
                } => {
                    trace!("Breakpoint {request_id} hit on thread {thread:#x} at {location:?}");
                    if let Err(e) = self.record_hit(*request_id, *thread).await {
                        return Some(self.disconnected(e.to_string()).await);
                    }
                }
                Event::VmStart { thread } => debug!("Target started (main thread {thread:#x})"),
                Event::VmDeath => target_exited = true,
                Event::Ignored { kind } => trace!("Ignoring event kind {kind}"),
            }
        }

        if target_exited {
            info!("Target {} exited during measurement", self.session.address());
            self.forget_breakpoints();
            self.state.transition(ReaderState::Stopped);
            return Some(ReaderOutcome::TargetExited);
        }

        if set.suspend_policy == suspend_policy::NONE {
            return None;
        }
        self.resume_after_batch().await
    }

    async fn resume_after_batch(&mut self) -> Option<ReaderOutcome> {
        match self.session.resume().await {
            Ok(()) => None,
            Err(e) if e.is_disconnect() => Some(self.disconnected(e.to_string()).await),
            Err(e) => {
                warn!("Resuming target failed: {e}");
                None
            }
        }
    }

    // Errors only for disconnects; anything else degrades to an uncounted instance.
    async fn record_hit(&mut self, request_id: i32, thread: u64) -> Result<()> {
        let Some(method) = self.routes.get(&request_id).cloned() else {
            trace!("Hit for request {request_id} that this reader did not arm");
            return Ok(());
        };

        let instance = if self.options.per_instance {
            match self.session.this_object(thread).await {
                Ok(instance) => instance,
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => {
                    debug!("Could not resolve receiver of {method}: {e}");
                    InstanceId::All
                }
            }
        } else {
            InstanceId::All
        };

        if !self.ledger.increment(InvocationKey::new(method, instance)) {
            trace!("Hit for request {request_id} arrived after the window closed");
        }
        Ok(())
    }

    async fn arm_all(&mut self) -> Result<()> {
        for breakpoint in &mut self.breakpoints {
            self.session.arm(breakpoint).await?;
            if let Some(request_id) = breakpoint.request_id() {
                self.routes
                    .insert(request_id, breakpoint.method().key().clone());
            }
        }
        Ok(())
    }

    async fn disarm_all(&mut self) {
        for breakpoint in &mut self.breakpoints {
            match self.session.disarm(breakpoint).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    trace!("Target gone while disarming {}: {e}", breakpoint.method().key())
                }
                Err(e) => warn!("Disarming {} failed: {e}", breakpoint.method().key()),
            }
        }
        self.routes.clear();
    }

    // Target is gone: drop the request ids without waiting on the wire.
    fn forget_breakpoints(&mut self) {
        self.ledger.close_window();
        for breakpoint in &mut self.breakpoints {
            breakpoint.forget();
        }
        self.routes.clear();
    }

    async fn shutdown(&mut self) -> ReaderOutcome {
        self.ledger.close_window();
        self.disarm_all().await;
        if let Err(e) = self.session.resume().await {
            debug!("Resume during shutdown failed: {e}");
        }
        self.state.transition(ReaderState::Stopped);
        ReaderOutcome::Completed
    }

    async fn timed_out(&mut self, after: Duration) -> ReaderOutcome {
        warn!(
            "No event from {} within {after:?}; releasing the target",
            self.session.address()
        );
        self.ledger.close_window();
        self.disarm_all().await;
        if let Err(e) = self.session.resume().await {
            debug!("Resume after timeout failed: {e}");
        }
        self.state.transition(ReaderState::TimedOut);
        ReaderOutcome::TimedOut { after }
    }

    async fn disconnected(&mut self, details: String) -> ReaderOutcome {
        info!(
            "Lost connection to {} during measurement: {details}",
            self.session.address()
        );
        self.forget_breakpoints();
        self.state.transition(ReaderState::Stopped);
        ReaderOutcome::Disconnected { details }
    }
}

async fn next_batch(
    events: &mut EventStream,
    timeout: Option<Duration>,
) -> std::result::Result<Option<Bytes>, Duration> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, events.recv())
            .await
            .map_err(|_| timeout),
        None => Ok(events.recv().await),
    }
}

fn stop_requested(stop: &mut oneshot::Receiver<()>) -> bool {
    matches!(stop.try_recv(), Ok(()) | Err(TryRecvError::Closed))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}
