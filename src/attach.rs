// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Attachment to a running target over JDWP.
//!
//! A [`Session`] owns the connection for its whole lifetime. It resolves
//! [`MethodDescriptor`]s to target methods and creates, arms and disarms breakpoints on
//! them. Breakpoints are created disarmed; arming registers a `BREAKPOINT` event request
//! whose suspend policy stops only the triggering thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::jdwp::{
    command, command_set, error_code, event_kind, modifier_kind, suspend_policy, type_tag,
    Connection, EventStream, IdSizes, Location,
};
use crate::ledger::InstanceId;
use crate::signature::{MethodDescriptor, MethodKey};

/// A method or constructor resolved in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMethodRef {
    key: MethodKey,
    location: Location,
}

impl TargetMethodRef {
    /// The ledger key, named after the class the caller asked for.
    pub fn key(&self) -> &MethodKey {
        &self.key
    }

    pub(crate) fn location(&self) -> &Location {
        &self.location
    }
}

/// A breakpoint on a method entry. Disarmed until the event reader arms it.
#[derive(Debug)]
pub struct BreakpointHandle {
    method: TargetMethodRef,
    request_id: Option<i32>,
}

impl BreakpointHandle {
    pub fn method(&self) -> &TargetMethodRef {
        &self.method
    }

    pub fn is_armed(&self) -> bool {
        self.request_id.is_some()
    }

    /// The JDWP request id while armed.
    pub fn request_id(&self) -> Option<i32> {
        self.request_id
    }

    // Marks the handle disarmed without telling the target.
    pub(crate) fn forget(&mut self) {
        self.request_id = None;
    }
}

struct Inner {
    connection: Connection,
    events: Mutex<Option<EventStream>>,
    detached: AtomicBool,
}

/// An open debug connection to one target process.
///
/// Cloning is cheap; all clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.inner.connection)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Session {
    /// Connects to the debug port at `host:port`.
    ///
    /// Fails with [`Error::Attach`] if the port refuses the connection or the handshake
    /// does not complete within `timeout`.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(timeout)))]
    pub async fn attach(host: &str, port: u16, timeout: Duration) -> Result<Session> {
        let address = format!("{host}:{port}");
        let (connection, events) = Connection::open(&address, timeout).await?;
        info!("Attached to target at {address}");
        Ok(Session {
            inner: Arc::new(Inner {
                connection,
                events: Mutex::new(Some(events)),
                detached: AtomicBool::new(false),
            }),
        })
    }

    pub fn address(&self) -> &str {
        self.inner.connection.address()
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    /// Returns `true` once the connection is gone, whether detached or dropped by the target.
    pub fn is_disconnected(&self) -> bool {
        self.is_detached() || self.inner.connection.is_closed()
    }

    pub(crate) fn id_sizes(&self) -> IdSizes {
        self.inner.connection.sizes()
    }

    /// Resolves a descriptor to a method in the target.
    ///
    /// The class is looked up by signature; the method by name and encoded signature among
    /// the class's declared methods, then up the superclass chain. Interfaces and array
    /// types are searched only for their declared methods.
    pub async fn resolve_method(&self, descriptor: &MethodDescriptor) -> Result<TargetMethodRef> {
        let key = descriptor.key()?;
        let signature = descriptor.signature()?;
        let class_signature = descriptor.class_signature()?;

        let (class_tag, class_id) = self
            .class_by_signature(&class_signature)
            .await?
            .ok_or_else(|| Error::ClassNotFound {
                class: descriptor.owner().to_string(),
            })?;

        let mut current = class_id;
        loop {
            if let Some(method_id) = self
                .find_declared_method(current, descriptor.name(), signature.as_str())
                .await?
            {
                let index = self.entry_index(current, method_id, &key).await?;
                let location = Location {
                    type_tag: class_tag,
                    class_id: current,
                    method_id,
                    index,
                };
                debug!("Resolved {key} at {location:?}");
                return Ok(TargetMethodRef { key, location });
            }
            // constructors are never inherited, interfaces have no superclass chain
            if descriptor.is_constructor() || class_tag != type_tag::CLASS {
                break;
            }
            match self.superclass(current).await {
                Ok(0) => break,
                Ok(parent) => current = parent,
                Err(Error::Protocol {
                    code: error_code::INVALID_CLASS,
                    ..
                }) => break,
                Err(e) => return Err(e),
            }
        }

        Err(Error::MethodNotFound {
            class: descriptor.owner().to_string(),
            method: key.member().to_string(),
        })
    }

    /// Creates a disarmed breakpoint on the entry of `method`.
    pub fn create_breakpoint(&self, method: TargetMethodRef) -> BreakpointHandle {
        BreakpointHandle {
            method,
            request_id: None,
        }
    }

    /// Registers the breakpoint request in the target. Arming twice is a no-op.
    pub(crate) async fn arm(&self, breakpoint: &mut BreakpointHandle) -> Result<()> {
        if breakpoint.is_armed() {
            return Ok(());
        }
        let connection = &self.inner.connection;
        let data = connection
            .writer()
            .put_u8(event_kind::BREAKPOINT)
            .put_u8(suspend_policy::EVENT_THREAD)
            .put_i32(1)
            .put_u8(modifier_kind::LOCATION_ONLY)
            .put_location(breakpoint.method.location())
            .finish();
        let reply = connection
            .command(command_set::EVENT_REQUEST, command::SET, data)
            .await?;
        let request_id = connection.reader(reply).get_i32("request id")?;
        trace!("Armed {} as request {request_id}", breakpoint.method.key());
        breakpoint.request_id = Some(request_id);
        Ok(())
    }

    /// Clears the breakpoint request. The handle is disarmed even if the target is gone.
    pub(crate) async fn disarm(&self, breakpoint: &mut BreakpointHandle) -> Result<()> {
        let Some(request_id) = breakpoint.request_id.take() else {
            return Ok(());
        };
        let connection = &self.inner.connection;
        let data = connection
            .writer()
            .put_u8(event_kind::BREAKPOINT)
            .put_i32(request_id)
            .finish();
        connection
            .command(command_set::EVENT_REQUEST, command::CLEAR, data)
            .await?;
        trace!("Disarmed {} (request {request_id})", breakpoint.method.key());
        Ok(())
    }

    /// Clears every breakpoint request in the target. Best effort: a target that is
    /// already gone has no breakpoints left.
    pub async fn delete_all_breakpoints(&self) {
        if self.is_disconnected() {
            return;
        }
        let result = self
            .inner
            .connection
            .command(
                command_set::EVENT_REQUEST,
                command::CLEAR_ALL_BREAKPOINTS,
                Bytes::new(),
            )
            .await;
        match result {
            Ok(_) => debug!("Cleared all breakpoints in {}", self.address()),
            Err(e) if e.is_disconnect() => {
                debug!("Target {} gone before breakpoints were cleared: {e}", self.address())
            }
            Err(e) => warn!("ClearAllBreakpoints on {} failed: {e}", self.address()),
        }
    }

    /// Resumes every thread of the target.
    pub(crate) async fn resume(&self) -> Result<()> {
        self.inner
            .connection
            .command(command_set::VIRTUAL_MACHINE, command::RESUME, Bytes::new())
            .await
            .map(|_| ())
    }

    /// Identity of `this` in the top frame of a suspended thread.
    pub(crate) async fn this_object(&self, thread: u64) -> Result<InstanceId> {
        let connection = &self.inner.connection;
        let data = connection
            .writer()
            .put_object_id(thread)
            .put_i32(0)
            .put_i32(1)
            .finish();
        let reply = connection
            .command(command_set::THREAD_REFERENCE, command::FRAMES, data)
            .await?;
        let mut reader = connection.reader(reply);
        if reader.get_count("frame count")? == 0 {
            return Err(Error::malformed("suspended thread has no frames"));
        }
        let frame = reader.get_frame_id("frame id")?;

        let data = connection
            .writer()
            .put_object_id(thread)
            .put_frame_id(frame)
            .finish();
        let reply = connection
            .command(command_set::STACK_FRAME, command::THIS_OBJECT, data)
            .await?;
        let mut reader = connection.reader(reply);
        let _tag = reader.get_u8("object tag")?;
        Ok(match reader.get_object_id("this object")? {
            0 => InstanceId::Static,
            id => InstanceId::Object(id),
        })
    }

    /// Takes the event stream for a reader to consume. Only one consumer at a time.
    pub(crate) fn take_events(&self) -> Option<EventStream> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Hands the event stream back after a reader finished with it.
    pub(crate) fn return_events(&self, events: EventStream) {
        *self
            .inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(events);
    }

    /// Disposes of the target's debug state and closes the connection. Idempotent.
    pub async fn detach(&self) {
        if self.inner.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let connection = &self.inner.connection;
        if !connection.is_closed() {
            if let Err(e) = connection
                .command(command_set::VIRTUAL_MACHINE, command::DISPOSE, Bytes::new())
                .await
            {
                debug!("Dispose on {} failed: {e}", connection.address());
            }
        }
        connection.close().await;
        info!("Detached from {}", connection.address());
    }

    async fn class_by_signature(&self, signature: &str) -> Result<Option<(u8, u64)>> {
        let connection = &self.inner.connection;
        let data = connection.writer().put_string(signature).finish();
        let reply = connection
            .command(
                command_set::VIRTUAL_MACHINE,
                command::CLASSES_BY_SIGNATURE,
                data,
            )
            .await?;
        let mut reader = connection.reader(reply);
        let count = reader.get_count("class count")?;
        if count == 0 {
            return Ok(None);
        }
        if count > 1 {
            debug!("{signature} is loaded by {count} class loaders, using the first");
        }
        let tag = reader.get_u8("type tag")?;
        let type_id = reader.get_reference_type_id("type id")?;
        Ok(Some((tag, type_id)))
    }

    async fn find_declared_method(
        &self,
        class_id: u64,
        name: &str,
        signature: &str,
    ) -> Result<Option<u64>> {
        let connection = &self.inner.connection;
        let data = connection.writer().put_reference_type_id(class_id).finish();
        let reply = connection
            .command(command_set::REFERENCE_TYPE, command::METHODS, data)
            .await?;
        let mut reader = connection.reader(reply);
        let count = reader.get_count("method count")?;
        for _ in 0..count {
            let method_id = reader.get_method_id("method id")?;
            let method_name = reader.get_string("method name")?;
            let method_signature = reader.get_string("method signature")?;
            let _modifiers = reader.get_i32("method modifiers")?;
            if method_name == name && method_signature == signature {
                return Ok(Some(method_id));
            }
        }
        Ok(None)
    }

    async fn superclass(&self, class_id: u64) -> Result<u64> {
        let connection = &self.inner.connection;
        let data = connection.writer().put_reference_type_id(class_id).finish();
        let reply = connection
            .command(command_set::CLASS_TYPE, command::SUPERCLASS, data)
            .await?;
        connection.reader(reply).get_reference_type_id("superclass")
    }

    // Lowest code index of the method, i.e. its entry.
    async fn entry_index(&self, class_id: u64, method_id: u64, key: &MethodKey) -> Result<u64> {
        let connection = &self.inner.connection;
        let data = connection
            .writer()
            .put_reference_type_id(class_id)
            .put_method_id(method_id)
            .finish();
        match connection
            .command(command_set::METHOD, command::LINE_TABLE, data)
            .await
        {
            Ok(reply) => {
                let start = connection.reader(reply).get_i64("line table start")?;
                u64::try_from(start).map_err(|_| Error::MethodNotFound {
                    class: key.class().to_string(),
                    method: format!("{} (no code)", key.member()),
                })
            }
            Err(Error::Protocol {
                code: error_code::ABSENT_INFORMATION,
                ..
            }) => Ok(0),
            Err(Error::Protocol {
                code: error_code::NATIVE_METHOD,
                ..
            }) => Err(Error::MethodNotFound {
                class: key.class().to_string(),
                method: format!("{} (native)", key.member()),
            }),
            Err(e) => Err(e),
        }
    }
}
