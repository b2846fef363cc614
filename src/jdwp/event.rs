// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;

use super::event_kind;
use super::packet::{IdSizes, Location, PacketReader};
use crate::error::Result;

/// One event from an `Event.Composite` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Breakpoint {
        request_id: i32,
        thread: u64,
        location: Location,
    },
    VmStart {
        thread: u64,
    },
    VmDeath,
    /// Events the meter never requests but whose layout is known.
    Ignored {
        kind: u8,
    },
}

/// A batch of events delivered together under one suspend policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<Event>,
    /// Set when an event of unknown layout stopped decoding; later events are lost.
    pub truncated_at: Option<u8>,
}

impl EventSet {
    pub fn decode(data: Bytes, sizes: IdSizes) -> Result<Self> {
        let mut reader = PacketReader::new(data, sizes);
        let suspend_policy = reader.get_u8("suspend policy")?;
        let count = reader.get_count("event count")?;

        let mut events = Vec::with_capacity(count);
        let mut truncated_at = None;
        for _ in 0..count {
            let kind = reader.get_u8("event kind")?;
            let request_id = reader.get_i32("request id")?;
            let event = match kind {
                event_kind::BREAKPOINT => Event::Breakpoint {
                    request_id,
                    thread: reader.get_object_id("thread")?,
                    location: reader.get_location()?,
                },
                event_kind::VM_START => Event::VmStart {
                    thread: reader.get_object_id("thread")?,
                },
                event_kind::VM_DEATH => Event::VmDeath,
                event_kind::SINGLE_STEP | event_kind::METHOD_ENTRY | event_kind::METHOD_EXIT => {
                    reader.get_object_id("thread")?;
                    reader.get_location()?;
                    Event::Ignored { kind }
                }
                event_kind::THREAD_START | event_kind::THREAD_DEATH => {
                    reader.get_object_id("thread")?;
                    Event::Ignored { kind }
                }
                _ => {
                    truncated_at = Some(kind);
                    break;
                }
            };
            events.push(event);
        }

        Ok(Self {
            suspend_policy,
            events,
            truncated_at,
        })
    }
}
