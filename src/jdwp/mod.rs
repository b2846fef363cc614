// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Minimal JDWP client.
//!
//! Only the commands the meter needs are implemented: ID size negotiation, class and
//! method lookup, breakpoint requests, resume, top-frame `this` lookup and dispose.
//! All multi-byte values are big-endian.

pub(crate) mod connection;
pub(crate) mod event;
pub(crate) mod packet;

pub(crate) use connection::{Connection, EventStream};
pub(crate) use event::{Event, EventSet};
pub(crate) use packet::{IdSizes, Location};

pub(crate) const HANDSHAKE: &[u8] = b"JDWP-Handshake";

pub(crate) mod command_set {
    pub const VIRTUAL_MACHINE: u8 = 1;
    pub const REFERENCE_TYPE: u8 = 2;
    pub const CLASS_TYPE: u8 = 3;
    pub const METHOD: u8 = 6;
    pub const THREAD_REFERENCE: u8 = 11;
    pub const EVENT_REQUEST: u8 = 15;
    pub const STACK_FRAME: u8 = 16;
    pub const EVENT: u8 = 64;
}

pub(crate) mod command {
    // VirtualMachine
    pub const CLASSES_BY_SIGNATURE: u8 = 2;
    pub const DISPOSE: u8 = 6;
    pub const ID_SIZES: u8 = 7;
    pub const RESUME: u8 = 9;
    // ReferenceType
    pub const METHODS: u8 = 5;
    // ClassType
    pub const SUPERCLASS: u8 = 1;
    // Method
    pub const LINE_TABLE: u8 = 1;
    // ThreadReference
    pub const FRAMES: u8 = 6;
    // EventRequest
    pub const SET: u8 = 1;
    pub const CLEAR: u8 = 2;
    pub const CLEAR_ALL_BREAKPOINTS: u8 = 3;
    // StackFrame
    pub const THIS_OBJECT: u8 = 3;
    // Event
    pub const COMPOSITE: u8 = 100;
}

pub(crate) mod event_kind {
    pub const SINGLE_STEP: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const THREAD_START: u8 = 6;
    pub const THREAD_DEATH: u8 = 7;
    pub const METHOD_ENTRY: u8 = 40;
    pub const METHOD_EXIT: u8 = 41;
    pub const VM_START: u8 = 90;
    pub const VM_DEATH: u8 = 99;
}

pub(crate) mod type_tag {
    pub const CLASS: u8 = 1;
}

pub(crate) mod suspend_policy {
    pub const NONE: u8 = 0;
    pub const EVENT_THREAD: u8 = 1;
}

pub(crate) mod modifier_kind {
    pub const LOCATION_ONLY: u8 = 7;
}

pub(crate) mod error_code {
    pub const INVALID_CLASS: u16 = 21;
    pub const ABSENT_INFORMATION: u16 = 101;
    pub const VM_DEAD: u16 = 112;
    pub const NATIVE_METHOD: u16 = 511;
}
