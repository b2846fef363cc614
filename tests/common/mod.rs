// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! A scripted JDWP target for integration tests.
//!
//! `MockTarget` listens on an ephemeral port and speaks the server side of the handful
//! of JDWP commands the meter issues. Tests "run" target code by calling
//! [`MockTarget::invoke`], which emits a breakpoint event when a matching request is
//! armed and waits until the meter has resumed the suspended thread.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const HANDSHAKE: &[u8] = b"JDWP-Handshake";
const REPLY_FLAG: u8 = 0x80;
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

const ABSENT_INFORMATION: u16 = 101;
const NOT_IMPLEMENTED: u16 = 99;
const NATIVE_METHOD: u16 = 511;
const INVALID_OBJECT: u16 = 20;
const INVALID_THREAD: u16 = 10;
const INVALID_CLASS: u16 = 21;

pub const OBJECT: u64 = 1;
pub const BASE: u64 = 2;
pub const POINT: u64 = 3;
pub const SHAPE: u64 = 4;

pub fn init_test_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// What `Method.LineTable` reports for a method.
#[derive(Debug, Clone, Copy)]
pub enum Lines {
    Code { start: i64 },
    Absent,
    Native,
}

#[derive(Debug, Clone)]
pub struct MockMethod {
    pub id: u64,
    pub name: &'static str,
    pub signature: &'static str,
    pub lines: Lines,
}

#[derive(Debug, Clone)]
pub struct MockClass {
    pub id: u64,
    pub name: &'static str,
    pub superclass: u64,
    pub interface: bool,
    pub methods: Vec<MockMethod>,
}

impl MockClass {
    pub fn new(id: u64, name: &'static str) -> Self {
        Self {
            id,
            name,
            superclass: 0,
            interface: false,
            methods: Vec::new(),
        }
    }

    pub fn interface(id: u64, name: &'static str) -> Self {
        Self {
            interface: true,
            ..Self::new(id, name)
        }
    }

    pub fn extends(mut self, superclass: u64) -> Self {
        self.superclass = superclass;
        self
    }

    pub fn method(self, id: u64, name: &'static str, signature: &'static str) -> Self {
        self.method_with_lines(id, name, signature, Lines::Code { start: 0 })
    }

    pub fn method_with_lines(
        mut self,
        id: u64,
        name: &'static str,
        signature: &'static str,
        lines: Lines,
    ) -> Self {
        self.methods.push(MockMethod {
            id,
            name,
            signature,
            lines,
        });
        self
    }

    fn jni_signature(&self) -> String {
        format!("L{};", self.name.replace('.', "/"))
    }
}

/// `java.lang.Object`, `p.Base extends Object`, `p.Point extends Base` and the interface
/// `p.Shape`.
pub fn point_classes() -> Vec<MockClass> {
    vec![
        MockClass::new(OBJECT, "java.lang.Object")
            .method(101, "hashCode", "()I")
            .method(102, "equals", "(Ljava/lang/Object;)Z")
            .method(103, "toString", "()Ljava/lang/String;")
            .method(104, "<init>", "()V"),
        MockClass::new(BASE, "p.Base")
            .extends(OBJECT)
            .method(201, "describe", "()Ljava/lang/String;")
            .method(202, "<init>", "()V"),
        MockClass::new(POINT, "p.Point")
            .extends(BASE)
            .method_with_lines(301, "hashCode", "()I", Lines::Code { start: 4 })
            .method(302, "equals", "(Ljava/lang/Object;)Z")
            .method(303, "<init>", "(II)V")
            .method(304, "distance", "(Lp/Point;)D")
            .method(305, "origin", "()Lp/Point;")
            .method(306, "scale", "([[DI)[Lp/Point;")
            .method_with_lines(307, "nativeHash", "()I", Lines::Native)
            .method_with_lines(308, "generated", "()V", Lines::Absent),
        MockClass::interface(SHAPE, "p.Shape").method(401, "area", "()D"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestLocation {
    class_id: u64,
    method_id: u64,
    index: u64,
}

#[derive(Default)]
struct TargetState {
    classes: Vec<MockClass>,
    requests: HashMap<i32, RequestLocation>,
    next_request: i32,
    receivers: HashMap<u64, u64>,
    next_event: u32,
    events_sent: u64,
    acknowledged: u64,
    resumes: u64,
    disposes: u64,
    clear_alls: u64,
    attaches: u64,
    mute_resume: bool,
    mute_arm: bool,
    fail_frames: bool,
}

struct Shared {
    state: Mutex<TargetState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connection: Mutex<Option<JoinHandle<()>>>,
    acked: watch::Sender<u64>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MockTarget {
    address: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockTarget {
    pub async fn start(classes: Vec<MockClass>) -> MockTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (acked, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(TargetState {
                classes,
                next_request: 1,
                ..Default::default()
            }),
            writer: tokio::sync::Mutex::new(None),
            connection: Mutex::new(None),
            acked,
        });
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));
        MockTarget {
            address,
            shared,
            accept_task,
        }
    }

    pub async fn point() -> MockTarget {
        Self::start(point_classes()).await
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Runs one invocation of `class_id`'s method `method_id` on `thread`.
    ///
    /// Returns `true` if a breakpoint fired, after the meter resumed the thread.
    pub async fn invoke(&self, class_id: u64, method_id: u64, thread: u64, receiver: u64) -> bool {
        let Some(sequence) = self.fire(class_id, method_id, thread, receiver).await else {
            return false;
        };

        let mut acked = self.shared.acked.subscribe();
        let resumed = async {
            loop {
                if *acked.borrow_and_update() >= sequence {
                    return true;
                }
                if acked.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(ACK_TIMEOUT, resumed)
            .await
            .unwrap_or(false)
    }

    /// Emits the breakpoint event for an invocation without waiting for the resume.
    ///
    /// Returns the event's sequence number, or `None` if no request matched.
    pub async fn fire(
        &self,
        class_id: u64,
        method_id: u64,
        thread: u64,
        receiver: u64,
    ) -> Option<u64> {
        {
            let mut writer = self.shared.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return None;
            };

            let (packet, sequence) = {
                let mut state = self.shared.state();
                let Some((request_id, location)) = state
                    .requests
                    .iter()
                    .find(|(_, location)| {
                        location.class_id == class_id && location.method_id == method_id
                    })
                    .map(|(id, location)| (*id, *location))
                else {
                    return None;
                };
                state.receivers.insert(thread, receiver);
                state.events_sent += 1;
                state.next_event += 1;

                let mut data = BytesMut::new();
                data.put_u8(1); // EVENT_THREAD
                data.put_i32(1);
                data.put_u8(2); // BREAKPOINT
                data.put_i32(request_id);
                data.put_u64(thread);
                put_location(&mut data, location);
                (
                    command_packet(state.next_event, 64, 100, &data),
                    state.events_sent,
                )
            };
            if writer.write_all(&packet).await.is_err() {
                return None;
            }
            Some(sequence)
        }
    }

    /// Sends `VM_DEATH` to the attached meter.
    pub async fn vm_death(&self) {
        let mut writer = self.shared.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            let id = {
                let mut state = self.shared.state();
                state.next_event += 1;
                state.next_event
            };
            let mut data = BytesMut::new();
            data.put_u8(0); // NONE
            data.put_i32(1);
            data.put_u8(99);
            data.put_i32(0);
            let _ = writer.write_all(&command_packet(id, 64, 100, &data)).await;
        }
    }

    /// Closes the socket as a crashing target would.
    pub async fn drop_connection(&self) {
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let connection = self
            .shared
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(connection) = connection {
            connection.abort();
        }
    }

    /// Stops answering `VirtualMachine.Resume`, like a target that hangs mid-batch.
    pub fn mute_resume(&self, mute: bool) {
        self.shared.state().mute_resume = mute;
    }

    /// Stops answering `EventRequest.Set`, so arming never completes.
    pub fn mute_arm(&self, mute: bool) {
        self.shared.state().mute_arm = mute;
    }

    /// Answers `ThreadReference.Frames` with `INVALID_THREAD`.
    pub fn fail_frames(&self, fail: bool) {
        self.shared.state().fail_frames = fail;
    }

    /// Number of breakpoint requests currently registered.
    pub fn armed(&self) -> usize {
        self.shared.state().requests.len()
    }

    pub fn resumes(&self) -> u64 {
        self.shared.state().resumes
    }

    pub fn disposes(&self) -> u64 {
        self.shared.state().disposes
    }

    pub fn clear_alls(&self) -> u64 {
        self.shared.state().clear_alls
    }

    pub fn attaches(&self) -> u64 {
        self.shared.state().attaches
    }

    /// Polls until `condition` holds, for up to two seconds.
    pub async fn wait_until(&self, condition: impl Fn(&MockTarget) -> bool) -> bool {
        for _ in 0..200 {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }
}

impl Drop for MockTarget {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Some(connection) = self
            .shared
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            connection.abort();
        }
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A port whose peer accepts the connection and answers the handshake with `reply`,
/// then closes.
pub async fn bad_handshake_port(reply: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut handshake = [0u8; HANDSHAKE.len()];
            let _ = stream.read_exact(&mut handshake).await;
            let _ = stream.write_all(reply).await;
            let _ = stream.shutdown().await;
        }
    });
    port
}

/// A port whose peer accepts the connection and never says anything.
pub async fn silent_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let mut handshake = [0u8; HANDSHAKE.len()];
        if stream.read_exact(&mut handshake).await.is_err() || handshake != HANDSHAKE {
            continue;
        }
        if stream.write_all(HANDSHAKE).await.is_err() {
            continue;
        }

        let (reader, writer) = stream.into_split();
        *shared.writer.lock().await = Some(writer);
        {
            let mut state = shared.state();
            state.attaches += 1;
            state.requests.clear();
        }
        let task = tokio::spawn(serve(reader, shared.clone()));
        let previous = shared
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

async fn serve(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        let mut length = [0u8; 4];
        if reader.read_exact(&mut length).await.is_err() {
            break;
        }
        let total = u32::from_be_bytes(length) as usize;
        if total < 11 {
            break;
        }
        let mut rest = vec![0u8; total - 4];
        if reader.read_exact(&mut rest).await.is_err() {
            break;
        }
        let mut packet = Bytes::from(rest);
        let id = packet.get_u32();
        let _flags = packet.get_u8();
        let command_set = packet.get_u8();
        let command = packet.get_u8();

        let Some((error_code, data)) = handle(&shared, command_set, command, packet) else {
            continue;
        };
        let reply = reply_packet(id, error_code, &data);
        let mut writer = shared.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                if writer.write_all(&reply).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }
}

// `None` leaves the command unanswered.
fn handle(shared: &Shared, command_set: u8, command: u8, mut data: Bytes) -> Option<(u16, BytesMut)> {
    let mut state = shared.state();
    let mut out = BytesMut::new();
    let code = match (command_set, command) {
        // VirtualMachine.IDSizes
        (1, 7) => {
            for _ in 0..5 {
                out.put_i32(8);
            }
            0
        }
        // VirtualMachine.ClassesBySignature
        (1, 2) => {
            let signature = get_string(&mut data);
            match state.classes.iter().find(|c| c.jni_signature() == signature) {
                Some(class) => {
                    out.put_i32(1);
                    out.put_u8(if class.interface { 2 } else { 1 }); // INTERFACE or CLASS
                    out.put_u64(class.id);
                    out.put_i32(7); // VERIFIED | PREPARED | INITIALIZED
                }
                None => out.put_i32(0),
            }
            0
        }
        // VirtualMachine.Dispose
        (1, 6) => {
            state.disposes += 1;
            state.requests.clear();
            0
        }
        // VirtualMachine.Resume
        (1, 9) => {
            if state.mute_resume {
                return None;
            }
            state.resumes += 1;
            if state.acknowledged < state.events_sent {
                state.acknowledged += 1;
                shared.acked.send_replace(state.acknowledged);
            }
            0
        }
        // ReferenceType.Methods
        (2, 5) => {
            let class_id = data.get_u64();
            match state.classes.iter().find(|c| c.id == class_id) {
                Some(class) => {
                    out.put_i32(class.methods.len() as i32);
                    for method in &class.methods {
                        out.put_u64(method.id);
                        put_string(&mut out, method.name);
                        put_string(&mut out, method.signature);
                        out.put_i32(1); // public
                    }
                    0
                }
                None => INVALID_OBJECT,
            }
        }
        // ClassType.Superclass
        (3, 1) => {
            let class_id = data.get_u64();
            match state.classes.iter().find(|c| c.id == class_id) {
                Some(class) if class.interface => INVALID_CLASS,
                Some(class) => {
                    out.put_u64(class.superclass);
                    0
                }
                None => INVALID_OBJECT,
            }
        }
        // Method.LineTable
        (6, 1) => {
            let class_id = data.get_u64();
            let method_id = data.get_u64();
            let lines = state
                .classes
                .iter()
                .filter(|c| c.id == class_id)
                .flat_map(|c| c.methods.iter())
                .find(|m| m.id == method_id)
                .map(|m| m.lines);
            match lines {
                Some(Lines::Code { start }) => {
                    out.put_i64(start);
                    out.put_i64(start + 20);
                    out.put_i32(0);
                    0
                }
                Some(Lines::Absent) => ABSENT_INFORMATION,
                Some(Lines::Native) => NATIVE_METHOD,
                None => INVALID_OBJECT,
            }
        }
        // ThreadReference.Frames
        (11, 6) => {
            let _thread = data.get_u64();
            if state.fail_frames {
                return Some((INVALID_THREAD, out));
            }
            out.put_i32(1);
            out.put_u64(0xF0);
            put_location(
                &mut out,
                RequestLocation {
                    class_id: 0,
                    method_id: 0,
                    index: 0,
                },
            );
            0
        }
        // EventRequest.Set
        (15, 1) => {
            if state.mute_arm {
                return None;
            }
            let _kind = data.get_u8();
            let _policy = data.get_u8();
            let modifiers = data.get_i32();
            let mut location = None;
            for _ in 0..modifiers {
                if data.get_u8() == 7 {
                    let _tag = data.get_u8();
                    location = Some(RequestLocation {
                        class_id: data.get_u64(),
                        method_id: data.get_u64(),
                        index: data.get_u64(),
                    });
                }
            }
            match location {
                Some(location) => {
                    let request_id = state.next_request;
                    state.next_request += 1;
                    state.requests.insert(request_id, location);
                    out.put_i32(request_id);
                    0
                }
                None => NOT_IMPLEMENTED,
            }
        }
        // EventRequest.Clear
        (15, 2) => {
            let _kind = data.get_u8();
            let request_id = data.get_i32();
            state.requests.remove(&request_id);
            0
        }
        // EventRequest.ClearAllBreakpoints
        (15, 3) => {
            state.clear_alls += 1;
            state.requests.clear();
            0
        }
        // StackFrame.ThisObject
        (16, 3) => {
            let thread = data.get_u64();
            let _frame = data.get_u64();
            let receiver = state.receivers.get(&thread).copied().unwrap_or(0);
            out.put_u8(b'L');
            out.put_u64(receiver);
            0
        }
        _ => NOT_IMPLEMENTED,
    };
    Some((code, out))
}

fn put_location(out: &mut BytesMut, location: RequestLocation) {
    out.put_u8(1);
    out.put_u64(location.class_id);
    out.put_u64(location.method_id);
    out.put_u64(location.index);
}

fn put_string(out: &mut BytesMut, value: &str) {
    out.put_i32(value.len() as i32);
    out.put_slice(value.as_bytes());
}

fn get_string(data: &mut Bytes) -> String {
    let len = data.get_i32() as usize;
    String::from_utf8_lossy(&data.split_to(len)).into_owned()
}

fn command_packet(id: u32, command_set: u8, command: u8, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(11 + data.len());
    out.put_u32((11 + data.len()) as u32);
    out.put_u32(id);
    out.put_u8(0);
    out.put_u8(command_set);
    out.put_u8(command);
    out.put_slice(data);
    out.freeze()
}

fn reply_packet(id: u32, error_code: u16, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(11 + data.len());
    out.put_u32((11 + data.len()) as u32);
    out.put_u32(id);
    out.put_u8(REPLY_FLAG);
    out.put_u16(error_code);
    out.put_slice(data);
    out.freeze()
}
