// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::packet::{encode_command, IdSizes, Packet, PacketReader, PacketWriter, HEADER_LEN};
use super::{command, command_set, HANDSHAKE};
use crate::error::{Error, Result};

// Largest packet accepted from the target.
const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// Raw `Event.Composite` payloads in arrival order. Closes when the connection drops.
pub(crate) type EventStream = mpsc::UnboundedReceiver<Bytes>;

#[derive(Debug)]
struct Reply {
    error_code: u16,
    data: Bytes,
}

#[derive(Default)]
struct Waiters {
    closed: bool,
    pending: HashMap<u32, oneshot::Sender<Reply>>,
}

#[derive(Default)]
struct Shared {
    waiters: Mutex<Waiters>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: u32, waiter: oneshot::Sender<Reply>) -> Result<()> {
        let mut waiters = self.lock();
        if waiters.closed {
            return Err(Error::disconnected("connection already closed"));
        }
        waiters.pending.insert(id, waiter);
        Ok(())
    }

    fn take(&self, id: u32) -> Option<oneshot::Sender<Reply>> {
        self.lock().pending.remove(&id)
    }

    // Dropping the senders wakes every waiting command with a disconnect.
    fn close(&self) {
        let mut waiters = self.lock();
        waiters.closed = true;
        waiters.pending.clear();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// One JDWP connection: a writer shared by all callers and a background task that
/// routes replies to their commands and composite events to the [`EventStream`].
pub(crate) struct Connection {
    address: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    next_id: AtomicU32,
    sizes: IdSizes,
    read_task: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("sizes", &self.sizes)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connects, performs the `JDWP-Handshake` exchange and negotiates ID sizes.
    ///
    /// Any failure before the connection is usable is reported as [`Error::Attach`].
    pub async fn open(address: &str, timeout: Duration) -> Result<(Self, EventStream)> {
        let attach_error = |details: String| Error::Attach {
            address: address.to_string(),
            details,
        };

        let handshake = async {
            let mut stream = TcpStream::connect(address)
                .await
                .map_err(|e| attach_error(e.to_string()))?;
            stream
                .write_all(HANDSHAKE)
                .await
                .map_err(|e| attach_error(format!("handshake write failed: {e}")))?;
            let mut reply = [0u8; HANDSHAKE.len()];
            stream
                .read_exact(&mut reply)
                .await
                .map_err(|e| attach_error(format!("handshake read failed: {e}")))?;
            if reply != HANDSHAKE {
                return Err(attach_error(format!(
                    "unexpected handshake reply {:?}",
                    String::from_utf8_lossy(&reply)
                )));
            }
            Ok(stream)
        };

        let stream = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| attach_error(format!("handshake timed out after {timeout:?}")))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {address}: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let read_task = tokio::spawn(read_loop(read_half, shared.clone(), events_tx));

        let mut connection = Self {
            address: address.to_string(),
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            next_id: AtomicU32::new(1),
            sizes: IdSizes::default(),
            read_task,
        };

        let id_sizes = tokio::time::timeout(
            timeout,
            connection.command(command_set::VIRTUAL_MACHINE, command::ID_SIZES, Bytes::new()),
        )
        .await
        .map_err(|_| attach_error(format!("IDSizes timed out after {timeout:?}")))?
        .map_err(|e| attach_error(format!("IDSizes failed: {e}")))?;
        connection.sizes = IdSizes::decode(id_sizes)?;
        debug!("Attached to {address} with {:?}", connection.sizes);

        Ok((connection, events_rx))
    }

    /// Sends one command and waits for its reply payload.
    pub async fn command(&self, command_set: u8, command: u8, data: Bytes) -> Result<Bytes> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.register(id, reply_tx)?;

        let packet = encode_command(id, command_set, command, &data);
        trace!("-> {} command {command_set}/{command} id={id}", self.address);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&packet).await {
                self.shared.take(id);
                return Err(Error::disconnected(format!(
                    "write of command {command_set}/{command} failed: {e}"
                )));
            }
        }

        match reply_rx.await {
            Ok(Reply {
                error_code: 0,
                data,
            }) => Ok(data),
            Ok(Reply { error_code, .. }) => Err(Error::Protocol {
                command_set,
                command,
                code: error_code,
            }),
            Err(_) => Err(Error::disconnected(format!(
                "no reply to command {command_set}/{command}"
            ))),
        }
    }

    pub fn writer(&self) -> PacketWriter {
        PacketWriter::new(self.sizes)
    }

    pub fn reader(&self, data: Bytes) -> PacketReader {
        PacketReader::new(data, self.sizes)
    }

    pub fn sizes(&self) -> IdSizes {
        self.sizes
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Shuts the socket down and fails any command still waiting for a reply.
    pub async fn close(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Shutdown of {} failed: {e}", self.address);
        }
        self.read_task.abort();
        self.shared.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Bytes>,
) {
    let reason = loop {
        match read_packet(&mut reader).await {
            Ok(Packet::Reply {
                id,
                error_code,
                data,
            }) => match shared.take(id) {
                Some(waiter) => {
                    if waiter.send(Reply { error_code, data }).is_err() {
                        debug!("Reply {id} arrived after its caller gave up");
                    }
                }
                None => warn!("Reply {id} does not match any pending command"),
            },
            Ok(Packet::Command {
                command_set: command_set::EVENT,
                command: command::COMPOSITE,
                data,
                ..
            }) => {
                if events.send(data).is_err() {
                    trace!("Event stream dropped, discarding composite event");
                }
            }
            Ok(Packet::Command {
                command_set,
                command,
                ..
            }) => warn!("Ignoring unexpected command {command_set}/{command} from target"),
            Err(e) => break e,
        }
    };
    debug!("JDWP read loop ended: {reason}");
    shared.close();
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Result<Packet> {
    let mut length = [0u8; 4];
    reader
        .read_exact(&mut length)
        .await
        .map_err(|e| Error::disconnected(e.to_string()))?;
    let total = u32::from_be_bytes(length) as usize;
    if total < HEADER_LEN {
        return Err(Error::malformed(format!("packet length {total} below header size")));
    }
    if total > MAX_PACKET_LEN {
        return Err(Error::malformed(format!(
            "packet length {total} exceeds {MAX_PACKET_LEN}"
        )));
    }

    let mut raw = BytesMut::with_capacity(total);
    raw.extend_from_slice(&length);
    raw.resize(total, 0);
    reader
        .read_exact(&mut raw[4..])
        .await
        .map_err(|e| Error::disconnected(e.to_string()))?;
    Packet::decode(raw.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_from_peer(bytes: &'static [u8]) -> Result<Packet> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(bytes).await.unwrap();
            // keep the socket open until the client has read
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let stream = TcpStream::connect(address).await.unwrap();
        let (mut reader, _writer) = stream.into_split();
        let result = read_packet(&mut reader).await;
        peer.abort();
        result
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected_before_reading() {
        let result = read_from_peer(&[0xFF, 0xFF, 0xFF, 0xF0]).await;
        assert!(matches!(result, Err(Error::MalformedPacket { .. })));
    }

    #[tokio::test]
    async fn test_short_length_is_rejected() {
        let result = read_from_peer(&[0, 0, 0, 4]).await;
        assert!(matches!(result, Err(Error::MalformedPacket { .. })));
    }

    #[tokio::test]
    async fn test_reply_is_read() {
        let result = read_from_peer(&[0, 0, 0, 11, 0, 0, 0, 7, 0x80, 0, 0]).await;
        match result {
            Ok(Packet::Reply { id, error_code, .. }) => {
                assert_eq!(id, 7);
                assert_eq!(error_code, 0);
            }
            other => panic!("expected a reply, got {other:?}"),
        }
    }
}
