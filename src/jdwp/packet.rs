// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// `length(4) id(4) flags(1) command_set(1) command(1)` or `... error_code(2)` for replies.
pub(crate) const HEADER_LEN: usize = 11;
pub(crate) const REPLY_FLAG: u8 = 0x80;

/// Variable widths of the target's identifiers, negotiated with `VirtualMachine.IDSizes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IdSizes {
    pub field: usize,
    pub method: usize,
    pub object: usize,
    pub reference_type: usize,
    pub frame: usize,
}

impl Default for IdSizes {
    fn default() -> Self {
        Self {
            field: 8,
            method: 8,
            object: 8,
            reference_type: 8,
            frame: 8,
        }
    }
}

impl IdSizes {
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut reader = PacketReader::new(data, IdSizes::default());
        let mut next = |what: &str| -> Result<usize> {
            let size = reader.get_i32(what)?;
            if (1..=8).contains(&size) {
                Ok(size as usize)
            } else {
                Err(Error::malformed(format!("{what} size {size} out of range")))
            }
        };
        Ok(Self {
            field: next("fieldID")?,
            method: next("methodID")?,
            object: next("objectID")?,
            reference_type: next("referenceTypeID")?,
            frame: next("frameID")?,
        })
    }
}

/// A code position inside a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Location {
    pub type_tag: u8,
    pub class_id: u64,
    pub method_id: u64,
    pub index: u64,
}

/// A decoded packet header plus its payload.
#[derive(Debug)]
pub(crate) enum Packet {
    Command {
        id: u32,
        command_set: u8,
        command: u8,
        data: Bytes,
    },
    Reply {
        id: u32,
        error_code: u16,
        data: Bytes,
    },
}

impl Packet {
    /// Splits a full packet (header included) into its parts.
    pub fn decode(mut raw: Bytes) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::malformed(format!(
                "packet of {} bytes is shorter than the header",
                raw.len()
            )));
        }
        let length = raw.get_u32() as usize;
        if length != raw.len() + 4 {
            return Err(Error::malformed(format!(
                "declared length {length} does not match {} received bytes",
                raw.len() + 4
            )));
        }
        let id = raw.get_u32();
        let flags = raw.get_u8();
        if flags & REPLY_FLAG != 0 {
            let error_code = raw.get_u16();
            Ok(Packet::Reply {
                id,
                error_code,
                data: raw,
            })
        } else {
            let command_set = raw.get_u8();
            let command = raw.get_u8();
            Ok(Packet::Command {
                id,
                command_set,
                command,
                data: raw,
            })
        }
    }
}

pub(crate) fn encode_command(id: u32, command_set: u8, command: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_u32((HEADER_LEN + data.len()) as u32);
    buf.put_u32(id);
    buf.put_u8(0);
    buf.put_u8(command_set);
    buf.put_u8(command);
    buf.put_slice(data);
    buf.freeze()
}

/// Builds command payloads using the negotiated identifier widths.
pub(crate) struct PacketWriter {
    buf: BytesMut,
    sizes: IdSizes,
}

impl PacketWriter {
    pub fn new(sizes: IdSizes) -> Self {
        Self {
            buf: BytesMut::new(),
            sizes,
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn put_object_id(&mut self, id: u64) -> &mut Self {
        self.buf.put_uint(id, self.sizes.object);
        self
    }

    pub fn put_reference_type_id(&mut self, id: u64) -> &mut Self {
        self.buf.put_uint(id, self.sizes.reference_type);
        self
    }

    pub fn put_method_id(&mut self, id: u64) -> &mut Self {
        self.buf.put_uint(id, self.sizes.method);
        self
    }

    pub fn put_frame_id(&mut self, id: u64) -> &mut Self {
        self.buf.put_uint(id, self.sizes.frame);
        self
    }

    pub fn put_location(&mut self, location: &Location) -> &mut Self {
        self.put_u8(location.type_tag)
            .put_reference_type_id(location.class_id)
            .put_method_id(location.method_id)
            .put_u64(location.index)
    }

    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Reads reply and event payloads, failing with `MalformedPacket` on short data.
pub(crate) struct PacketReader {
    buf: Bytes,
    sizes: IdSizes,
}

impl PacketReader {
    pub fn new(buf: Bytes, sizes: IdSizes) -> Self {
        Self { buf, sizes }
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            Err(Error::malformed(format!(
                "need {needed} bytes for {what}, {} left",
                self.buf.remaining()
            )))
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self, what: &str) -> Result<u8> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_i32(&mut self, what: &str) -> Result<i32> {
        self.ensure(4, what)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_i64(&mut self, what: &str) -> Result<i64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_u64(&mut self, what: &str) -> Result<u64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_u64())
    }

    /// Reads an `int` that counts the entries that follow.
    pub fn get_count(&mut self, what: &str) -> Result<usize> {
        let count = self.get_i32(what)?;
        usize::try_from(count).map_err(|_| Error::malformed(format!("negative {what}: {count}")))
    }

    pub fn get_string(&mut self, what: &str) -> Result<String> {
        let len = self.get_count(what)?;
        self.ensure(len, what)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::malformed(format!("{what} is not valid UTF-8")))
    }

    fn get_id(&mut self, size: usize, what: &str) -> Result<u64> {
        self.ensure(size, what)?;
        Ok(self.buf.get_uint(size))
    }

    pub fn get_object_id(&mut self, what: &str) -> Result<u64> {
        self.get_id(self.sizes.object, what)
    }

    pub fn get_reference_type_id(&mut self, what: &str) -> Result<u64> {
        self.get_id(self.sizes.reference_type, what)
    }

    pub fn get_method_id(&mut self, what: &str) -> Result<u64> {
        self.get_id(self.sizes.method, what)
    }

    pub fn get_frame_id(&mut self, what: &str) -> Result<u64> {
        self.get_id(self.sizes.frame, what)
    }

    pub fn get_location(&mut self) -> Result<Location> {
        Ok(Location {
            type_tag: self.get_u8("location type tag")?,
            class_id: self.get_reference_type_id("location class")?,
            method_id: self.get_method_id("location method")?,
            index: self.get_u64("location index")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narrow_sizes() -> IdSizes {
        IdSizes {
            field: 4,
            method: 4,
            object: 4,
            reference_type: 4,
            frame: 4,
        }
    }

    #[test]
    fn test_command_header_layout() {
        let raw = encode_command(7, 15, 1, &[0xAA, 0xBB]);
        assert_eq!(
            raw.as_ref(),
            &[0, 0, 0, 13, 0, 0, 0, 7, 0, 15, 1, 0xAA, 0xBB]
        );
        match Packet::decode(raw).unwrap() {
            Packet::Command {
                id,
                command_set,
                command,
                data,
            } => {
                assert_eq!((id, command_set, command), (7, 15, 1));
                assert_eq!(data.as_ref(), &[0xAA, 0xBB]);
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_decoding() {
        let raw = Bytes::from_static(&[0, 0, 0, 15, 0, 0, 0, 3, 0x80, 0, 112, 1, 2, 3, 4]);
        match Packet::decode(raw).unwrap() {
            Packet::Reply {
                id,
                error_code,
                data,
            } => {
                assert_eq!(id, 3);
                assert_eq!(error_code, 112);
                assert_eq!(data.len(), 4);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let raw = Bytes::from_static(&[0, 0, 0, 40, 0, 0, 0, 3, 0x80, 0, 0]);
        assert!(matches!(
            Packet::decode(raw),
            Err(Error::MalformedPacket { .. })
        ));
        assert!(Packet::decode(Bytes::from_static(&[0, 0, 0])).is_err());
    }

    #[test]
    fn test_location_uses_negotiated_widths() {
        let location = Location {
            type_tag: 1,
            class_id: 0x0102_0304,
            method_id: 0x0A0B_0C0D,
            index: 9,
        };
        let data = PacketWriter::new(narrow_sizes()).put_location(&location).finish();
        assert_eq!(data.len(), 1 + 4 + 4 + 8);

        let mut reader = PacketReader::new(data, narrow_sizes());
        assert_eq!(reader.get_location().unwrap(), location);
    }

    #[test]
    fn test_strings_and_short_reads() {
        let data = PacketWriter::new(IdSizes::default())
            .put_string("hashCode")
            .put_i32(-1)
            .finish();
        let mut reader = PacketReader::new(data, IdSizes::default());
        assert_eq!(reader.get_string("name").unwrap(), "hashCode");
        assert!(reader.get_count("count").is_err());
        assert!(reader.get_u8("missing").is_err());
    }

    #[test]
    fn test_id_sizes_decoding() {
        let mut writer = PacketWriter::new(IdSizes::default());
        for size in [8, 8, 8, 8, 8] {
            writer.put_i32(size);
        }
        assert_eq!(IdSizes::decode(writer.finish()).unwrap(), IdSizes::default());

        let mut writer = PacketWriter::new(IdSizes::default());
        for size in [8, 0, 8, 8, 8] {
            writer.put_i32(size);
        }
        assert!(IdSizes::decode(writer.finish()).is_err());
    }
}
