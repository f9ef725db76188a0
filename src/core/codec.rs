// Copyright 2020 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::OwnedFd;
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::{Decimal, ObjectId, OpCode};

/// The size of the fixed header that starts every [Wayland] message.
///
/// [Wayland]: https://wayland.freedesktop.org/
pub const HEADER_SIZE: usize = mem::size_of::<WaylandHeader>();

/// The most file descriptors that can accompany a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 28;

// === Argument ===

/// An argument for a [Wayland] message.
///
/// The eight argument types of the wire protocol map to the variants as follows:
///
/// | Protocol Type | Variant          |
/// |---------------|------------------|
/// | int           | `Int(i32)`       |
/// | uint          | `Uint(u32)`      |
/// | fixed         | `Fixed(Decimal)` |
/// | string        | `Str(String)`    |
/// | object        | `Object(ObjectId)` |
/// | new_id        | `NewId(ObjectId)` |
/// | array         | `Array(Vec<u8>)` |
/// | fd            | `Fd(OwnedFd)`    |
///
/// An `Fd` takes no space in the message body. The descriptor travels alongside
/// the message bytes as ancillary data and is closed on our side once the message
/// has been sent.
///
/// [Wayland]: https://wayland.freedesktop.org/
#[derive(Debug)]
pub enum Argument {
    /// A signed 32 bit integer.
    Int(i32),
    /// An unsigned 32 bit integer (also used for enums).
    Uint(u32),
    /// A signed 24.8 fixed point number.
    Fixed(Decimal),
    /// A UTF-8 string. It must not contain a NUL byte.
    Str(String),
    /// A reference to an existing object (or the null object).
    Object(ObjectId),
    /// The id of an object created by this message.
    NewId(ObjectId),
    /// A blob of bytes.
    Array(Vec<u8>),
    /// A file descriptor passed out of band.
    Fd(OwnedFd),
}

impl Argument {
    /// Create an array `Argument` from a slice of `u32` elements.
    pub fn array_u32(elements: &[u32]) -> Argument {
        let mut bytes = Vec::with_capacity(elements.len() * mem::size_of::<u32>());
        for element in elements {
            bytes.put_u32_le(*element);
        }
        Argument::Array(bytes)
    }

    // The number of bytes this argument takes up in the message body.
    fn len(&self) -> usize {
        use Argument::*;

        match self {
            Int(_) | Uint(_) | Fixed(_) | Object(_) | NewId(_) => mem::size_of::<u32>(),
            Str(s) => align_up(mem::size_of::<u32>() + s.len() + 1),
            Array(a) => align_up(mem::size_of::<u32>() + a.len()),
            Fd(_) => 0,
        }
    }

    fn encode(self, dst: &mut impl BufMut, fds: &mut VecDeque<OwnedFd>) {
        use Argument::*;

        match self {
            Int(val) => dst.put_i32_le(val),
            Uint(val) => dst.put_u32_le(val),
            Fixed(val) => dst.put_i32_le(val.to_raw()),
            Object(id) | NewId(id) => dst.put_u32_le(id.as_u32()),
            Str(s) => {
                let len = s.len() + 1;
                dst.put_u32_le(len as u32);
                dst.put_slice(s.as_bytes());
                dst.put_u8(0);
                dst.put_bytes(0, padding(len));
            }
            Array(a) => {
                dst.put_u32_le(a.len() as u32);
                dst.put_slice(&a);
                dst.put_bytes(0, padding(a.len()));
            }
            Fd(fd) => fds.push_back(fd),
        }
    }
}

impl From<i32> for Argument {
    fn from(val: i32) -> Self {
        Argument::Int(val)
    }
}

impl From<u32> for Argument {
    fn from(val: u32) -> Self {
        Argument::Uint(val)
    }
}

impl From<Decimal> for Argument {
    fn from(val: Decimal) -> Self {
        Argument::Fixed(val)
    }
}

impl From<String> for Argument {
    fn from(val: String) -> Self {
        Argument::Str(val)
    }
}

impl From<&str> for Argument {
    fn from(val: &str) -> Self {
        Argument::Str(val.to_owned())
    }
}

impl From<ObjectId> for Argument {
    fn from(val: ObjectId) -> Self {
        Argument::Object(val)
    }
}

impl From<Vec<u8>> for Argument {
    fn from(val: Vec<u8>) -> Self {
        Argument::Array(val)
    }
}

impl From<OwnedFd> for Argument {
    fn from(val: OwnedFd) -> Self {
        Argument::Fd(val)
    }
}

// === Message ===

/// A single [Wayland] message, either a request we are about to send or an event
/// we have received.
///
/// The body of a received message is decoded with the `read_*` methods. Each one
/// consumes the next argument from the body. The read position (and the queue of
/// received file descriptors) sits behind a lock so a `Message` can be shared
/// between threads, but the arguments must still be read in the order in which
/// they appear.
///
/// [Wayland]: https://wayland.freedesktop.org/
#[derive(Debug)]
pub struct Message {
    object_id: ObjectId,
    opcode: OpCode,
    body: Bytes,
    reader: Mutex<Reader>,
}

#[derive(Debug, Default)]
struct Reader {
    offset: usize,
    fds: VecDeque<OwnedFd>,
}

impl Message {
    /// Build a message sent from `object_id` with the given `opcode` and arguments.
    ///
    /// The size in the header is always computed from the encoded arguments. This
    /// fails if a string argument contains a NUL byte, if the message would be
    /// longer than the 16 bit size field allows, or if it would carry more than
    /// [`MAX_FDS_PER_MESSAGE`] file descriptors.
    pub fn new<I>(object_id: ObjectId, opcode: OpCode, args: I) -> Result<Message, CodecError>
    where
        I: IntoIterator<Item = Argument>,
    {
        let args: Vec<_> = args.into_iter().collect();

        if args
            .iter()
            .any(|arg| matches!(arg, Argument::Str(s) if s.as_bytes().contains(&0)))
        {
            return Err(CodecError::InteriorNul {
                object: object_id,
                opcode,
            });
        }

        let len = HEADER_SIZE + args.iter().map(Argument::len).sum::<usize>();
        if len > u16::MAX as usize {
            return Err(CodecError::MessageTooLong {
                object: object_id,
                len,
            });
        }

        let mut body = BytesMut::with_capacity(len - HEADER_SIZE);
        let mut fds = VecDeque::new();
        for arg in args {
            arg.encode(&mut body, &mut fds);
        }

        if fds.len() > MAX_FDS_PER_MESSAGE {
            return Err(CodecError::TooManyFds {
                object: object_id,
                count: fds.len(),
            });
        }

        Ok(Message {
            object_id,
            opcode,
            body: body.freeze(),
            reader: Mutex::new(Reader { offset: 0, fds }),
        })
    }

    pub(crate) fn from_frame(object_id: ObjectId, opcode: OpCode, body: Bytes) -> Message {
        Message {
            object_id,
            opcode,
            body,
            reader: Mutex::new(Reader::default()),
        }
    }

    pub(crate) fn attach_fds(&self, fds: impl IntoIterator<Item = OwnedFd>) {
        self.reader.lock().unwrap().fds.extend(fds);
    }

    pub(crate) fn into_fds(self) -> Vec<OwnedFd> {
        let reader = match self.reader.into_inner() {
            Ok(reader) => reader,
            Err(poisoned) => poisoned.into_inner(),
        };
        reader.fds.into()
    }

    /// The object that sent (for events) or receives (for requests) this message.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// The opcode of this message within its object's interface.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// The total size of the message on the wire, including the header.
    pub fn size(&self) -> u16 {
        (HEADER_SIZE + self.body.len()) as u16
    }

    /// The encoded arguments of this message.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The number of file descriptors that have not been read yet.
    pub fn fd_count(&self) -> usize {
        self.reader.lock().unwrap().fds.len()
    }

    /// The number of body bytes that have not been read yet.
    pub fn remaining(&self) -> usize {
        self.body.len() - self.reader.lock().unwrap().offset
    }

    /// Write the header and body of this message to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        WaylandHeader::new(self.object_id.as_u32(), self.size(), self.opcode).encode(dst);
        dst.put_slice(&self.body);
    }

    /// Read the next argument as an uint.
    pub fn read_uint32(&self) -> Result<u32, CodecError> {
        let mut reader = self.reader.lock().unwrap();
        let mut bytes = self.take(&mut reader, mem::size_of::<u32>())?;
        Ok(bytes.get_u32_le())
    }

    /// Read the next argument as an int.
    pub fn read_int32(&self) -> Result<i32, CodecError> {
        let mut reader = self.reader.lock().unwrap();
        let mut bytes = self.take(&mut reader, mem::size_of::<i32>())?;
        Ok(bytes.get_i32_le())
    }

    /// Read the next argument as a fixed.
    pub fn read_fixed(&self) -> Result<Decimal, CodecError> {
        self.read_int32().map(Decimal::from_raw)
    }

    /// Read the next argument as an object or new_id.
    pub fn read_object(&self) -> Result<ObjectId, CodecError> {
        self.read_uint32().map(ObjectId::new)
    }

    /// Read the next argument as a string.
    ///
    /// A null string is read as the empty string; use
    /// [`read_optional_string`](Message::read_optional_string) to tell them apart.
    pub fn read_string(&self) -> Result<String, CodecError> {
        self.read_optional_string().map(Option::unwrap_or_default)
    }

    /// Read the next argument as a nullable string.
    pub fn read_optional_string(&self) -> Result<Option<String>, CodecError> {
        let mut reader = self.reader.lock().unwrap();
        let contents = self.take_sized(&mut reader)?;
        if contents.is_empty() {
            return Ok(None);
        }

        let bad_string = || CodecError::BadString {
            object: self.object_id,
            opcode: self.opcode,
        };

        match contents.split_last() {
            Some((0, text)) => String::from_utf8(text.to_vec())
                .map(Some)
                .map_err(|_| bad_string()),
            _ => Err(bad_string()),
        }
    }

    /// Read the next argument as an array of bytes.
    pub fn read_array(&self) -> Result<Vec<u8>, CodecError> {
        let mut reader = self.reader.lock().unwrap();

        Ok(self.take_sized(&mut reader)?.to_vec())
    }

    /// Read the next argument as an array of `u32` elements.
    ///
    /// Trailing bytes that do not make up a whole element are ignored.
    pub fn read_array_u32(&self) -> Result<Vec<u32>, CodecError> {
        let bytes = self.read_array()?;

        Ok(bytes
            .chunks_exact(mem::size_of::<u32>())
            .map(|mut chunk| chunk.get_u32_le())
            .collect())
    }

    /// Take the next file descriptor that came with this message.
    pub fn read_fd(&self) -> Result<OwnedFd, CodecError> {
        self.reader
            .lock()
            .unwrap()
            .fds
            .pop_front()
            .ok_or(CodecError::NoFd {
                object: self.object_id,
                opcode: self.opcode,
            })
    }

    // A length word followed by that many bytes padded to 32 bits. Nothing is
    // consumed unless the whole argument is present.
    fn take_sized<'a>(&'a self, reader: &mut Reader) -> Result<&'a [u8], CodecError> {
        let start = reader.offset;
        let len = self.take(reader, mem::size_of::<u32>())?.get_u32_le() as usize;

        match self.take(reader, align_up(len)) {
            Ok(contents) => Ok(&contents[..len]),
            Err(err) => {
                reader.offset = start;
                Err(err)
            }
        }
    }

    fn take<'a>(&'a self, reader: &mut Reader, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.body.len() - reader.offset;
        if remaining < len {
            return Err(CodecError::Truncated {
                object: self.object_id,
                opcode: self.opcode,
                wanted: len,
                remaining,
            });
        }

        let start = reader.offset;
        reader.offset += len;
        Ok(&self.body[start..start + len])
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, opcode: {}, size: {}, fds: {}, body: ",
            self.object_id,
            self.opcode,
            self.size(),
            self.fd_count()
        )?;
        for byte in self.body.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// === WaylandCodec ===

/// Frames [`Message`]s on a byte stream.
///
/// The codec only deals with bytes; file descriptors are matched up with the
/// decoded messages by the transport.
#[derive(Debug, Default)]
pub struct WaylandCodec {
    _private: (),
}

impl WaylandCodec {
    /// Create a new `WaylandCodec`.
    pub fn new() -> WaylandCodec {
        Default::default()
    }
}

impl Decoder for WaylandCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let header = WaylandHeader::decode(&src[..HEADER_SIZE]);
        let len = header.len() as usize;
        if len < HEADER_SIZE {
            return Err(CodecError::Malformed {
                object: ObjectId::new(header.sender()),
                len: header.len(),
            });
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        frame.advance(HEADER_SIZE);

        Ok(Some(Message::from_frame(
            ObjectId::new(header.sender()),
            header.opcode(),
            frame.freeze(),
        )))
    }
}

impl<'a> Encoder<&'a Message> for WaylandCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.size() as usize);
        item.encode(dst);
        Ok(())
    }
}

// === WaylandHeader ===

#[repr(C)]
struct WaylandHeader {
    sender: u32,

    // The size is the upper 16 bits and the opcode the lower 16 bits.
    len_opcode: u32,
}

impl WaylandHeader {
    fn new(sender: u32, len: u16, opcode: u16) -> WaylandHeader {
        WaylandHeader {
            sender,
            len_opcode: ((len as u32) << 16) | (opcode as u32),
        }
    }

    fn decode(mut src: &[u8]) -> WaylandHeader {
        WaylandHeader {
            sender: src.get_u32_le(),
            len_opcode: src.get_u32_le(),
        }
    }

    fn sender(&self) -> u32 {
        self.sender
    }

    fn len(&self) -> u16 {
        (self.len_opcode >> 16) as u16
    }

    fn opcode(&self) -> u16 {
        (self.len_opcode & 0xFFFF) as u16
    }

    fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.sender);
        dst.put_u32_le(self.len_opcode);
    }
}

// === CodecError ===

/// Errors from building, framing, or decoding a [`Message`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// An I/O error from the underlying byte stream.
    #[error("io error: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: io::Error,
    },

    /// The encoded message does not fit in the 16 bit size field.
    #[error("message sent from {object} is too long ({len} bytes)")]
    MessageTooLong {
        /// The object sending the message.
        object: ObjectId,
        /// The size the message would have had.
        len: usize,
    },

    /// A string argument contains a NUL byte.
    #[error("string argument for opcode {opcode} of {object} contains a NUL byte")]
    InteriorNul {
        /// The object sending the message.
        object: ObjectId,
        /// The opcode of the message.
        opcode: OpCode,
    },

    /// The message carries more file descriptors than one message may.
    #[error("message sent from {object} carries {count} file descriptors")]
    TooManyFds {
        /// The object sending the message.
        object: ObjectId,
        /// The number of file descriptors.
        count: usize,
    },

    /// A received header declares a size smaller than the header itself.
    #[error("message for {object} declares an invalid size of {len} bytes")]
    Malformed {
        /// The object the message is for.
        object: ObjectId,
        /// The declared size.
        len: u16,
    },

    /// An argument extends past the end of the message body.
    #[error("opcode {opcode} of {object} needs {wanted} more bytes but only {remaining} remain")]
    Truncated {
        /// The object the message is for.
        object: ObjectId,
        /// The opcode of the message.
        opcode: OpCode,
        /// The bytes the argument needs.
        wanted: usize,
        /// The bytes left in the body.
        remaining: usize,
    },

    /// A string argument is not NUL terminated or not UTF-8.
    #[error("opcode {opcode} of {object} has a malformed string argument")]
    BadString {
        /// The object the message is for.
        object: ObjectId,
        /// The opcode of the message.
        opcode: OpCode,
    },

    /// No file descriptor is left for an fd argument.
    #[error("opcode {opcode} of {object} has no file descriptor left to read")]
    NoFd {
        /// The object the message is for.
        object: ObjectId,
        /// The opcode of the message.
        opcode: OpCode,
    },
}

fn padding(len: usize) -> usize {
    let align = mem::size_of::<u32>();

    (align - len % align) % align
}

fn align_up(len: usize) -> usize {
    len + padding(len)
}
