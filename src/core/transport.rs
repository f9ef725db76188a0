// Copyright 2020 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::BytesMut;
use log::{debug, trace};
use rustix::io::retry_on_intr;
use rustix::net::{
    recvmsg, send, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, WaylandCodec, MAX_FDS_PER_MESSAGE};
use super::store::MessageFdMap;
use super::Message;

/// The most bytes taken from the socket by a single receive.
pub const MAX_BYTES_IN: usize = 4096;

// === WaylandTransport ===

/// The framed [Wayland] byte stream over a UNIX domain socket.
///
/// Reads and writes are serialized separately: a reader holds the read lock for
/// a whole frame and a writer holds the write lock for a whole message, so a
/// read never waits for a write or the other way around. File descriptors travel
/// as `SCM_RIGHTS` ancillary data with the message bytes.
///
/// [Wayland]: https://wayland.freedesktop.org/
#[derive(Debug)]
pub struct WaylandTransport {
    socket: StdMutex<Option<Arc<Socket>>>,
    reader: Mutex<ReadState>,
    writer: Mutex<WriteState>,
    closed: CancellationToken,
    debug: bool,
}

#[derive(Debug, Default)]
struct ReadState {
    codec: WaylandCodec,
    buf: BytesMut,
    fds: VecDeque<OwnedFd>,
}

#[derive(Debug, Default)]
struct WriteState {
    codec: WaylandCodec,
    buf: BytesMut,
}

impl WaylandTransport {
    /// Wrap a connected socket.
    ///
    /// With `debug` set every message is logged at debug level instead of trace.
    pub fn new(stream: UnixStream, debug: bool) -> WaylandTransport {
        WaylandTransport {
            socket: StdMutex::new(Some(Arc::new(Socket { stream }))),
            reader: Mutex::new(ReadState::default()),
            writer: Mutex::new(WriteState::default()),
            closed: CancellationToken::new(),
            debug,
        }
    }

    /// Read the next message, without any file descriptors attached.
    pub async fn read_message(&self) -> Result<Message, TransportError> {
        self.read_message_with(&()).await
    }

    /// Read the next message.
    ///
    /// This waits until a whole frame has arrived. The file descriptors received
    /// with the bytes are queued in arrival order and `fd_map` decides how many of
    /// them belong to this message. Descriptors of a message that `fd_map` does
    /// not know about stay queued for the next message that takes some.
    pub async fn read_message_with(
        &self,
        fd_map: &impl MessageFdMap,
    ) -> Result<Message, TransportError> {
        let mut guard = self.reader.lock().await;
        let state = &mut *guard;

        loop {
            let socket = self.socket()?;

            if let Some(msg) = state.codec.decode(&mut state.buf)? {
                let count = fd_map
                    .fd_count(msg.object_id(), msg.opcode())
                    .min(state.fds.len());
                msg.attach_fds(state.fds.drain(..count));

                self.log("<-", &msg);
                return Ok(msg);
            }

            let buffered = state.buf.len();
            if socket.recv_some(state, &self.closed).await? == 0 {
                return Err(match buffered {
                    0 => TransportError::Disconnected,
                    _ => TransportError::ShortRead { buffered },
                });
            }
        }
    }

    /// Send a message along with any file descriptors it carries.
    ///
    /// The descriptors go out with the first bytes of the message in a single
    /// `sendmsg` call.
    pub async fn write_message(&self, msg: Message) -> Result<(), TransportError> {
        let socket = self.socket()?;
        self.log("->", &msg);

        let mut guard = self.writer.lock().await;
        let state = &mut *guard;
        state.buf.clear();
        state.codec.encode(&msg, &mut state.buf)?;
        let fds = msg.into_fds();

        socket.send_all(&state.buf, &fds, &self.closed).await
    }

    /// Close the transport.
    ///
    /// A pending read is cancelled and every later read or write fails with
    /// [`TransportError::Closed`]. Closing more than once has no further effect.
    pub fn close(&self) {
        self.closed.cancel();
        self.socket.lock().unwrap().take();
    }

    /// Whether [`close`](WaylandTransport::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn socket(&self) -> Result<Arc<Socket>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        self.socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::Closed)
    }

    fn log(&self, direction: &str, msg: &Message) {
        if self.debug {
            debug!("{} {}", direction, msg);
        } else {
            trace!("{} {}", direction, msg);
        }
    }
}

// === Socket ===

#[derive(Debug)]
struct Socket {
    stream: UnixStream,
}

impl Socket {
    // Wait for one receive worth of bytes (and fds). Returns 0 at end of stream.
    async fn recv_some(
        &self,
        state: &mut ReadState,
        closed: &CancellationToken,
    ) -> Result<usize, TransportError> {
        let mut chunk = [0u8; MAX_BYTES_IN];

        loop {
            tokio::select! {
                _ = closed.cancelled() => return Err(TransportError::Closed),
                ready = self.stream.readable() => ready?,
            }

            match self
                .stream
                .try_io(Interest::READABLE, || self.recv_msg(&mut chunk, &mut state.fds))
            {
                Ok(count) => {
                    state.buf.extend_from_slice(&chunk[..count]);
                    return Ok(count);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn send_all(
        &self,
        mut bytes: &[u8],
        mut fds: &[OwnedFd],
        closed: &CancellationToken,
    ) -> Result<(), TransportError> {
        while !bytes.is_empty() {
            tokio::select! {
                _ = closed.cancelled() => return Err(TransportError::Closed),
                ready = self.stream.writable() => ready?,
            }

            match self
                .stream
                .try_io(Interest::WRITABLE, || self.send_msg(bytes, fds))
            {
                Ok(count) => {
                    bytes = &bytes[count..];
                    fds = &[];
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    fn send_msg(&self, bytes: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
        #[cfg(not(target_os = "macos"))]
        let flags = SendFlags::DONTWAIT | SendFlags::NOSIGNAL;
        #[cfg(target_os = "macos")]
        let flags = SendFlags::DONTWAIT;

        if fds.is_empty() {
            return Ok(retry_on_intr(|| send(self, bytes, flags))?);
        }

        let iov = [IoSlice::new(bytes)];
        let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(AsFd::as_fd).collect();
        let mut cmsg_space =
            vec![MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(fds.len()))];
        let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space[..]);
        cmsg_buffer.push(SendAncillaryMessage::ScmRights(&borrowed));

        Ok(retry_on_intr(|| sendmsg(self, &iov, &mut cmsg_buffer, flags))?)
    }

    fn recv_msg(&self, buffer: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
        #[cfg(not(target_os = "macos"))]
        let flags = RecvFlags::DONTWAIT | RecvFlags::CMSG_CLOEXEC;
        #[cfg(target_os = "macos")]
        let flags = RecvFlags::DONTWAIT;

        let mut cmsg_space =
            [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_PER_MESSAGE))];
        let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space[..]);
        let mut iov = [IoSliceMut::new(buffer)];
        let msg = retry_on_intr(|| recvmsg(self, &mut iov[..], &mut cmsg_buffer, flags))?;

        let received = cmsg_buffer
            .drain()
            .filter_map(|cmsg| match cmsg {
                RecvAncillaryMessage::ScmRights(fds) => Some(fds),
                _ => None,
            })
            .flatten();
        fds.extend(received);

        Ok(msg.bytes)
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

// === TransportError ===

/// Errors from reading or writing the framed byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket failed.
    #[error("Transport I/O error: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: io::Error,
    },

    /// A message could not be framed.
    #[error("Transport unable to encode or decode a message: {source}")]
    Codec {
        /// The underlying error.
        #[from]
        source: CodecError,
    },

    /// The peer closed the connection between messages.
    #[error("The peer closed the connection.")]
    Disconnected,

    /// The peer closed the connection part way through a message.
    #[error("The peer closed the connection with {buffered} bytes of a partial message.")]
    ShortRead {
        /// The bytes of the partial message.
        buffered: usize,
    },

    /// The transport was closed by this side.
    #[error("The connection is closed.")]
    Closed,
}
