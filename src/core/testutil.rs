// Copyright 2020 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

use bytes::BytesMut;
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, Encoder};

use super::{Argument, Message, ObjectId, OpCode, WaylandCodec, WaylandTransport};

/// The encoded bytes of a message, header included.
pub fn frame(object: u32, opcode: OpCode, args: Vec<Argument>) -> BytesMut {
    let msg = Message::new(ObjectId::new(object), opcode, args).expect("unable to build message");
    let mut buf = BytesMut::new();
    WaylandCodec::new()
        .encode(&msg, &mut buf)
        .expect("unable to encode message");
    buf
}

/// A message as it would be seen after being read off the wire.
pub fn event(object: u32, opcode: OpCode, args: Vec<Argument>) -> Message {
    let mut buf = frame(object, opcode, args);

    WaylandCodec::new()
        .decode(&mut buf)
        .expect("unable to decode message")
        .expect("incomplete message")
}

/// Two transports connected to each other: (client side, compositor side).
pub fn transport_pair() -> (WaylandTransport, WaylandTransport) {
    let (client, server) = UnixStream::pair().expect("unable to create socket pair");

    (
        WaylandTransport::new(client, false),
        WaylandTransport::new(server, false),
    )
}

/// A transport connected to a raw socket for writing arbitrary bytes.
pub fn transport_and_peer() -> (WaylandTransport, UnixStream) {
    let (client, peer) = UnixStream::pair().expect("unable to create socket pair");

    (WaylandTransport::new(client, false), peer)
}
