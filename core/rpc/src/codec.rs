// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Self-describing payload encodings
//!
//! A payload type that implements [`Codec`] is self-describing: the marshaller
//! registry picks it up without any explicit registration.

use bytes::Bytes;

use crate::Status;

/// Turns a payload into its wire bytes
pub trait Encoder {
    fn encode(self) -> Result<Bytes, Status>;
}

/// Reads a payload back from its wire bytes
pub trait Decoder: Sized {
    fn decode(buf: Bytes) -> Result<Self, Status>;
}

/// Implemented for every type that is both [`Encoder`] and [`Decoder`]
pub trait Codec: Encoder + Decoder {}

impl<T: Encoder + Decoder> Codec for T {}

// Pass-through implementations for raw payloads

impl Encoder for Vec<u8> {
    fn encode(self) -> Result<Bytes, Status> {
        Ok(Bytes::from(self))
    }
}

impl Decoder for Vec<u8> {
    fn decode(buf: Bytes) -> Result<Self, Status> {
        Ok(buf.to_vec())
    }
}

impl Encoder for Bytes {
    fn encode(self) -> Result<Bytes, Status> {
        Ok(self)
    }
}

impl Decoder for Bytes {
    fn decode(buf: Bytes) -> Result<Self, Status> {
        Ok(buf)
    }
}

impl Encoder for String {
    fn encode(self) -> Result<Bytes, Status> {
        Ok(Bytes::from(self))
    }
}

impl Decoder for String {
    fn decode(buf: Bytes) -> Result<Self, Status> {
        String::from_utf8(buf.to_vec())
            .map_err(|e| Status::invalid_argument(format!("payload is not valid UTF-8: {}", e)))
    }
}

// The void payload: nothing on the wire.

impl Encoder for () {
    fn encode(self) -> Result<Bytes, Status> {
        Ok(Bytes::new())
    }
}

impl Decoder for () {
    fn decode(_buf: Bytes) -> Result<Self, Status> {
        Ok(())
    }
}
