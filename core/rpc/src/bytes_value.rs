// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Fast-path binary payload
//!
//! [`BytesValue`] is wire-compatible with a protobuf message holding a single
//! `bytes value = 1;` field, but encodes with one allocation and decodes without
//! copying the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{
    DecodeContext, WireType, decode_key, decode_varint, encode_key, encode_varint,
    encoded_len_varint, skip_field,
};

use crate::Status;
use crate::codec::{Decoder, Encoder};

const VALUE_TAG: u32 = 1;

/// A raw binary payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytesValue {
    pub value: Bytes,
}

impl BytesValue {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn into_inner(self) -> Bytes {
        self.value
    }

    /// Exact encoded size
    pub fn encoded_len(&self) -> usize {
        if self.value.is_empty() {
            return 0;
        }
        // one byte for the key of field 1
        1 + encoded_len_varint(self.value.len() as u64) + self.value.len()
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl Encoder for BytesValue {
    fn encode(self) -> Result<Bytes, Status> {
        if self.value.is_empty() {
            return Ok(Bytes::new());
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        encode_key(VALUE_TAG, WireType::LengthDelimited, &mut buf);
        encode_varint(self.value.len() as u64, &mut buf);
        buf.put(self.value);
        Ok(buf.freeze())
    }
}

impl Decoder for BytesValue {
    fn decode(mut buf: Bytes) -> Result<Self, Status> {
        let mut value = Bytes::new();

        while buf.has_remaining() {
            let (tag, wire_type) = decode_key(&mut buf).map_err(malformed)?;
            if tag == VALUE_TAG && wire_type == WireType::LengthDelimited {
                let len = decode_varint(&mut buf).map_err(malformed)? as usize;
                if len > buf.remaining() {
                    return Err(Status::invalid_argument(format!(
                        "bytes value truncated: declared {} bytes, {} available",
                        len,
                        buf.remaining()
                    )));
                }
                // last occurrence wins, as in protobuf
                value = buf.split_to(len);
            } else {
                skip_field(wire_type, tag, &mut buf, DecodeContext::default()).map_err(malformed)?;
            }
        }

        Ok(Self { value })
    }
}

fn malformed(err: prost::DecodeError) -> Status {
    Status::invalid_argument(format!("malformed bytes value: {}", err))
}
