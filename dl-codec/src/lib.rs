// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Stream framing for the wire protocol: every message is bincode-serialized
//! and prefixed with its payload length as a big-endian u32. The decoder is
//! stateful so that a TCP stream can be fed in arbitrary chunks.


use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

// Length prefix size in bytes.
const FRAME_PREFIX_LEN: usize = 4;
// Requests and responses carry a short lock name and a reason string; any
// frame larger than this is a malformed or hostile peer.
const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("encode error: {0}")]
  Encode(#[from] bincode::error::EncodeError),
  #[error("decode error: {0}")]
  Decode(#[from] bincode::error::DecodeError),
  #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
  FrameTooLarge(usize),
  #[error("frame payload has {0} trailing bytes")]
  TrailingBytes(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

//
// Encoder
//

/// Converts messages into length-prefixed frames.
#[derive(Debug, Default)]
pub struct Encoder<MessageType: Serialize> {
  _type: PhantomData<MessageType>,
}

impl<MessageType: Serialize> Encoder<MessageType> {
  #[must_use]
  pub fn new() -> Self {
    Self { _type: PhantomData }
  }

  pub fn encode(&mut self, message: &MessageType) -> Result<Bytes> {
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    if payload.len() > MAX_FRAME_LEN {
      return Err(Error::FrameTooLarge(payload.len()));
    }

    let mut buffer = BytesMut::with_capacity(FRAME_PREFIX_LEN + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    buffer.put_u32(payload.len() as u32);
    buffer.extend_from_slice(&payload);
    Ok(buffer.freeze())
  }
}

//
// Decoder
//

// A stateful frame decoder. As data is added, the decoder yields as many
// complete messages as possible; a partial frame is retained and combined
// with the data added on the next call, so the input may be fragmented at
// any byte boundary.
#[derive(Debug)]
pub struct Decoder<MessageType: DeserializeOwned> {
  buffer: BytesMut,
  current_frame_size: Option<usize>,
  _type: PhantomData<MessageType>,
}

impl<MessageType: DeserializeOwned> Default for Decoder<MessageType> {
  fn default() -> Self {
    Self {
      buffer: BytesMut::new(),
      current_frame_size: None,
      _type: PhantomData,
    }
  }
}

impl<MessageType: DeserializeOwned> Decoder<MessageType> {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  // Decodes data, returning all complete messages parsed from the incoming
  // data combined with any leftover data from a previous chunk.
  pub fn decode_data(&mut self, data: &[u8]) -> Result<Vec<MessageType>> {
    self.buffer.extend_from_slice(data);

    let mut messages = Vec::new();
    loop {
      match self.current_frame_size {
        None => {
          if self.buffer.len() < FRAME_PREFIX_LEN {
            return Ok(messages);
          }
          let frame_size = self.buffer.get_u32() as usize;
          if frame_size > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(frame_size));
          }
          log::trace!("next frame len={frame_size}");
          self.current_frame_size = Some(frame_size);
        },
        Some(frame_size) => {
          if self.buffer.len() < frame_size {
            return Ok(messages);
          }
          let payload = self.buffer.split_to(frame_size);
          self.current_frame_size = None;

          let (message, consumed): (MessageType, usize) =
            bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
          if consumed != frame_size {
            return Err(Error::TrailingBytes(frame_size - consumed));
          }
          messages.push(message);
        },
      }
    }
  }
}
