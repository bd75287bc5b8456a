// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Client library for the dirlock daemon.
//!
//! A [`Client`] wraps one TCP connection, which is also the daemon-side
//! session: every lock acquired through a client belongs to that connection
//! and is reclaimed by the daemon when it closes. Connections are
//! established lazily on first use and re-established after [`Client::close`].
//!
//! A single request is in flight at a time; the client is not meant to be
//! shared across tasks.


use bytes::BytesMut;
use dl_api::{LockCommand, LockCommandResult, LockRequest, LockResponse};
use dl_codec::{Decoder, Encoder};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The daemon answered with a non-success result.
  #[error("{result}: {reason}")]
  Rejected {
    result: LockCommandResult,
    reason: String,
  },
  /// The daemon closed the connection without answering. Requests with a
  /// newer protocol major version are silently dropped by the daemon, so
  /// this is also what a version-gated client observes.
  #[error("connection closed by daemon")]
  Disconnected,
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Codec(#[from] dl_codec::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

//
// Lock
//

/// A named lock acquired through a [`Client`], to be passed back to
/// [`Client::release`] or [`Client::verify`].
#[derive(Debug)]
pub struct Lock {
  name: String,
}

impl Lock {
  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }
}

impl std::fmt::Display for Lock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.name)
  }
}

//
// Client
//

struct Connection {
  stream: TcpStream,
  encoder: Encoder<LockRequest>,
  decoder: Decoder<LockResponse>,
}

/// A single-connection client to a dirlock daemon. Creating the client
/// performs no I/O.
pub struct Client {
  endpoint: SocketAddr,
  connection: Option<Connection>,
}

impl Client {
  #[must_use]
  pub fn new(endpoint: SocketAddr) -> Self {
    Self {
      endpoint,
      connection: None,
    }
  }

  /// Acquires the named lock, failing fast when it is held elsewhere.
  pub async fn acquire(&mut self, lock_name: &str) -> Result<Lock> {
    self
      .roundtrip(LockRequest::new(LockCommand::Acquire, lock_name))
      .await?;
    Ok(Lock {
      name: lock_name.to_string(),
    })
  }

  /// Releases a lock previously acquired through this client.
  pub async fn release(&mut self, lock: Lock) -> Result<()> {
    self
      .roundtrip(LockRequest::new(LockCommand::Release, lock.name()))
      .await?;
    Ok(())
  }

  /// Confirms the lock is still held by this session and healthy.
  pub async fn verify(&mut self, lock: &Lock) -> Result<()> {
    self
      .roundtrip(LockRequest::new(LockCommand::Verify, lock.name()))
      .await?;
    Ok(())
  }

  /// Returns whether the daemon considers the named lock currently held, by
  /// any session or any foreign process.
  pub async fn is_locked(&mut self, lock_name: &str) -> Result<bool> {
    let response = self
      .roundtrip(LockRequest::new(LockCommand::Peek, lock_name))
      .await?;
    Ok(response.is_locked)
  }

  /// Closes the underlying connection. The daemon reclaims every lock still
  /// held by this session; a later call dials a brand-new session.
  pub async fn close(&mut self) -> Result<()> {
    if let Some(mut connection) = self.connection.take() {
      connection.stream.shutdown().await?;
    }
    Ok(())
  }

  async fn connect(&mut self) -> Result<&mut Connection> {
    if self.connection.is_none() {
      log::debug!("dialing {}", self.endpoint);
      let stream = TcpStream::connect(self.endpoint).await?;
      self.connection = Some(Connection {
        stream,
        encoder: Encoder::new(),
        decoder: Decoder::new(),
      });
    }
    // The connection was either present or just inserted.
    Ok(self.connection.as_mut().unwrap())
  }

  async fn roundtrip(&mut self, request: LockRequest) -> Result<LockResponse> {
    match self.exchange(request).await {
      Ok(response) if response.result == LockCommandResult::Success => Ok(response),
      Ok(response) => Err(Error::Rejected {
        result: response.result,
        reason: response.reason,
      }),
      Err(e) => {
        // Any transport failure leaves the stream in an unknown state;
        // drop it so the next call starts from a clean connection.
        self.connection = None;
        Err(e)
      },
    }
  }

  async fn exchange(&mut self, request: LockRequest) -> Result<LockResponse> {
    let connection = self.connect().await?;

    let frame = connection.encoder.encode(&request)?;
    connection.stream.write_all(&frame).await?;

    let mut buffer = BytesMut::with_capacity(1024);
    loop {
      if connection.stream.read_buf(&mut buffer).await? == 0 {
        return Err(Error::Disconnected);
      }
      let mut responses = connection.decoder.decode_data(&buffer)?;
      buffer.clear();
      if let Some(response) = responses.pop() {
        return Ok(response);
      }
    }
  }
}
