// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use bytes::BytesMut;
use dl_api::{LockRequest, LockResponse};
use dl_codec::{Decoder, Encoder};
use dl_core::{LockRegistry, SessionId, process_request};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

// Serves one connection for its whole lifetime. The connection is the
// session: exactly one disconnect runs on every exit path, reclaiming
// whatever the session still holds.
pub async fn handle(
  registry: Arc<LockRegistry>,
  mut stream: TcpStream,
  peer: SocketAddr,
  mut shutdown: watch::Receiver<bool>,
) {
  let session = SessionId::next();
  log::info!("session {session} connected from {peer}");

  let mut decoder = Decoder::<LockRequest>::new();
  let mut encoder = Encoder::<LockResponse>::new();
  let mut buffer = BytesMut::with_capacity(4096);

  'serve: loop {
    tokio::select! {
      result = stream.read_buf(&mut buffer) => {
        match result {
          // EOF: the peer hung up.
          Ok(0) => break,
          Ok(_) => {},
          Err(e) => {
            log::debug!("session {session}: read failure: {e}");
            break;
          },
        }
      },
      _ = shutdown.changed() => break,
    }

    let requests = match decoder.decode_data(&buffer) {
      Ok(requests) => requests,
      Err(e) => {
        log::debug!("session {session}: malformed frame: {e}");
        break;
      },
    };
    buffer.clear();

    for request in requests {
      // A request from a newer protocol major version gets no response at
      // all; minor version differences are fine.
      if request.version_major > dl_api::VERSION_MAJOR {
        log::debug!(
          "session {session}: dropping {} request with protocol version {}.{}",
          request.command,
          request.version_major,
          request.version_minor
        );
        continue;
      }

      log::trace!("session {session}: {} {}", request.command, request.lock_name);
      let response = process_request(&registry, session, &request);

      let frame = match encoder.encode(&response) {
        Ok(frame) => frame,
        Err(e) => {
          log::warn!("session {session}: failed to encode response: {e}");
          break 'serve;
        },
      };
      if let Err(e) = stream.write_all(&frame).await {
        log::debug!("session {session}: write failure: {e}");
        break 'serve;
      }
    }
  }

  let reclaimed = registry.disconnect(session);
  if reclaimed > 0 {
    log::info!("session {session} disconnected, reclaimed {reclaimed} lock(s)");
  } else {
    log::debug!("session {session} disconnected");
  }
}
