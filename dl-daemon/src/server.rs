// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::connection;
use dl_core::LockRegistry;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

// Manual accept loop with graceful shutdown: one task per connection, all
// signaled through a watch channel and joined before returning. Accept
// failures are transient (e.g. EMFILE under descriptor pressure) and never
// stop the daemon.
pub async fn run(
  listener: TcpListener,
  registry: Arc<LockRegistry>,
  shutdown: impl Future<Output = ()>,
) {
  tokio::pin!(shutdown);

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let mut connections = JoinSet::new();

  loop {
    tokio::select! {
      result = listener.accept() => {
        match result {
          Ok((stream, peer)) => {
            connections.spawn(connection::handle(
              registry.clone(),
              stream,
              peer,
              shutdown_rx.clone(),
            ));
          },
          Err(e) => log::warn!("listener accept failure: {e}"),
        }
      },
      () = &mut shutdown => break,
    }
  }

  drop(listener);
  let _ = shutdown_tx.send(true);
  if !connections.is_empty() {
    log::info!("draining {} active connection(s)", connections.len());
  }
  while connections.join_next().await.is_some() {}
}
