// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! dirlockd: serves named advisory locks backed by files in a shared
//! directory, so that independent processes (including sibling daemons on
//! other hosts mounting the same directory) can coordinate exclusive access
//! to resources.

use anyhow::Context;
use clap::Parser;
use dl_core::LockRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};

mod connection;
mod server;

#[derive(Debug, Parser)]
#[command(version, about = "Named-lock coordination daemon", long_about = None)]
struct Options {
  /// Address to listen on.
  #[clap(
    env = "DIRLOCK_ADDRESS",
    long,
    short = 'a',
    default_value = "127.0.0.1:13123"
  )]
  address: String,

  /// Directory where lock backing files are created.
  #[clap(env = "DIRLOCK_DIRECTORY", long, short = 'd', default_value = ".")]
  directory: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dl_log::initialize();
  let options = Options::parse();

  let directory = options
    .directory
    .canonicalize()
    .with_context(|| format!("invalid lock directory '{}'", options.directory.display()))?;
  anyhow::ensure!(
    directory.is_dir(),
    "lock directory '{}' is not a directory",
    directory.display()
  );

  // Every held lock pins one descriptor, so a low limit directly caps the
  // number of locks this daemon can serve.
  match file_descriptor_limit() {
    Ok(limit) if limit <= 1024 => {
      log::warn!("maximum number of open files is low ({limit})");
    },
    Ok(_) => {},
    Err(e) => log::warn!("could not read open file limit: {e}"),
  }

  let listener = TcpListener::bind(&options.address)
    .await
    .with_context(|| format!("failed to listen on {}", options.address))?;
  let address = listener
    .local_addr()
    .context("failed to read listener address")?;
  // Printed unconditionally, regardless of log filtering, so wrappers and
  // tests can discover an ephemeral port.
  eprintln!("dirlockd: listening on {address}");
  log::info!("serving lock directory {}", directory.display());

  let registry = Arc::new(LockRegistry::new(directory));
  server::run(listener, registry, graceful_shutdown()).await;
  log::info!("shut down cleanly");
  Ok(())
}

// Resolves when SIGTERM or SIGINT is received.
async fn graceful_shutdown() {
  let mut sigterm_stream = signal(SignalKind::terminate()).unwrap();
  let mut sigint_stream = signal(SignalKind::interrupt()).unwrap();
  tokio::select! {
    _ = sigterm_stream.recv() => {},
    _ = sigint_stream.recv() => {},
  }

  log::info!("received SIGTERM or SIGINT");
}

fn file_descriptor_limit() -> std::io::Result<libc::rlim_t> {
  let mut limit = libc::rlimit {
    rlim_cur: 0,
    rlim_max: 0,
  };
  // Safety: getrlimit writes into the struct we own; no other effects.
  if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == -1 {
    return Err(std::io::Error::last_os_error());
  }
  Ok(limit.rlim_cur)
}
