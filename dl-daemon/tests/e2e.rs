// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! End-to-end tests driving the real `dirlockd` binary over real sockets.
//! Each daemon is a separate OS process, so these also exercise the
//! cross-process guarantees of the underlying record locks, which no
//! in-process test can reach.

use assert_matches::assert_matches;
use bytes::BytesMut;
use dl_api::{LockCommand, LockCommandResult, LockRequest, LockResponse};
use dl_client::{Client, Error};
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct Daemon {
  child: Child,
  address: SocketAddr,
}

impl Daemon {
  fn start(directory: &Path) -> Self {
    let mut child = Command::new(env!("CARGO_BIN_EXE_dirlockd"))
      .arg("--address")
      .arg("127.0.0.1:0")
      .arg("--directory")
      .arg(directory)
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .spawn()
      .unwrap();

    // The daemon announces its bound (ephemeral) port on stderr.
    let mut reader = BufReader::new(child.stderr.take().unwrap());
    let mut line = String::new();
    let address = loop {
      line.clear();
      assert_ne!(
        reader.read_line(&mut line).unwrap(),
        0,
        "daemon exited before announcing its address"
      );
      if let Some(address) = line.trim().strip_prefix("dirlockd: listening on ") {
        break address.parse().unwrap();
      }
    };

    // Keep draining stderr so the daemon can never block on a full pipe.
    std::thread::spawn(move || {
      let mut sink = String::new();
      while reader.read_line(&mut sink).map(|n| n > 0).unwrap_or(false) {
        sink.clear();
      }
    });

    Self { child, address }
  }

  fn client(&self) -> Client {
    Client::new(self.address)
  }
}

impl Drop for Daemon {
  fn drop(&mut self) {
    let _ = self.child.kill();
    let _ = self.child.wait();
  }
}

// Disconnect cleanup runs when the daemon observes the closed socket, which
// is asynchronous from the client's point of view.
async fn acquire_with_retry(client: &mut Client, name: &str) -> dl_client::Lock {
  for _ in 0 .. 100 {
    match client.acquire(name).await {
      Ok(lock) => return lock,
      Err(Error::Rejected { .. }) => tokio::time::sleep(Duration::from_millis(20)).await,
      Err(e) => panic!("unexpected error acquiring {name}: {e}"),
    }
  }
  panic!("{name} was never reclaimed");
}

#[tokio::test]
async fn test_end_to_end_scenario() {
  let directory = TempDir::new().unwrap();
  let daemon = Daemon::start(directory.path());

  let mut a = daemon.client();
  let mut b = daemon.client();

  let job1 = a.acquire("job1").await.unwrap();

  let err = b.acquire("job1").await.unwrap_err();
  assert_matches!(
    err,
    Error::Rejected {
      result: LockCommandResult::Failed,
      ref reason,
    } if reason == "resource acquired by different process"
  );
  assert!(b.is_locked("job1").await.unwrap());

  a.release(job1).await.unwrap();

  let job1 = b.acquire("job1").await.unwrap();
  b.verify(&job1).await.unwrap();
  b.close().await.unwrap();

  let mut c = daemon.client();
  let job1 = acquire_with_retry(&mut c, "job1").await;
  c.release(job1).await.unwrap();
}

#[tokio::test]
async fn test_contention_between_sibling_daemons() {
  // Two daemon processes over one shared directory: exclusion must hold
  // through the record locks alone, since neither registry knows about the
  // other.
  let directory = TempDir::new().unwrap();
  let first = Daemon::start(directory.path());
  let second = Daemon::start(directory.path());

  let mut a = first.client();
  let mut b = second.client();

  let held = a.acquire("shared-job").await.unwrap();

  let err = b.acquire("shared-job").await.unwrap_err();
  assert_matches!(
    err,
    Error::Rejected {
      result: LockCommandResult::Failed,
      ref reason,
    } if reason == "resource acquired by different process"
  );

  // The second daemon never registered the name, so this peek goes through
  // the kernel probe and sees the foreign process's lock.
  assert!(b.is_locked("shared-job").await.unwrap());

  a.release(held).await.unwrap();

  assert!(!b.is_locked("shared-job").await.unwrap());
  let held = b.acquire("shared-job").await.unwrap();
  b.release(held).await.unwrap();
}

#[tokio::test]
async fn test_daemon_death_releases_locks() {
  let directory = TempDir::new().unwrap();
  let first = Daemon::start(directory.path());
  let second = Daemon::start(directory.path());

  let mut a = first.client();
  let _held = a.acquire("doomed").await.unwrap();

  // Kill the holding daemon outright; the kernel drops its record locks
  // with the process, leaving only an orphaned backing file behind.
  drop(first);

  let mut b = second.client();
  let held = acquire_with_retry(&mut b, "doomed").await;
  b.release(held).await.unwrap();
}

#[tokio::test]
async fn test_preexisting_file_does_not_block_acquire() {
  let directory = TempDir::new().unwrap();
  std::fs::write(directory.path().join("stale.lck"), b"left behind").unwrap();

  let daemon = Daemon::start(directory.path());
  let mut client = daemon.client();

  let lock = client.acquire("stale").await.unwrap();
  client.release(lock).await.unwrap();
  assert!(!directory.path().join("stale.lck").exists());
}

#[tokio::test]
async fn test_newer_major_version_is_silently_dropped() {
  let directory = TempDir::new().unwrap();
  let daemon = Daemon::start(directory.path());

  let mut stream = tokio::net::TcpStream::connect(daemon.address).await.unwrap();
  let mut encoder = dl_codec::Encoder::<LockRequest>::new();
  let mut decoder = dl_codec::Decoder::<LockResponse>::new();

  // First a request from the future: it must produce no response.
  let mut from_the_future = LockRequest::new(LockCommand::Acquire, "future-job");
  from_the_future.version_major = dl_api::VERSION_MAJOR + 1;
  stream
    .write_all(&encoder.encode(&from_the_future).unwrap())
    .await
    .unwrap();

  // Then a current-version request; the first (and only) response we get
  // back must belong to it.
  let current = LockRequest::new(LockCommand::Peek, "present-job");
  stream
    .write_all(&encoder.encode(&current).unwrap())
    .await
    .unwrap();

  let mut buffer = BytesMut::new();
  let response = loop {
    assert_ne!(stream.read_buf(&mut buffer).await.unwrap(), 0);
    let mut responses = decoder.decode_data(&buffer).unwrap();
    buffer.clear();
    if let Some(response) = responses.pop() {
      break response;
    }
  };
  assert_eq!(response.request.lock_name, "present-job");
  assert_eq!(response.request.command, LockCommand::Peek);
  assert_eq!(response.result, LockCommandResult::Success);
  assert!(!response.is_locked);

  // The dropped acquire must not have registered anything.
  let mut client = daemon.client();
  let lock = client.acquire("future-job").await.unwrap();
  client.release(lock).await.unwrap();
}
