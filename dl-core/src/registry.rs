// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./registry_test.rs"]
mod registry_test;

use crate::session::SessionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Extension of the backing file created for each held lock name.
pub const LOCK_FILE_EXT: &str = ".lck";

//
// RegistryError
//

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  /// The name is not registered with this daemon.
  #[error("lock not found")]
  NotFound,
  /// The OS-level lock is held elsewhere, or the name is registered to a
  /// different session of this daemon.
  #[error("resource acquired by different process")]
  HeldByOtherProcess,
  /// The name is registered, but to a different session than the caller's.
  #[error("resource acquired through a different session")]
  HeldByOtherSession,
  /// An unexpected OS or I/O failure; carries the underlying error text.
  #[error("{0}")]
  Internal(String),
  /// The registry's own bookkeeping is inconsistent. This is a bug in the
  /// coordinator, never a legitimate contention outcome.
  #[error("registry invariant violated: {0}")]
  Fault(&'static str),
}

impl RegistryError {
  fn internal(e: impl std::fmt::Display) -> Self {
    Self::Internal(e.to_string())
  }
}

/// Outcome of a successful acquire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acquired {
  /// The lock was newly taken for the calling session.
  Fresh,
  /// The calling session already held the lock; nothing was done.
  AlreadyHeld,
}

//
// LockRegistry
//

// The two maps must always be observed as a consistent pair: every name in
// `names` has exactly one entry in `owners` keyed by its descriptor, and a
// handle is only ever present together with a live record lock on its
// backing file.
#[derive(Default)]
struct RegistryInner {
  names: HashMap<String, File>,
  owners: HashMap<RawFd, SessionId>,
}

/// Maps lock names to held OS record locks and held locks to the session
/// that owns them.
///
/// All operations are try-once: contention is reported immediately, never
/// queued, so no caller ever blocks waiting for another session. Mutating
/// paths use an optimistic read probe followed by a write-locked re-check,
/// which keeps the common "already owned" case off the write lock. Holding
/// the write lock across the `fcntl` calls is deliberate: the syscalls are
/// fast and local, and it prevents two sessions from racing to create the
/// same name's handle.
pub struct LockRegistry {
  directory: PathBuf,
  inner: RwLock<RegistryInner>,
}

impl LockRegistry {
  #[must_use]
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      inner: RwLock::default(),
    }
  }

  fn backing_path(&self, name: &str) -> PathBuf {
    self.directory.join(format!("{name}{LOCK_FILE_EXT}"))
  }

  fn fault(message: &'static str) -> RegistryError {
    log::error!("{message}");
    RegistryError::Fault(message)
  }

  // The name is already registered: report based on who owns it. The
  // existing OS lock is left untouched on a self re-acquire; re-asserting
  // it is exactly what verify() is for.
  fn reacquire(
    inner: &RegistryInner,
    fd: RawFd,
    session: SessionId,
  ) -> Result<Acquired, RegistryError> {
    match inner.owners.get(&fd) {
      None => Err(Self::fault("ownership record missing for registered lock")),
      Some(owner) if *owner == session => Ok(Acquired::AlreadyHeld),
      Some(_) => Err(RegistryError::HeldByOtherProcess),
    }
  }

  fn ensure_owned(
    inner: &RegistryInner,
    fd: RawFd,
    session: SessionId,
  ) -> Result<(), RegistryError> {
    match inner.owners.get(&fd) {
      None => Err(Self::fault("ownership record missing for registered lock")),
      Some(owner) if *owner != session => Err(RegistryError::HeldByOtherSession),
      Some(_) => Ok(()),
    }
  }

  /// Acquires `name` for `session`, creating the backing file on first use.
  pub fn acquire(&self, session: SessionId, name: &str) -> Result<Acquired, RegistryError> {
    {
      let inner = self.inner.read();
      if let Some(file) = inner.names.get(name) {
        return Self::reacquire(&inner, file.as_raw_fd(), session);
      }
    }

    let mut inner = self.inner.write();
    // Another session may have registered the name between dropping the
    // read lock and taking the write lock.
    if let Some(file) = inner.names.get(name) {
      return Self::reacquire(&inner, file.as_raw_fd(), session);
    }

    // A pre-existing file is fine: an orphan left behind by an unclean
    // disconnect carries no OS lock and locks like a fresh file.
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .mode(0o664)
      .open(self.backing_path(name))
      .map_err(RegistryError::internal)?;

    match dl_fcntl::try_exclusive_lock(&file) {
      Err(dl_fcntl::Error::Contended) => Err(RegistryError::HeldByOtherProcess),
      Err(dl_fcntl::Error::Io(e)) => Err(RegistryError::internal(e)),
      Ok(()) => {
        inner.owners.insert(file.as_raw_fd(), session);
        inner.names.insert(name.to_string(), file);
        Ok(Acquired::Fresh)
      },
    }
  }

  /// Releases `name`, closing the handle and deleting the backing file.
  pub fn release(&self, session: SessionId, name: &str) -> Result<(), RegistryError> {
    {
      let inner = self.inner.read();
      let Some(file) = inner.names.get(name) else {
        return Err(RegistryError::NotFound);
      };
      Self::ensure_owned(&inner, file.as_raw_fd(), session)?;
    }

    let mut inner = self.inner.write();
    // Presence and ownership may both have changed while the read lock was
    // dropped.
    let Some(file) = inner.names.get(name) else {
      return Err(RegistryError::NotFound);
    };
    let fd = file.as_raw_fd();
    Self::ensure_owned(&inner, fd, session)?;

    // An unlock failure keeps the registry entry: a lock that failed to
    // unlock must not silently disappear from the bookkeeping.
    dl_fcntl::unlock(file).map_err(RegistryError::internal)?;

    inner.names.remove(name);
    inner.owners.remove(&fd);

    // The in-memory state is already purged; a failed delete merely leaves
    // an orphaned, unlocked file that the next acquirer reuses.
    std::fs::remove_file(self.backing_path(name)).map_err(RegistryError::internal)?;
    Ok(())
  }

  /// Reports whether `name` is currently locked, by this daemon or by any
  /// other process using the same directory.
  pub fn peek(&self, name: &str) -> Result<bool, RegistryError> {
    let inner = self.inner.read();
    if inner.names.contains_key(name) {
      // Registered names are held by this process. The kernel probe below
      // would not even see our own locks (record locks never conflict
      // within one process), so the registry is authoritative here.
      return Ok(true);
    }

    // Unregistered names may still be locked by a foreign process, e.g. a
    // sibling daemon on another host sharing the directory over NFS.
    let file = match File::open(self.backing_path(name)) {
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
      Err(e) => return Err(RegistryError::internal(e)),
      Ok(file) => file,
    };
    dl_fcntl::query_locked(&file).map_err(RegistryError::internal)
  }

  /// Confirms that `session` still holds `name` and that the descriptor is
  /// healthy by re-asserting the record lock.
  ///
  /// The kernel always grants a re-lock to the process that already holds
  /// it, so this detects I/O-level descriptor rot, not contention from
  /// other processes.
  pub fn verify(&self, session: SessionId, name: &str) -> Result<(), RegistryError> {
    {
      let inner = self.inner.read();
      let Some(file) = inner.names.get(name) else {
        return Err(RegistryError::NotFound);
      };
      Self::ensure_owned(&inner, file.as_raw_fd(), session)?;
    }

    let inner = self.inner.write();
    let Some(file) = inner.names.get(name) else {
      return Err(RegistryError::NotFound);
    };
    Self::ensure_owned(&inner, file.as_raw_fd(), session)?;

    match dl_fcntl::try_exclusive_lock(file) {
      Ok(()) => Ok(()),
      Err(dl_fcntl::Error::Contended) => Err(RegistryError::HeldByOtherProcess),
      Err(dl_fcntl::Error::Io(e)) => Err(RegistryError::internal(e)),
    }
  }

  /// Reclaims everything owned by a session whose connection ended.
  ///
  /// Closing each handle makes the kernel drop its record lock; the backing
  /// files are deliberately left on disk (only an explicit release deletes
  /// them) and are transparently reusable. Returns the number of locks
  /// reclaimed. The scan is linear in the number of held locks, which is
  /// fine for a once-per-disconnect operation.
  pub fn disconnect(&self, session: SessionId) -> usize {
    let mut inner = self.inner.write();

    let fds: Vec<RawFd> = inner
      .owners
      .iter()
      .filter_map(|(fd, owner)| (*owner == session).then_some(*fd))
      .collect();
    if fds.is_empty() {
      return 0;
    }

    for fd in &fds {
      inner.owners.remove(fd);
    }

    let names: Vec<String> = inner
      .names
      .iter()
      .filter_map(|(name, file)| fds.contains(&file.as_raw_fd()).then(|| name.clone()))
      .collect();
    for name in &names {
      inner.names.remove(name);
    }
    names.len()
  }

  // Drops the ownership record for a registered name, simulating the
  // bookkeeping corruption the Fault variant exists to report.
  #[cfg(test)]
  pub(crate) fn forget_owner(&self, name: &str) {
    let mut inner = self.inner.write();
    let fd = inner.names.get(name).map(AsRawFd::as_raw_fd);
    if let Some(fd) = fd {
      inner.owners.remove(&fd);
    }
  }
}
