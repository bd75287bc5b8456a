// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! POSIX advisory record locking via the `fcntl` family.
//!
//! Record locks (as opposed to `flock`) are coherent over NFS, which is what
//! allows multiple daemons on different hosts to coordinate through a shared
//! directory. Their semantics are process-scoped:
//!
//! - A process re-locking a descriptor it already holds always succeeds
//!   (`F_SETLK` replaces the existing lock).
//! - `F_GETLK` reports only locks held by *other* processes; a process never
//!   conflicts with itself.
//! - From fcntl(2): record locks are automatically released when the process
//!   terminates or closes any descriptor referring to the locked file.
//!
//! Callers that need per-session exclusion inside one process must layer
//! their own bookkeeping on top; this module only talks to the kernel.

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// A conflicting record lock is held by another process.
  #[error("resource is locked by another process")]
  Contended,
  /// Any other failure of the underlying syscall.
  #[error(transparent)]
  Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn whole_file_lock(lock_type: libc::c_short) -> libc::flock {
  // A zeroed flock with l_len == 0 covers the whole file regardless of size.
  let mut fl: libc::flock = unsafe { std::mem::zeroed() };
  fl.l_type = lock_type;
  #[allow(clippy::cast_possible_truncation)]
  {
    fl.l_whence = libc::SEEK_SET as libc::c_short;
  }
  fl
}

fn set_lock(file: &File, lock_type: libc::c_short) -> Result<()> {
  let fl = whole_file_lock(lock_type);

  // Safety: the descriptor is valid for the lifetime of `file` and the flock
  // struct outlives the call.
  let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &raw const fl) };
  if rc == -1 {
    let e = io::Error::last_os_error();
    // POSIX allows either errno for a held lock, so both must be checked.
    return match e.raw_os_error() {
      Some(libc::EAGAIN | libc::EACCES) => Err(Error::Contended),
      _ => Err(Error::Io(e)),
    };
  }
  Ok(())
}

/// Attempts a non-blocking exclusive record lock over the whole file.
///
/// The file must be open for writing. Succeeds immediately when the calling
/// process already holds the lock on this descriptor.
pub fn try_exclusive_lock(file: &File) -> Result<()> {
  set_lock(file, libc::F_WRLCK as libc::c_short)
}

/// Releases a record lock previously taken with [`try_exclusive_lock`].
pub fn unlock(file: &File) -> Result<()> {
  set_lock(file, libc::F_UNLCK as libc::c_short)
}

/// Reports whether any *other* process holds a record lock on the file,
/// without acquiring anything.
///
/// The probe asks the kernel whether a whole-file write lock could be
/// placed; locks held by the calling process never conflict, so a `false`
/// here does not mean the file is free for other processes.
pub fn query_locked(file: &File) -> Result<bool> {
  let mut fl = whole_file_lock(libc::F_WRLCK as libc::c_short);

  // Safety: same as set_lock; F_GETLK writes the conflicting lock (if any)
  // back into `fl`.
  let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &raw mut fl) };
  if rc == -1 {
    return Err(Error::Io(io::Error::last_os_error()));
  }

  // The conflicting lock may be a read or a write lock; the caller only
  // wants to know whether the file is locked at all.
  Ok(fl.l_type != libc::F_UNLCK as libc::c_short)
}
