// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Wire protocol model shared by the daemon and its clients: commands,
//! results, the request/response envelopes and lock name validation.


use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Major version of the protocol. Requests carrying a higher major version
/// are silently dropped by the daemon's transport layer.
pub const VERSION_MAJOR: u8 = 0;
/// Minor version of the protocol. Never checked, informational only.
pub const VERSION_MINOR: u8 = 1;

static VALID_LOCK_NAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new("^[A-Za-z0-9._-]+$").unwrap());

/// Returns whether `name` is an acceptable lock name. Names become file
/// names inside the daemon's lock directory, so anything outside
/// `[A-Za-z0-9._-]+` is rejected before dispatch.
#[must_use]
pub fn is_valid_lock_name(name: &str) -> bool {
  VALID_LOCK_NAME.is_match(name)
}

//
// LockCommand
//

/// A lock command identifier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum LockCommand {
  /// Reserved zero value so that a zero-initialized request is never
  /// mistaken for a real command. Rejected by the dispatcher.
  Invalid,
  /// Query the current status of a named lock.
  Peek,
  /// Request acquisition of a named lock.
  Acquire,
  /// Request release of a named lock previously acquired in this session.
  Release,
  /// Verify that a named lock is held by the caller and still healthy.
  Verify,
}

impl std::fmt::Display for LockCommand {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Invalid => "INVALID_LOCK_COMMAND",
      Self::Peek => "Peek",
      Self::Acquire => "Acquire",
      Self::Release => "Release",
      Self::Verify => "Verify",
    };
    write!(f, "{s}")
  }
}

//
// LockCommandResult
//

/// The result of a lock command.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum LockCommandResult {
  /// Reserved zero value, never produced by the daemon.
  Invalid,
  /// The command failed for an expected, recoverable reason carried in the
  /// response's reason string.
  Failed,
  /// The command succeeded.
  Success,
  /// The request parameters are invalid (malformed name, unknown command).
  BadRequest,
  /// An unexpected OS or I/O error happened while serving the command.
  InternalError,
}

impl std::fmt::Display for LockCommandResult {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Invalid => "INVALID_LOCK_COMMAND_RESULT",
      Self::Failed => "Failed",
      Self::Success => "Success",
      Self::BadRequest => "BadRequest",
      Self::InternalError => "InternalError",
    };
    write!(f, "{s}")
  }
}

//
// LockRequest
//

/// A lock command request envelope.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LockRequest {
  pub version_major: u8,
  pub version_minor: u8,
  pub command: LockCommand,
  pub lock_name: String,
}

impl LockRequest {
  /// Builds a request stamped with this library's protocol version.
  #[must_use]
  pub fn new(command: LockCommand, lock_name: impl Into<String>) -> Self {
    Self {
      version_major: VERSION_MAJOR,
      version_minor: VERSION_MINOR,
      command,
      lock_name: lock_name.into(),
    }
  }
}

//
// LockResponse
//

/// A response to a [`LockRequest`]. The embedded request echo always carries
/// the daemon's own version numbers, never the client's.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LockResponse {
  pub request: LockRequest,
  pub result: LockCommandResult,
  /// Extra human-readable text provided with failures and errors.
  pub reason: String,
  /// Only meaningful for `Peek` responses.
  pub is_locked: bool,
}
