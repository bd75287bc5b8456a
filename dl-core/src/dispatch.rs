// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./dispatch_test.rs"]
mod dispatch_test;

use crate::registry::{Acquired, LockRegistry, RegistryError};
use crate::session::SessionId;
use dl_api::{LockCommand, LockCommandResult, LockRequest, LockResponse};

/// Validates a decoded request, routes it to the registry and builds the
/// response envelope.
///
/// Every outcome is converted into a result code here; nothing crosses this
/// boundary as an error. Version gating happens before this function: a
/// request from a newer protocol major version never reaches it.
pub fn process_request(
  registry: &LockRegistry,
  session: SessionId,
  request: &LockRequest,
) -> LockResponse {
  let mut response = LockResponse {
    request: request.clone(),
    result: LockCommandResult::Success,
    reason: String::new(),
    is_locked: false,
  };
  // The echo always advertises our own protocol version, not the caller's.
  response.request.version_major = dl_api::VERSION_MAJOR;
  response.request.version_minor = dl_api::VERSION_MINOR;

  if !dl_api::is_valid_lock_name(&request.lock_name) {
    response.result = LockCommandResult::BadRequest;
    response.reason = "invalid lock name".to_string();
    return response;
  }

  let name = request.lock_name.as_str();
  let outcome = match request.command {
    LockCommand::Acquire => registry.acquire(session, name).map(|acquired| {
      if acquired == Acquired::AlreadyHeld {
        response.reason = "no-op".to_string();
      }
    }),
    LockCommand::Release => registry.release(session, name),
    LockCommand::Verify => registry.verify(session, name),
    LockCommand::Peek => registry.peek(name).map(|locked| {
      response.is_locked = locked;
    }),
    LockCommand::Invalid => {
      response.result = LockCommandResult::BadRequest;
      response.reason = "unknown command".to_string();
      return response;
    },
  };

  if let Err(e) = outcome {
    response.result = match &e {
      RegistryError::NotFound
      | RegistryError::HeldByOtherProcess
      | RegistryError::HeldByOtherSession => LockCommandResult::Failed,
      RegistryError::Internal(_) | RegistryError::Fault(_) => LockCommandResult::InternalError,
    };
    response.reason = e.to_string();
  }
  response
}
