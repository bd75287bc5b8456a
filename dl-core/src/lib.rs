// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! The lock coordinator: maps lock names onto OS advisory record locks,
//! tracks which session owns each held lock, and dispatches validated
//! requests onto the registry.

pub mod dispatch;
pub mod registry;
pub mod session;

pub use dispatch::process_request;
pub use registry::{Acquired, LOCK_FILE_EXT, LockRegistry, RegistryError};
pub use session::SessionId;
