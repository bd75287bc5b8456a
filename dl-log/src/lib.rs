// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

const DEFAULT_FILTER_RULES: &str = "info";

/// Initialize stderr logging for a binary. This can only be called once and
/// should be called as early as possible in the program.
///
/// The filter honors `RUST_LOG`; `log` facade macros used across the
/// workspace are picked up through tracing-subscriber's log bridge.
pub fn initialize() {
  // Gate ANSI on whether DIRLOCK_LOG_ANSI is set. This avoids using the
  // feature by default (e.g. when stderr is a pipe) but allows it to be
  // enabled for local development should the user want it.
  let stderr = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_ansi(std::env::var("DIRLOCK_LOG_ANSI").is_ok())
    .with_line_number(true)
    .with_thread_ids(true)
    .compact();

  let filter = EnvFilter::new(
    std::env::var("RUST_LOG")
      .as_deref()
      .unwrap_or(DEFAULT_FILTER_RULES),
  );

  Registry::default().with(filter).with(stderr).init();
}
