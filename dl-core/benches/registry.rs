// dirlock - a named-lock coordination daemon
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use criterion::{Criterion, criterion_group, criterion_main};
use dl_core::{LockRegistry, SessionId};
use std::hint::black_box;

fn registry_benches(c: &mut Criterion) {
  let directory = tempfile::TempDir::new().unwrap();
  let registry = LockRegistry::new(directory.path());
  let session = SessionId::next();

  c.bench_function("acquire_release_cycle", |b| {
    b.iter(|| {
      registry.acquire(session, black_box("bench")).unwrap();
      registry.release(session, black_box("bench")).unwrap();
    });
  });

  registry.acquire(session, "held").unwrap();
  c.bench_function("reacquire_fast_path", |b| {
    b.iter(|| registry.acquire(session, black_box("held")).unwrap());
  });

  c.bench_function("peek_registered", |b| {
    b.iter(|| registry.peek(black_box("held")).unwrap());
  });

  c.bench_function("peek_unregistered", |b| {
    b.iter(|| registry.peek(black_box("missing")).unwrap());
  });
}

criterion_group!(benches, registry_benches);
criterion_main!(benches);
