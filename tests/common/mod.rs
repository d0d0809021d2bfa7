#![allow(dead_code)]

use std::{
  ptr::NonNull,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use strata::{Config, PageSource, Span, SystemPages};

pub fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

/// 64MB growth steps and no background release, so tests control when pages go back.
pub fn quiet_config() -> Config {
  Config {
    min_system_bytes: 64 << 20,
    release_rate_pages: 1 << 30,
    ..Config::default()
  }
}

pub fn span<'a>(s: NonNull<Span>) -> &'a Span {
  unsafe { s.as_ref() }
}

/// System pages, with counters and switches for what the heap asks of it.
#[derive(Clone, Default)]
pub struct CountingPages {
  pub reservations_left: Option<Arc<AtomicUsize>>,
  pub releases: Arc<AtomicUsize>,
  pub refuse_release: bool,
}

impl CountingPages {
  /// A source that maps `n` times and then refuses.
  pub fn limited(n: usize) -> Self {
    Self {
      reservations_left: Some(Arc::new(AtomicUsize::new(n))),
      ..Self::default()
    }
  }
}

impl PageSource for CountingPages {
  fn reserve(&self, bytes: usize) -> Option<NonNull<u8>> {
    if let Some(left) = &self.reservations_left {
      left.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1)).ok()?;
    }
    SystemPages.reserve(bytes)
  }

  unsafe fn release(&self, addr: NonNull<u8>, bytes: usize) -> bool {
    if self.refuse_release {
      return false;
    }
    self.releases.fetch_add(1, Ordering::Relaxed);
    unsafe { SystemPages.release(addr, bytes) }
  }

  unsafe fn unmap(&self, addr: NonNull<u8>, bytes: usize) {
    unsafe { SystemPages.unmap(addr, bytes) }
  }
}
