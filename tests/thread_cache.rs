mod common;

use std::ptr::NonNull;

use common::{init_logger, quiet_config};
use rand::{Rng, SeedableRng, rngs::StdRng};
use strata::{
  Allocator, Config, Error, InvalidFreeReason, NUM_CLASSES, batch_size_for_class, class_for_size, size_for_class,
};

const K: usize = 1 << 10;

#[test]
fn threads_count_their_own_bytes() {
  init_logger();
  let alloc = Allocator::new(quiet_config());

  std::thread::scope(|s| {
    for _ in 0..10 {
      s.spawn(|| {
        let mut cache = alloc.thread_cache();
        let a = cache.allocate(1).unwrap();
        assert_eq!(cache.total_allocated_bytes(), 8);
        let b = cache.allocate(2).unwrap();
        let c = cache.allocate(2).unwrap();
        assert_eq!(cache.total_allocated_bytes(), 40);

        unsafe {
          cache.deallocate(a, 1).unwrap();
          assert_eq!(cache.total_freed_bytes(), 8);
          cache.deallocate(b, 2).unwrap();
          cache.deallocate(c, 2).unwrap();
        }
        assert_eq!(cache.total_freed_bytes(), 40);
      });
    }
  });

  assert_eq!(alloc.registry().stats().threads, 0);
  alloc.check_state().unwrap();
}

#[test]
fn unknown_classes_are_rejected() {
  let alloc = Allocator::new(quiet_config());
  let mut cache = alloc.thread_cache();
  assert!(matches!(cache.allocate(0), Err(Error::InvalidRequest(_))));
  assert!(matches!(cache.allocate(NUM_CLASSES), Err(Error::InvalidRequest(_))));
  assert_eq!(cache.total_allocated_bytes(), 0);
}

#[test]
fn random_sizes_keep_their_contents() {
  let alloc = Allocator::new(quiet_config());
  let mut cache = alloc.thread_cache();
  let mut rng = StdRng::seed_from_u64(7);
  let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

  for round in 0..20_000u32 {
    if live.is_empty() || rng.gen_bool(0.55) {
      let size = rng.gen_range(1..=50);
      let p = alloc.allocate(&mut cache, size).unwrap();
      let tag = round as u8;
      unsafe { p.as_ptr().write_bytes(tag, size) };
      live.push((p, size, tag));
    } else {
      let (p, size, tag) = live.swap_remove(rng.gen_range(0..live.len()));
      let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
      assert!(bytes.iter().all(|&b| b == tag));
      unsafe { alloc.deallocate(&mut cache, p).unwrap() };
    }
  }
  for (p, _, _) in live {
    unsafe { alloc.deallocate(&mut cache, p).unwrap() };
  }
  alloc.check_state().unwrap();
  drop(cache);
  alloc.check_state().unwrap();
}

#[test]
fn freeing_the_last_freed_object_again_is_rejected() {
  let alloc = Allocator::new(quiet_config());
  let mut cache = alloc.thread_cache();
  let class = 2;
  let size = size_for_class(class);
  let p = cache.allocate(class).unwrap();
  let q = cache.allocate(class).unwrap();

  unsafe { cache.deallocate(p, class).unwrap() };
  let before = (cache.list(class).len(), cache.used_bytes(), cache.total_freed_bytes());
  assert_eq!(
    unsafe { cache.deallocate(p, class) },
    Err(Error::InvalidFree {
      addr: p.as_ptr() as usize,
      reason: InvalidFreeReason::DoubleFree,
    })
  );
  assert_eq!((cache.list(class).len(), cache.used_bytes(), cache.total_freed_bytes()), before);
  assert_eq!(cache.total_freed_bytes(), size as u64);

  unsafe { cache.deallocate(q, class).unwrap() };
  cache.flush();
  alloc.check_state().unwrap();
}

#[test]
fn lists_grow_one_object_per_refill() {
  let alloc = Allocator::new(quiet_config());
  let mut cache = alloc.thread_cache();
  let class = 3;
  let size = size_for_class(class);

  assert_eq!(cache.list(class).max_length(), 1);
  let mut held = vec![cache.allocate(class).unwrap()];
  assert_eq!(cache.list(class).max_length(), 2);
  assert_eq!(cache.list(class).len(), 0);

  held.push(cache.allocate(class).unwrap());
  assert_eq!(cache.list(class).max_length(), 3);
  assert_eq!(cache.list(class).len(), 1);
  assert_eq!(cache.used_bytes(), size);

  held.push(cache.allocate(class).unwrap());
  assert_eq!(cache.list(class).max_length(), 3);
  assert_eq!(cache.used_bytes(), 0);

  held.push(cache.allocate(class).unwrap());
  assert_eq!(cache.list(class).max_length(), 4);
  assert_eq!(cache.list(class).len(), 2);

  for p in held {
    unsafe { cache.deallocate(p, class).unwrap() };
  }
}

#[test]
fn slow_start_ends_in_whole_batches() {
  let alloc = Allocator::new(quiet_config());
  let mut cache = alloc.thread_cache();
  let class = 1;
  let batch = batch_size_for_class(class);

  let mut held = Vec::new();
  while cache.list(class).max_length() <= batch {
    held.push(cache.allocate(class).unwrap());
  }
  // Every refill but the last handed out all it fetched.
  assert_eq!(held.len(), batch * (batch - 1) / 2 + 1);
  assert_eq!(cache.list(class).max_length(), 2 * batch);
  assert_eq!(cache.list(class).len(), batch - 1);

  for p in held {
    unsafe { cache.deallocate(p, class).unwrap() };
  }
  alloc.check_state().unwrap();
}

#[test]
fn overflowing_lists_give_back_a_batch() {
  let alloc = Allocator::new(quiet_config());
  let mut producer = alloc.thread_cache();
  let mut cache = alloc.thread_cache();
  let class = 3;
  let size = size_for_class(class);

  let objs: Vec<_> = (0..10).map(|_| producer.allocate(class).unwrap()).collect();
  let mut lens = Vec::new();
  for p in objs {
    unsafe { cache.deallocate(p, class).unwrap() };
    lens.push(cache.list(class).len());
  }
  assert_eq!(lens, [1, 0, 1, 2, 0, 1, 2, 3, 0, 1]);
  assert_eq!(cache.list(class).max_length(), 4);
  assert_eq!(cache.used_bytes(), size);
  assert_eq!(cache.total_freed_bytes(), 10 * size as u64);
}

#[test]
fn repeated_overages_shrink_the_list() {
  let alloc = Allocator::new(quiet_config());
  let mut cache = alloc.thread_cache();
  let class = 1;
  let batch = batch_size_for_class(class);
  let max_overages = alloc.config().max_overages;

  let mut held = Vec::new();
  while cache.list(class).max_length() <= batch {
    held.push(cache.allocate(class).unwrap());
  }
  let start = cache.list(class).len();

  // Fill to one past the limit: a batch goes back and the overage is counted.
  for p in held.drain(..2 * batch + 1 - start) {
    unsafe { cache.deallocate(p, class).unwrap() };
  }
  assert_eq!(cache.list(class).len(), batch + 1);
  assert_eq!(cache.list(class).length_overages(), 1);
  assert_eq!(cache.list(class).max_length(), 2 * batch);

  for _ in 0..max_overages {
    for p in held.drain(..batch) {
      unsafe { cache.deallocate(p, class).unwrap() };
    }
  }
  assert_eq!(cache.list(class).max_length(), batch);
  assert_eq!(cache.list(class).length_overages(), 0);
  assert_eq!(cache.list(class).len(), batch + 1);

  for p in held {
    unsafe { cache.deallocate(p, class).unwrap() };
  }
}

#[test]
fn going_over_budget_scavenges_and_asks_for_more() {
  let alloc = Allocator::new(Config {
    overall_cache_bytes: 64 * K,
    min_thread_cache_bytes: 8 * K,
    steal_bytes: 16 * K,
    ..quiet_config()
  });
  let mut producer = alloc.thread_cache();
  let mut cache = alloc.thread_cache();
  assert_eq!(cache.max_size(), 16 * K);

  let c1 = class_for_size(20 * K).unwrap();
  let c2 = c1 + 1;
  let (s1, s2) = (size_for_class(c1), size_for_class(c2));
  let a = producer.allocate(c1).unwrap();
  let b = producer.allocate(c2).unwrap();

  // Over budget, but nothing sat unused since the last scavenge.
  unsafe { cache.deallocate(a, c1).unwrap() };
  assert_eq!(cache.list(c1).len(), 1);
  assert_eq!(cache.list(c1).low_water(), 1);
  assert_eq!(cache.used_bytes(), s1);
  assert_eq!(cache.max_size(), 32 * K);

  // Now the `c1` object has been idle for a whole round.
  unsafe { cache.deallocate(b, c2).unwrap() };
  assert!(cache.list(c1).is_empty());
  assert_eq!(cache.list(c2).len(), 1);
  assert_eq!(cache.used_bytes(), s2);
  assert_eq!(cache.max_size(), 48 * K);

  let stats = alloc.registry().stats();
  assert_eq!(stats.claimed_bytes as isize + stats.unclaimed_bytes, 64 * K as isize);
}

#[test]
fn dropping_a_cache_returns_objects_and_budget() {
  let alloc = Allocator::new(quiet_config());
  let class = 2;
  {
    let mut cache = alloc.thread_cache();
    assert_eq!(alloc.registry().stats().threads, 1);
    let held: Vec<_> = (0..50).map(|_| cache.allocate(class).unwrap()).collect();
    for p in held {
      unsafe { cache.deallocate(p, class).unwrap() };
    }
    assert!(cache.used_bytes() > 0);
  }

  let stats = alloc.registry().stats();
  assert_eq!(stats.threads, 0);
  assert_eq!(stats.claimed_bytes, 0);
  assert_eq!(stats.unclaimed_bytes, stats.overall_bytes as isize);

  // Every object is back on a span or in a cached batch.
  let central = alloc.central(class).stats();
  let per_span = strata::size_class::SIZE_CLASSES[class].objects_per_span();
  assert_eq!(
    central.free_objects + central.cached_batches * batch_size_for_class(class),
    central.spans * per_span
  );
  alloc.check_state().unwrap();
}

#[test]
fn flush_keeps_the_budget() {
  let alloc = Allocator::new(quiet_config());
  let mut cache = alloc.thread_cache();
  let budget = cache.max_size();
  let p = cache.allocate(4).unwrap();
  let q = cache.allocate(4).unwrap();
  unsafe {
    cache.deallocate(p, 4).unwrap();
    cache.deallocate(q, 4).unwrap();
  }
  // One object was already cached from the second refill.
  assert_eq!(cache.used_bytes(), 3 * size_for_class(4));

  cache.flush();
  assert_eq!(cache.used_bytes(), 0);
  assert!(cache.list(4).is_empty());
  assert_eq!(cache.max_size(), budget);
  assert_eq!(alloc.registry().stats().threads, 1);
}
