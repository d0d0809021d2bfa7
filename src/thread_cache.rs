use core::{
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
  Allocator, Config, Error, InvalidFreeReason, Result,
  config::MAX_OVERALL_CACHE_BYTES,
  size_class::{NUM_CLASSES, SIZE_CLASSES, is_valid_class},
  span::FreeList,
};

// =============================================================================
// Per-class list
// =============================================================================

/// One size class worth of cached objects, with the sizing state that adapts its capacity.
pub struct ThreadCacheFreeList {
  list: FreeList,
  /// Shortest length since the last scavenge.
  low_water: usize,
  /// Length above which a batch goes back to the central list.
  max_length: usize,
  /// Times the list overflowed while `max_length` was above the batch size.
  length_overages: usize,
}

impl ThreadCacheFreeList {
  const fn new() -> Self {
    Self {
      list: FreeList::new(),
      low_water: 0,
      max_length: 1,
      length_overages: 0,
    }
  }

  #[inline(always)]
  pub fn len(&self) -> usize {
    self.list.len()
  }

  #[inline(always)]
  pub fn is_empty(&self) -> bool {
    self.list.is_empty()
  }

  #[inline(always)]
  pub fn max_length(&self) -> usize {
    self.max_length
  }

  #[inline(always)]
  pub fn low_water(&self) -> usize {
    self.low_water
  }

  #[inline(always)]
  pub fn length_overages(&self) -> usize {
    self.length_overages
  }

  #[inline(always)]
  fn pop(&mut self) -> Option<NonNull<u8>> {
    let obj = self.list.pop()?;
    self.low_water = self.low_water.min(self.list.len());
    Some(obj)
  }

  #[inline(always)]
  unsafe fn push(&mut self, obj: NonNull<u8>) {
    unsafe { self.list.push(obj) };
  }

  fn take(&mut self, n: usize) -> FreeList {
    let batch = self.list.split_off(n);
    self.low_water = self.low_water.min(self.list.len());
    batch
  }
}

// =============================================================================
// Budget registry
// =============================================================================

/// Snapshot of the budget pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryStats {
  pub threads: usize,
  pub overall_bytes: usize,
  /// Target budget per cache at the last redistribution.
  pub per_thread_bytes: usize,
  /// Sum of every registered cache's budget.
  pub claimed_bytes: usize,
  /// Budget nobody holds. Negative when caches were given their minimum on credit.
  pub unclaimed_bytes: isize,
}

struct Member {
  id: u64,
  budget: Arc<AtomicUsize>,
}

struct RegistryState {
  members: Vec<Member>,
  /// Round-robin cursor into `members` for stealing.
  next_steal: usize,
  overall: usize,
  per_thread: usize,
  unclaimed: isize,
  next_id: u64,
}

/// Every live thread cache's byte budget, and the pool they are carved from.
///
/// A cache only reads its own budget on the hot path. Every change to any budget happens under the
/// registry lock, which is how stealing between threads stays consistent.
pub struct CacheRegistry {
  state: Mutex<RegistryState>,
  min_per_thread: usize,
  max_per_thread: usize,
  steal_bytes: usize,
  max_steal_candidates: usize,
}

impl CacheRegistry {
  pub fn new(config: &Config) -> Self {
    let overall = config.overall_cache_bytes.clamp(
      config.min_thread_cache_bytes,
      MAX_OVERALL_CACHE_BYTES.max(config.min_thread_cache_bytes),
    );
    Self {
      state: Mutex::new(RegistryState {
        members: Vec::new(),
        next_steal: 0,
        overall,
        per_thread: config.max_thread_cache_bytes,
        unclaimed: overall as isize,
        next_id: 1,
      }),
      min_per_thread: config.min_thread_cache_bytes,
      max_per_thread: config.max_thread_cache_bytes,
      steal_bytes: config.steal_bytes,
      max_steal_candidates: config.max_steal_candidates,
    }
  }

  pub fn stats(&self) -> RegistryStats {
    let state = self.state.lock();
    RegistryStats {
      threads: state.members.len(),
      overall_bytes: state.overall,
      per_thread_bytes: state.per_thread,
      claimed_bytes: state.members.iter().map(|m| m.budget.load(Ordering::Relaxed)).sum(),
      unclaimed_bytes: state.unclaimed,
    }
  }

  /// Sets the process-wide budget and redistributes it. Clamped to at least one cache's minimum
  /// and at most `MAX_OVERALL_CACHE_BYTES`.
  pub fn set_overall(&self, bytes: usize) {
    let bytes = bytes.clamp(self.min_per_thread, MAX_OVERALL_CACHE_BYTES.max(self.min_per_thread));
    let mut state = self.state.lock();
    state.overall = bytes;
    self.recompute(&mut state);
    log::debug!(
      "thread cache budget set to {bytes} bytes, {} per thread, {} unclaimed",
      state.per_thread,
      state.unclaimed
    );
  }

  /// Adds a cache with an empty budget, then grows it as if it had overflowed. A cache that cannot
  /// get anything is given the minimum on credit.
  fn register(&self) -> (u64, Arc<AtomicUsize>) {
    let mut state = self.state.lock();
    let id = state.next_id;
    state.next_id += 1;
    let budget = Arc::new(AtomicUsize::new(0));
    state.members.push(Member { id, budget: Arc::clone(&budget) });
    self.increase_limit_locked(&mut state, id, &budget);
    if budget.load(Ordering::Relaxed) == 0 {
      budget.store(self.min_per_thread, Ordering::Relaxed);
      state.unclaimed -= self.min_per_thread as isize;
    }
    log::debug!(
      "thread cache {id} registered with {} bytes, {} caches live",
      budget.load(Ordering::Relaxed),
      state.members.len()
    );
    (id, budget)
  }

  /// Removes a cache and puts its whole budget back in the pool.
  fn unregister(&self, id: u64, budget: &AtomicUsize) {
    let mut state = self.state.lock();
    state.unclaimed += budget.load(Ordering::Relaxed) as isize;
    if let Some(pos) = state.members.iter().position(|m| m.id == id) {
      state.members.remove(pos);
      if pos < state.next_steal {
        state.next_steal -= 1;
      }
      if state.next_steal >= state.members.len() {
        state.next_steal = 0;
      }
    }
    log::debug!("thread cache {id} unregistered, {} caches live", state.members.len());
  }

  fn increase_limit(&self, id: u64, budget: &AtomicUsize) {
    let mut state = self.state.lock();
    self.increase_limit_locked(&mut state, id, budget);
  }

  /// Grows `budget` by up to `steal_bytes`, first from the pool, else from another cache that
  /// holds more than the per-thread minimum.
  fn increase_limit_locked(&self, state: &mut RegistryState, id: u64, budget: &AtomicUsize) {
    if state.unclaimed > 0 {
      let grant = self.steal_bytes.min(state.unclaimed as usize);
      state.unclaimed -= grant as isize;
      budget.fetch_add(grant, Ordering::Relaxed);
      return;
    }
    for _ in 0..self.max_steal_candidates {
      if state.members.is_empty() {
        return;
      }
      if state.next_steal >= state.members.len() {
        state.next_steal = 0;
      }
      let victim = &state.members[state.next_steal];
      state.next_steal += 1;
      if victim.id == id || victim.budget.load(Ordering::Relaxed) <= self.min_per_thread {
        continue;
      }
      let taken = self.steal_bytes.min(victim.budget.load(Ordering::Relaxed));
      victim.budget.fetch_sub(taken, Ordering::Relaxed);
      budget.fetch_add(taken, Ordering::Relaxed);
      return;
    }
  }

  fn recompute(&self, state: &mut RegistryState) {
    let threads = state.members.len().max(1);
    let space = (state.overall / threads).clamp(self.min_per_thread, self.max_per_thread);
    let ratio = space as f64 / state.per_thread.max(1) as f64;
    let mut claimed = 0usize;
    for member in &state.members {
      if ratio < 1.0 {
        let scaled = (member.budget.load(Ordering::Relaxed) as f64 * ratio) as usize;
        member.budget.store(scaled, Ordering::Relaxed);
      }
      claimed += member.budget.load(Ordering::Relaxed);
    }
    state.unclaimed = state.overall as isize - claimed as isize;
    state.per_thread = space;
  }
}

// =============================================================================
// Thread cache
// =============================================================================

/// Per-thread object cache in front of the central lists.
///
/// Each class list starts tiny and grows with demand (slow start), overflowing lists give a batch
/// back, and when the cache as a whole exceeds its byte budget it scavenges what went unused since
/// the last scavenge and asks the registry for more budget. Dropping the cache gives every object
/// and the budget back.
pub struct ThreadCache<'a> {
  alloc: &'a Allocator,
  lists: Box<[ThreadCacheFreeList]>,
  /// Bytes sitting in `lists`.
  size: usize,
  budget: Arc<AtomicUsize>,
  id: u64,
  total_allocated: u64,
  total_freed: u64,
}

impl<'a> ThreadCache<'a> {
  pub fn new(alloc: &'a Allocator) -> Self {
    let (id, budget) = alloc.registry().register();
    Self {
      alloc,
      lists: (0..NUM_CLASSES).map(|_| ThreadCacheFreeList::new()).collect(),
      size: 0,
      budget,
      id,
      total_allocated: 0,
      total_freed: 0,
    }
  }

  /// Hands out one object of `class`.
  pub fn allocate(&mut self, class: usize) -> Result<NonNull<u8>> {
    if !is_valid_class(class) {
      return Err(Error::InvalidRequest("unknown size class"));
    }
    let bytes = SIZE_CLASSES[class].size;
    let obj = match self.lists[class].pop() {
      Some(obj) => {
        self.size -= bytes;
        obj
      }
      None => self.fetch_from_central(class)?,
    };
    self.total_allocated += bytes as u64;
    Ok(obj)
  }

  /// Takes an object of `class` back. Freeing the object that was freed last, while it is still
  /// cached, is reported and leaves the list untouched.
  ///
  /// # Safety
  /// `obj` must be an object of `class` handed out by this allocator, and must not be used again.
  pub unsafe fn deallocate(&mut self, obj: NonNull<u8>, class: usize) -> Result<()> {
    debug_assert!(is_valid_class(class));
    let bytes = SIZE_CLASSES[class].size;
    let list = &mut self.lists[class];
    if list.list.first() == Some(obj) {
      return Err(Error::InvalidFree {
        addr: obj.as_ptr() as usize,
        reason: InvalidFreeReason::DoubleFree,
      });
    }
    unsafe { list.push(obj) };
    self.size += bytes;
    self.total_freed += bytes as u64;

    if list.len() > list.max_length {
      self.list_too_long(class);
    } else if self.size > self.max_size() {
      self.scavenge();
    }
    Ok(())
  }

  /// Gives every cached object back to the central lists. The budget is kept.
  pub fn flush(&mut self) {
    for class in 1..NUM_CLASSES {
      let len = self.lists[class].len();
      self.release_to_central(class, len);
    }
  }

  /// Bytes currently cached.
  #[inline(always)]
  pub fn used_bytes(&self) -> usize {
    self.size
  }

  /// Byte budget this cache may hold before scavenging.
  #[inline(always)]
  pub fn max_size(&self) -> usize {
    self.budget.load(Ordering::Relaxed)
  }

  pub fn total_allocated_bytes(&self) -> u64 {
    self.total_allocated
  }

  pub fn total_freed_bytes(&self) -> u64 {
    self.total_freed
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  /// Sizing state of one class list. Panics on an invalid class.
  pub fn list(&self, class: usize) -> &ThreadCacheFreeList {
    &self.lists[class]
  }

  pub fn allocator(&self) -> &'a Allocator {
    self.alloc
  }

  // ===========================================================================
  // Internals
  // ===========================================================================

  /// Refills an empty list from the central list and returns one of the objects.
  fn fetch_from_central(&mut self, class: usize) -> Result<NonNull<u8>> {
    let info = SIZE_CLASSES[class];
    let alloc = self.alloc;
    let list = &mut self.lists[class];
    debug_assert!(list.is_empty());

    let want = list.max_length.min(info.batch);
    let mut fetched = FreeList::new();
    let count = alloc.central(class).fill(alloc.page_heap(), &mut fetched, want)?;
    let Some(obj) = fetched.pop() else {
      return Err(Error::OutOfMemory { bytes: info.size });
    };
    list.list.append(fetched);
    self.size += (count - 1) * info.size;

    // Slow start: one more object per refill until a full batch, then a batch at a time.
    if list.max_length < info.batch {
      list.max_length += 1;
    } else {
      let grown = (list.max_length + info.batch).min(alloc.config().max_free_list_length);
      list.max_length = (grown - grown % info.batch).max(info.batch);
    }
    Ok(obj)
  }

  /// Gives one batch back after an overflow, and tunes `max_length`.
  fn list_too_long(&mut self, class: usize) {
    let batch = SIZE_CLASSES[class].batch;
    self.release_to_central(class, batch);

    let max_overages = self.alloc.config().max_overages;
    let list = &mut self.lists[class];
    if list.max_length < batch {
      list.max_length += 1;
    } else if list.max_length > batch {
      list.length_overages += 1;
      if list.length_overages > max_overages {
        list.max_length -= batch;
        list.length_overages = 0;
      }
    }
  }

  /// Moves the first `n` objects of a class list to its central list, one batch at a time.
  fn release_to_central(&mut self, class: usize, n: usize) {
    let info = SIZE_CLASSES[class];
    let n = n.min(self.lists[class].len());
    if n == 0 {
      return;
    }
    let central = self.alloc.central(class);
    let heap = self.alloc.page_heap();
    let mut remaining = n;
    while remaining > 0 {
      let chunk = self.lists[class].take(remaining.min(info.batch));
      remaining -= chunk.len();
      // Rejected objects are logged by the central list and left out of it.
      if let Err(err) = unsafe { central.release(heap, chunk) } {
        log::error!("thread cache {} released a bad batch of class {class}: {err}", self.id);
      }
    }
    self.size -= n * info.size;
  }

  /// Releases half of what each list left untouched since the last scavenge, then asks for more
  /// budget.
  fn scavenge(&mut self) {
    for class in 1..NUM_CLASSES {
      let low_water = self.lists[class].low_water;
      if low_water > 0 {
        let batch = SIZE_CLASSES[class].batch;
        self.release_to_central(class, (low_water / 2).max(1));
        let list = &mut self.lists[class];
        if list.max_length > batch {
          list.max_length = (list.max_length - batch).max(batch);
        }
      }
      let list = &mut self.lists[class];
      list.low_water = list.len();
    }
    self.alloc.registry().increase_limit(self.id, &self.budget);
  }
}

impl Drop for ThreadCache<'_> {
  fn drop(&mut self) {
    self.flush();
    self.alloc.registry().unregister(self.id, &self.budget);
  }
}

impl core::fmt::Debug for ThreadCache<'_> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ThreadCache")
      .field("id", &self.id)
      .field("used_bytes", &self.size)
      .field("max_size", &self.max_size())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const K: usize = 1 << 10;

  fn registry(overall: usize, min: usize, steal: usize) -> CacheRegistry {
    CacheRegistry::new(&Config {
      overall_cache_bytes: overall,
      min_thread_cache_bytes: min,
      max_thread_cache_bytes: 64 * K,
      steal_bytes: steal,
      max_steal_candidates: 10,
      ..Config::default()
    })
  }

  fn balanced(r: &CacheRegistry) -> bool {
    let stats = r.stats();
    stats.claimed_bytes as isize + stats.unclaimed_bytes == stats.overall_bytes as isize
  }

  #[test]
  fn new_caches_draw_from_the_pool() {
    let r = registry(20 * K, 8 * K, 8 * K);
    let (_, a) = r.register();
    let (_, b) = r.register();
    let (_, c) = r.register();
    assert_eq!(a.load(Ordering::Relaxed), 8 * K);
    assert_eq!(b.load(Ordering::Relaxed), 8 * K);
    // Only 4K were left.
    assert_eq!(c.load(Ordering::Relaxed), 4 * K);
    assert_eq!(r.stats().unclaimed_bytes, 0);
    assert!(balanced(&r));
  }

  #[test]
  fn stealing_moves_one_step_round_robin() {
    let r = registry(32 * K, 8 * K, 8 * K);
    let (a_id, a) = r.register();
    r.increase_limit(a_id, &a);
    r.increase_limit(a_id, &a);
    assert_eq!(a.load(Ordering::Relaxed), 24 * K);
    let (_, b) = r.register();
    assert_eq!(r.stats().unclaimed_bytes, 0);

    let (c_id, c) = r.register();
    assert_eq!(a.load(Ordering::Relaxed), 16 * K);
    assert_eq!(c.load(Ordering::Relaxed), 8 * K);

    // `b` sits at the minimum and `c` is the thief, so `a` pays again.
    r.increase_limit(c_id, &c);
    assert_eq!(a.load(Ordering::Relaxed), 8 * K);
    assert_eq!(b.load(Ordering::Relaxed), 8 * K);
    assert_eq!(c.load(Ordering::Relaxed), 16 * K);
    assert!(balanced(&r));

    // Everyone else is at the minimum now.
    r.increase_limit(c_id, &c);
    assert_eq!(c.load(Ordering::Relaxed), 16 * K);
    assert!(balanced(&r));
  }

  #[test]
  fn minimum_is_granted_on_credit() {
    let r = registry(16 * K, 8 * K, 8 * K);
    let (_, _a) = r.register();
    let (_, _b) = r.register();
    let (c_id, c) = r.register();
    assert_eq!(c.load(Ordering::Relaxed), 8 * K);
    let stats = r.stats();
    assert_eq!(stats.threads, 3);
    assert_eq!(stats.unclaimed_bytes, -8 * K as isize);
    assert!(balanced(&r));

    r.unregister(c_id, &c);
    assert_eq!(r.stats().threads, 2);
    assert_eq!(r.stats().unclaimed_bytes, 0);
  }

  #[test]
  fn shrinking_the_budget_scales_every_cache() {
    let r = registry(K * K, 8 * K, 64 * K);
    let budgets: Vec<_> = (0..4).map(|_| r.register().1).collect();
    for b in &budgets {
      assert_eq!(b.load(Ordering::Relaxed), 64 * K);
    }

    r.set_overall(128 * K);
    let stats = r.stats();
    assert_eq!(stats.per_thread_bytes, 32 * K);
    assert_eq!(stats.claimed_bytes, 128 * K);
    assert_eq!(stats.unclaimed_bytes, 0);
    for b in &budgets {
      assert_eq!(b.load(Ordering::Relaxed), 32 * K);
    }

    // Growing leaves budgets alone; the slack goes to the pool.
    r.set_overall(K * K);
    let stats = r.stats();
    assert_eq!(stats.per_thread_bytes, 64 * K);
    assert_eq!(stats.claimed_bytes, 128 * K);
    assert!(balanced(&r));

    r.set_overall(0);
    assert_eq!(r.stats().overall_bytes, 8 * K);
    assert!(balanced(&r));
  }

  #[test]
  fn unregister_keeps_the_steal_cursor_in_range() {
    let r = registry(16 * K, 4 * K, 8 * K);
    let ids: Vec<_> = (0..3).map(|_| r.register()).collect();
    for (id, budget) in ids.iter().rev() {
      r.unregister(*id, budget);
      assert!(balanced(&r));
    }
    let stats = r.stats();
    assert_eq!(stats.threads, 0);
    assert_eq!(stats.unclaimed_bytes, 16 * K as isize);
  }
}
