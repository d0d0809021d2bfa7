//! Thread-caching span allocator.
//!
//! Memory flows through three layers. A [`PageHeap`] hands out runs of pages ([`Span`]s) and
//! coalesces them again. One [`CentralFreelist`] per size class carves spans into objects and lends
//! them out in batches. A [`ThreadCache`] per thread keeps short per-class lists so most requests
//! never take a lock. Requests above [`MAX_SMALL_SIZE`] get whole pages from the heap.
//!
//! The free functions in this module use the process-wide [`Allocator::global`] and a cache bound
//! to the calling thread, which flushes itself when the thread exits. An [`Allocator`] can also be
//! built and driven by hand with explicit caches.

#![allow(clippy::missing_safety_doc)]

use core::{cell::RefCell, ptr::NonNull};

pub mod allocator;
pub mod arena;
pub mod central;
pub mod config;
pub mod error;
pub mod os;
pub mod page_heap;
pub mod page_map;
pub mod size_class;
pub mod span;
pub mod thread_cache;

pub use allocator::Allocator;
pub use central::{CentralFreelist, CentralStats};
pub use config::Config;
pub use error::{Error, InvalidFreeReason, Result};
pub use os::{PageSource, SystemPages};
pub use page_heap::{HeapStats, PageHeap};
pub use size_class::{
  MAX_SMALL_SIZE, NUM_CLASSES, batch_size_for_class, class_for_size, pages_for_class,
  size_for_class,
};
pub use span::{FreeList, Location, Span};
pub use thread_cache::{CacheRegistry, RegistryStats, ThreadCache, ThreadCacheFreeList};

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 8KB

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: RefCell<Option<ThreadCache<'static>>> = const { RefCell::new(None) };
}

/// Runs `f` on the calling thread's cache, creating it on first use. `None` while the thread-local
/// is being torn down or already borrowed further up the stack.
fn with_cache<R>(f: impl FnOnce(&mut ThreadCache<'static>) -> R) -> Option<R> {
  CACHE
    .try_with(|slot| {
      let mut slot = slot.try_borrow_mut().ok()?;
      let cache = slot.get_or_insert_with(|| Allocator::global().thread_cache());
      Some(f(cache))
    })
    .ok()
    .flatten()
}

/// Like `with_cache`, without creating a cache that does not exist yet.
fn with_existing_cache<R>(f: impl FnOnce(&mut ThreadCache<'static>) -> R) -> Option<R> {
  CACHE
    .try_with(|slot| {
      let mut slot = slot.try_borrow_mut().ok()?;
      slot.as_mut().map(f)
    })
    .ok()
    .flatten()
}

// =============================================================================
// Facade
// =============================================================================

/// Allocates `size` bytes. `0` gets the smallest size class.
pub fn allocate(size: usize) -> Result<NonNull<u8>> {
  let global = Allocator::global();
  with_cache(|cache| global.allocate(cache, size)).unwrap_or_else(|| global.allocate_uncached(size))
}

/// Frees memory returned by `allocate`. Pointers that are not live allocations are reported as
/// `Error::InvalidFree` and leave the allocator untouched.
///
/// # Safety
/// A live `ptr` must not be used afterwards.
pub unsafe fn deallocate(ptr: NonNull<u8>) -> Result<()> {
  let global = Allocator::global();
  match with_cache(|cache| unsafe { global.deallocate(cache, ptr) }) {
    Some(result) => result,
    None => unsafe { global.deallocate_uncached(ptr) },
  }
}

/// Bytes usable behind a live allocation.
pub fn usable_size(ptr: NonNull<u8>) -> Option<usize> {
  Allocator::global().usable_size(ptr)
}

/// Gives everything the calling thread has cached back to the central lists.
pub fn reset_current_thread_cache() {
  with_existing_cache(|cache| cache.flush());
}

/// Bytes cached by the calling thread.
pub fn current_thread_used_bytes() -> usize {
  with_existing_cache(|cache| cache.used_bytes()).unwrap_or(0)
}

/// Sets the byte budget shared by all thread caches of the global allocator.
pub fn set_global_cache_budget(bytes: usize) {
  Allocator::global().set_cache_budget(bytes);
}

// =============================================================================
// C API
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn strata_malloc(size: usize) -> *mut u8 {
  match allocate(size) {
    Ok(ptr) => ptr.as_ptr(),
    Err(err) => {
      log::warn!("strata_malloc({size}): {err}");
      core::ptr::null_mut()
    }
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_free(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else { return };
  if let Err(err) = unsafe { deallocate(ptr) } {
    log::error!("strata_free: {err}");
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn strata_usable_size(ptr: *mut u8) -> usize {
  NonNull::new(ptr).and_then(usable_size).unwrap_or(0)
}
