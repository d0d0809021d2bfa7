use core::ptr::NonNull;
use std::sync::OnceLock;

use crate::{
  Config, Error, InvalidFreeReason, PAGE_SHIFT, PAGE_SIZE, Result,
  central::CentralFreelist,
  os::{PageSource, SystemPages},
  page_heap::PageHeap,
  size_class::{NUM_CLASSES, SIZE_CLASSES, class_for_size, size_for_class},
  span::{FreeList, Location, Span},
  thread_cache::{CacheRegistry, ThreadCache},
};

static GLOBAL: OnceLock<Allocator> = OnceLock::new();

/// What a pointer handed to `deallocate` turned out to be.
#[derive(Clone, Copy, Debug)]
enum Owner {
  Object(usize),
  Pages(NonNull<Span>),
}

/// Every process-wide piece of the allocator: the page heap, one central list per size class, and
/// the thread cache budget registry.
///
/// Usually reached through `Allocator::global()` and the free functions at the crate root, but any
/// number of independent instances can be built, each with its own memory.
pub struct Allocator {
  config: Config,
  page_heap: PageHeap,
  /// Central list of class `c` at index `c - 1`.
  central: Box<[CentralFreelist]>,
  registry: CacheRegistry,
}

impl Allocator {
  pub fn new(config: Config) -> Self {
    Self::with_source(config, Box::new(SystemPages))
  }

  /// Builds an allocator that maps its pages through `source`.
  pub fn with_source(config: Config, source: Box<dyn PageSource>) -> Self {
    let config = config.sanitized();
    Self {
      page_heap: PageHeap::with_source(&config, source),
      central: (1..NUM_CLASSES).map(|class| CentralFreelist::new(class, &config)).collect(),
      registry: CacheRegistry::new(&config),
      config,
    }
  }

  /// The process-wide allocator, configured from the environment on first use.
  pub fn global() -> &'static Allocator {
    GLOBAL.get_or_init(|| {
      let config = Config::from_env();
      log::debug!("initialising global allocator with {config:?}");
      Allocator::new(config)
    })
  }

  #[inline(always)]
  pub fn config(&self) -> &Config {
    &self.config
  }

  #[inline(always)]
  pub fn page_heap(&self) -> &PageHeap {
    &self.page_heap
  }

  /// Central list of `class`. Panics on the 0 sentinel or an out of range class.
  #[inline(always)]
  pub fn central(&self, class: usize) -> &CentralFreelist {
    &self.central[class - 1]
  }

  #[inline(always)]
  pub fn registry(&self) -> &CacheRegistry {
    &self.registry
  }

  /// A new cache bound to this allocator. Dropping it gives back everything it holds.
  pub fn thread_cache(&self) -> ThreadCache<'_> {
    ThreadCache::new(self)
  }

  /// Allocates `size` bytes through `cache`. Requests above the largest size class get whole pages
  /// straight from the page heap.
  pub fn allocate(&self, cache: &mut ThreadCache<'_>, size: usize) -> Result<NonNull<u8>> {
    debug_assert!(core::ptr::eq(cache.allocator(), self));
    match class_for_size(size) {
      Some(class) => cache.allocate(class),
      None => self.allocate_pages(size),
    }
  }

  /// Frees `ptr` through `cache`.
  ///
  /// Pointers this allocator does not recognize as live are reported instead of touching any
  /// state.
  ///
  /// # Safety
  /// If `ptr` is a live allocation of this allocator it must not be used again. Freeing a pointer
  /// while another thread frees the same one is undefined.
  pub unsafe fn deallocate(&self, cache: &mut ThreadCache<'_>, ptr: NonNull<u8>) -> Result<()> {
    debug_assert!(core::ptr::eq(cache.allocator(), self));
    match self.resolve(ptr)? {
      Owner::Object(class) => unsafe { cache.deallocate(ptr, class)? },
      Owner::Pages(span) => unsafe { self.page_heap.delete_span(span) },
    }
    Ok(())
  }

  /// Allocation path for threads without a usable cache: objects come straight from the central
  /// lists.
  pub fn allocate_uncached(&self, size: usize) -> Result<NonNull<u8>> {
    let Some(class) = class_for_size(size) else {
      return self.allocate_pages(size);
    };
    let mut list = FreeList::new();
    self.central(class).fill(&self.page_heap, &mut list, 1)?;
    list.pop().ok_or(Error::OutOfMemory { bytes: size_for_class(class) })
  }

  /// Free path matching `allocate_uncached`.
  ///
  /// # Safety
  /// Same contract as `deallocate`.
  pub unsafe fn deallocate_uncached(&self, ptr: NonNull<u8>) -> Result<()> {
    match self.resolve(ptr)? {
      Owner::Object(class) => {
        let mut list = FreeList::new();
        unsafe {
          list.push(ptr);
          self.central(class).release(&self.page_heap, list)?;
        }
      }
      Owner::Pages(span) => unsafe { self.page_heap.delete_span(span) },
    }
    Ok(())
  }

  /// Bytes usable behind a live allocation: the class size for small objects, the whole span for
  /// page allocations. `None` for anything else.
  pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
    match self.resolve(ptr).ok()? {
      Owner::Object(class) => Some(size_for_class(class)),
      Owner::Pages(span) => Some(unsafe { span.as_ref() }.bytes()),
    }
  }

  /// Sets the budget shared by every thread cache of this allocator.
  pub fn set_cache_budget(&self, bytes: usize) {
    self.registry.set_overall(bytes);
  }

  /// Full consistency check of the page heap and every central list.
  pub fn check_state(&self) -> Result<()> {
    self.page_heap.check_state()?;
    for central in self.central.iter() {
      central.check_state()?;
    }
    Ok(())
  }

  // ===========================================================================
  // Internals
  // ===========================================================================

  fn allocate_pages(&self, size: usize) -> Result<NonNull<u8>> {
    let npages = size.div_ceil(PAGE_SIZE).max(1);
    let span = self.page_heap.new_span(npages)?;
    Ok(unsafe { span.as_ref() }.start())
  }

  /// Works out which span and class own `ptr`, rejecting anything that is not a live allocation.
  fn resolve(&self, ptr: NonNull<u8>) -> Result<Owner> {
    let addr = ptr.as_ptr() as usize;
    let page = addr >> PAGE_SHIFT;
    let invalid = |reason| Error::InvalidFree { addr, reason };

    let span = self.page_heap.span_for_page(page).ok_or(invalid(InvalidFreeReason::Unmapped))?;
    let s = unsafe { span.as_ref() };
    if s.location() != Location::InUse || !s.contains_page(page) {
      return Err(invalid(InvalidFreeReason::NotInUse));
    }
    match s.size_class() {
      0 if addr != s.start().as_ptr() as usize => Err(invalid(InvalidFreeReason::NotSpanStart)),
      0 => Ok(Owner::Pages(span)),
      class => {
        let offset = addr - s.start().as_ptr() as usize;
        let size = size_for_class(class);
        if offset % size != 0 {
          Err(invalid(InvalidFreeReason::Misaligned))
        } else if offset / size >= SIZE_CLASSES[class].objects_per_span() {
          Err(invalid(InvalidFreeReason::PastLastObject))
        } else {
          Ok(Owner::Object(class))
        }
      }
    }
  }
}

impl core::fmt::Debug for Allocator {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Allocator")
      .field("config", &self.config)
      .field("heap", &self.page_heap.stats())
      .field("caches", &self.registry.stats())
      .finish()
  }
}
