use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{PAGE_SHIFT, PAGE_SIZE};

// =============================================================================
// Free List
// =============================================================================

/// Intrusive link stored in the first word of a free object.
#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
}

/// Singly linked list of free objects, threaded through the objects themselves.
pub struct FreeList {
  head: *mut FreeBlock,
  len: usize,
}

// The list owns the objects it links; nobody else may touch them while they are listed.
unsafe impl Send for FreeList {}

impl FreeList {
  pub const fn new() -> Self {
    Self {
      head: core::ptr::null_mut(),
      len: 0,
    }
  }

  #[inline(always)]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline(always)]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// # Safety
  /// `obj` must be writable for at least a pointer, suitably aligned, not already listed, and not
  /// used by anyone until it is popped again.
  #[inline(always)]
  pub unsafe fn push(&mut self, obj: NonNull<u8>) {
    let block = obj.cast::<FreeBlock>().as_ptr();
    unsafe { (*block).next = self.head };
    self.head = block;
    self.len += 1;
  }

  /// The object `pop` would return next.
  #[inline(always)]
  pub fn first(&self) -> Option<NonNull<u8>> {
    NonNull::new(self.head).map(NonNull::cast)
  }

  #[inline(always)]
  pub fn pop(&mut self) -> Option<NonNull<u8>> {
    let block = NonNull::new(self.head)?;
    // Every listed object went through `push`, which wrote its link.
    self.head = unsafe { (*block.as_ptr()).next };
    self.len -= 1;
    Some(block.cast())
  }

  /// Detaches the first `n` objects (or all of them, if fewer) as a new list.
  pub fn split_off(&mut self, n: usize) -> FreeList {
    let n = n.min(self.len);
    if n == 0 {
      return FreeList::new();
    }
    if n == self.len {
      return core::mem::take(self);
    }
    let head = self.head;
    let mut tail = head;
    unsafe {
      for _ in 1..n {
        tail = (*tail).next;
      }
      self.head = (*tail).next;
      (*tail).next = core::ptr::null_mut();
    }
    self.len -= n;
    FreeList { head, len: n }
  }

  /// Moves every object of `other` to the front of this list.
  pub fn append(&mut self, other: FreeList) {
    if other.is_empty() {
      return;
    }
    let mut tail = other.head;
    unsafe {
      while !(*tail).next.is_null() {
        tail = (*tail).next;
      }
      (*tail).next = self.head;
    }
    self.head = other.head;
    self.len += other.len;
  }
}

impl Default for FreeList {
  fn default() -> Self {
    Self::new()
  }
}

impl core::fmt::Debug for FreeList {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("FreeList").field("head", &self.head).field("len", &self.len).finish()
  }
}

// =============================================================================
// Span
// =============================================================================

/// Where a span currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Location {
  /// Checked out of the page heap, either whole or carved into objects.
  InUse = 0,
  /// Free, and still backed by physical memory.
  Normal = 1,
  /// Free, and handed back to the OS.
  Returned = 2,
}

impl Location {
  #[inline(always)]
  fn from_u8(v: u8) -> Self {
    match v {
      0 => Location::InUse,
      1 => Location::Normal,
      _ => Location::Returned,
    }
  }
}

/// A run of contiguous pages `[page_id, page_id + npages)`.
///
/// The geometry, `location` and `size_class` are atomics so the free path can classify a pointer
/// without locking, even one that lands on a span being split or merged. They are only written
/// under the page heap lock. Every other field belongs to whoever owns the span: the page heap
/// lock while it is free, the central list lock while it is carved into objects.
#[repr(C)]
pub struct Span {
  // Links first: the span slab threads its free list through the first word.
  pub(crate) prev: Option<NonNull<Span>>,
  pub(crate) next: Option<NonNull<Span>>,
  page_id: AtomicUsize,
  npages: AtomicUsize,
  size_class: AtomicUsize,
  location: AtomicU8,
  /// Objects handed out of this span.
  pub(crate) refcount: usize,
  pub(crate) objects: FreeList,
}

// Spans change hands only under the lock of their current owner.
unsafe impl Send for Span {}

impl Span {
  pub(crate) fn new(page_id: usize, npages: usize, location: Location) -> Self {
    Self {
      prev: None,
      next: None,
      page_id: AtomicUsize::new(page_id),
      npages: AtomicUsize::new(npages),
      size_class: AtomicUsize::new(0),
      location: AtomicU8::new(location as u8),
      refcount: 0,
      objects: FreeList::new(),
    }
  }

  #[inline(always)]
  pub fn page_id(&self) -> usize {
    self.page_id.load(Ordering::Relaxed)
  }

  #[inline(always)]
  pub(crate) fn set_page_id(&self, page_id: usize) {
    self.page_id.store(page_id, Ordering::Relaxed);
  }

  /// Length in pages. 0 once the descriptor is retired.
  #[inline(always)]
  pub fn npages(&self) -> usize {
    self.npages.load(Ordering::Relaxed)
  }

  #[inline(always)]
  pub(crate) fn set_npages(&self, npages: usize) {
    self.npages.store(npages, Ordering::Relaxed);
  }

  #[inline(always)]
  pub fn last_page(&self) -> usize {
    self.page_id() + self.npages() - 1
  }

  #[inline(always)]
  pub fn contains_page(&self, page: usize) -> bool {
    let page_id = self.page_id();
    page >= page_id && page - page_id < self.npages()
  }

  #[inline(always)]
  pub fn start(&self) -> NonNull<u8> {
    // Page 0 is never mapped, so a span never starts at null.
    unsafe { NonNull::new_unchecked((self.page_id() << PAGE_SHIFT) as *mut u8) }
  }

  #[inline(always)]
  pub fn bytes(&self) -> usize {
    self.npages() * PAGE_SIZE
  }

  #[inline(always)]
  pub fn location(&self) -> Location {
    Location::from_u8(self.location.load(Ordering::Acquire))
  }

  #[inline(always)]
  pub(crate) fn set_location(&self, location: Location) {
    self.location.store(location as u8, Ordering::Release);
  }

  /// Size class of the objects carved from this span, 0 for a raw page allocation.
  #[inline(always)]
  pub fn size_class(&self) -> usize {
    self.size_class.load(Ordering::Acquire)
  }

  #[inline(always)]
  pub(crate) fn set_size_class(&self, class: usize) {
    self.size_class.store(class, Ordering::Release);
  }

  #[inline(always)]
  pub fn refcount(&self) -> usize {
    self.refcount
  }

  #[inline(always)]
  pub fn free_objects(&self) -> usize {
    self.objects.len()
  }

  /// Cuts the whole span into `object_bytes` sized objects on its free list. Returns the count.
  /// The lowest address ends up at the head.
  ///
  /// # Safety
  /// The span's pages must be mapped, writable and unused.
  pub(crate) unsafe fn carve_objects(&mut self, object_bytes: usize) -> usize {
    debug_assert!(self.objects.is_empty());
    let count = self.bytes() / object_bytes;
    let base = self.start().as_ptr();
    for i in (0..count).rev() {
      unsafe { self.objects.push(NonNull::new_unchecked(base.add(i * object_bytes))) };
    }
    count
  }
}

// =============================================================================
// Span List
// =============================================================================

/// Doubly linked list of spans through their `prev`/`next` fields. A span is on at most one list.
pub(crate) struct SpanList {
  head: Option<NonNull<Span>>,
  len: usize,
}

// Lists live behind the lock that owns their spans.
unsafe impl Send for SpanList {}

impl SpanList {
  pub(crate) const fn new() -> Self {
    Self { head: None, len: 0 }
  }

  #[inline(always)]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline(always)]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  #[inline(always)]
  pub(crate) fn first(&self) -> Option<NonNull<Span>> {
    self.head
  }

  /// # Safety
  /// `span` must be live and not on any list.
  pub(crate) unsafe fn push_front(&mut self, span: NonNull<Span>) {
    unsafe {
      let s = span.as_ptr();
      debug_assert!((*s).prev.is_none() && (*s).next.is_none());
      (*s).next = self.head;
      if let Some(head) = self.head {
        (*head.as_ptr()).prev = Some(span);
      }
    }
    self.head = Some(span);
    self.len += 1;
  }

  /// # Safety
  /// `span` must be on this list.
  pub(crate) unsafe fn remove(&mut self, span: NonNull<Span>) {
    unsafe {
      let s = span.as_ptr();
      match (*s).prev {
        Some(prev) => (*prev.as_ptr()).next = (*s).next,
        None => {
          debug_assert_eq!(self.head, Some(span));
          self.head = (*s).next;
        }
      }
      if let Some(next) = (*s).next {
        (*next.as_ptr()).prev = (*s).prev;
      }
      (*s).prev = None;
      (*s).next = None;
    }
    self.len -= 1;
  }

  /// Walks the list. Only valid while the lock guarding the listed spans is held, which borrowing
  /// the list through that lock guarantees.
  pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<Span>> + '_ {
    let mut cursor = self.head;
    core::iter::from_fn(move || {
      let span = cursor?;
      cursor = unsafe { (*span.as_ptr()).next };
      Some(span)
    })
  }
}
