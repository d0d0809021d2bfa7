use core::ptr::NonNull;

use parking_lot::Mutex;

use crate::{
  Config, Error, InvalidFreeReason, PAGE_SHIFT, Result,
  config::MAX_CACHED_BATCHES,
  error::ensure,
  page_heap::PageHeap,
  size_class::SIZE_CLASSES,
  span::{FreeList, Location, Span, SpanList},
};

/// Snapshot of one central list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CentralStats {
  /// Spans carved for this class and not yet given back to the page heap.
  pub spans: usize,
  /// Objects sitting on span free lists.
  pub free_objects: usize,
  /// Full batches parked in the batch cache.
  pub cached_batches: usize,
}

struct Inner {
  /// Whole batches ready to hand out, LIFO.
  batches: Vec<FreeList>,
  /// Spans with at least one free object.
  nonempty: SpanList,
  /// Spans with every object handed out.
  empty: SpanList,
  spans: usize,
  free_objects: usize,
}

/// Shared pool of free objects for one size class.
///
/// Objects live on the free lists of the spans they were carved from. A small cache of whole
/// batches sits in front, so the common exchange with a thread cache moves one list instead of
/// walking spans.
pub struct CentralFreelist {
  class: usize,
  object_bytes: usize,
  span_pages: usize,
  batch: usize,
  cache_capacity: usize,
  inner: Mutex<Inner>,
}

impl CentralFreelist {
  /// Panics if `class` is the 0 sentinel or out of range.
  pub fn new(class: usize, config: &Config) -> Self {
    let info = SIZE_CLASSES[class];
    assert!(info.size != 0, "size class 0 has no central list");
    let cache_capacity =
      (config.central_cache_bytes / (info.size * info.batch)).clamp(1, MAX_CACHED_BATCHES);
    Self {
      class,
      object_bytes: info.size,
      span_pages: info.pages,
      batch: info.batch,
      cache_capacity,
      inner: Mutex::new(Inner {
        batches: Vec::with_capacity(cache_capacity),
        nonempty: SpanList::new(),
        empty: SpanList::new(),
        spans: 0,
        free_objects: 0,
      }),
    }
  }

  #[inline(always)]
  pub fn class(&self) -> usize {
    self.class
  }

  #[inline(always)]
  pub fn batch_size(&self) -> usize {
    self.batch
  }

  /// Batches the cache holds at most.
  #[inline(always)]
  pub fn cache_capacity(&self) -> usize {
    self.cache_capacity
  }

  /// Moves up to `n` free objects onto `out`, carving new spans from `heap` as needed.
  ///
  /// Returns how many objects were moved. That is `n` unless the heap ran out of memory part way,
  /// in which case whatever was gathered is kept; running out before the first object is an error.
  pub fn fill(&self, heap: &PageHeap, out: &mut FreeList, n: usize) -> Result<usize> {
    if n == 0 {
      return Ok(0);
    }
    let mut inner = self.inner.lock();
    if n == self.batch
      && let Some(batch) = inner.batches.pop()
    {
      out.append(batch);
      return Ok(n);
    }
    self.fetch_from_spans(&mut inner, heap, out, n)
  }

  /// Takes back a list of objects of this class.
  ///
  /// Objects whose span is not a live span of this class, or that are already free on it, are
  /// logged and left out. The rest of the list is still taken back, and the first rejection is
  /// returned.
  ///
  /// # Safety
  /// Every object on `list` must have been handed out by this central list and must not be used
  /// again until it is handed out anew.
  pub unsafe fn release(&self, heap: &PageHeap, list: FreeList) -> Result<()> {
    if list.is_empty() {
      return Ok(());
    }
    let mut inner = self.inner.lock();
    if list.len() == self.batch && inner.batches.len() < self.cache_capacity {
      inner.batches.push(list);
      return Ok(());
    }
    unsafe { self.release_to_spans(&mut inner, heap, list) }
  }

  pub fn stats(&self) -> CentralStats {
    let inner = self.inner.lock();
    CentralStats {
      spans: inner.spans,
      free_objects: inner.free_objects,
      cached_batches: inner.batches.len(),
    }
  }

  /// Cross-checks both span lists and the batch cache against the counters.
  pub fn check_state(&self) -> Result<()> {
    let inner = self.inner.lock();
    let capacity = SIZE_CLASSES[self.class].objects_per_span();

    ensure!(
      inner.batches.len() <= self.cache_capacity,
      "class {}: {} cached batches, capacity {}",
      self.class,
      inner.batches.len(),
      self.cache_capacity
    );
    for batch in &inner.batches {
      ensure!(
        batch.len() == self.batch,
        "class {}: cached batch of {} objects, batch size {}",
        self.class,
        batch.len(),
        self.batch
      );
    }

    let mut spans = 0;
    let mut free_objects = 0;
    for span in inner.empty.iter() {
      let s = unsafe { span.as_ref() };
      self.check_span(s)?;
      ensure!(s.free_objects() == 0, "class {}: span on the empty list has free objects", self.class);
      ensure!(s.refcount() == capacity, "class {}: empty span refcount {}", self.class, s.refcount());
      spans += 1;
    }
    for span in inner.nonempty.iter() {
      let s = unsafe { span.as_ref() };
      self.check_span(s)?;
      ensure!(s.free_objects() > 0, "class {}: span on the nonempty list is full", self.class);
      ensure!(
        s.refcount() + s.free_objects() == capacity,
        "class {}: refcount {} + free {} != capacity {capacity}",
        self.class,
        s.refcount(),
        s.free_objects()
      );
      spans += 1;
      free_objects += s.free_objects();
    }
    ensure!(spans == inner.spans, "class {}: {spans} spans listed, {} counted", self.class, inner.spans);
    ensure!(
      free_objects == inner.free_objects,
      "class {}: {free_objects} free objects listed, {} counted",
      self.class,
      inner.free_objects
    );
    Ok(())
  }

  // ===========================================================================
  // Internals
  // ===========================================================================

  fn check_span(&self, s: &Span) -> Result<()> {
    ensure!(
      s.size_class() == self.class,
      "class {}: span at page {:#x} has class {}",
      self.class,
      s.page_id(),
      s.size_class()
    );
    ensure!(s.location() == Location::InUse, "class {}: span not in use", self.class);
    ensure!(
      s.npages() == self.span_pages,
      "class {}: span has {} pages, expected {}",
      self.class,
      s.npages(),
      self.span_pages
    );
    Ok(())
  }

  fn fetch_from_spans(
    &self,
    inner: &mut Inner,
    heap: &PageHeap,
    out: &mut FreeList,
    n: usize,
  ) -> Result<usize> {
    let mut fetched = 0;
    while fetched < n {
      let span = match inner.nonempty.first() {
        Some(span) => span,
        None => match self.populate(inner, heap) {
          Ok(span) => span,
          Err(err) if fetched == 0 => return Err(err),
          Err(err) => {
            log::warn!("class {}: short fill, {fetched} of {n} objects: {err}", self.class);
            break;
          }
        },
      };

      let s = span.as_ptr();
      unsafe {
        while fetched < n {
          let Some(obj) = (*s).objects.pop() else { break };
          (*s).refcount += 1;
          out.push(obj);
          fetched += 1;
        }
        if (*s).objects.is_empty() {
          inner.nonempty.remove(span);
          inner.empty.push_front(span);
        }
      }
    }
    inner.free_objects -= fetched;
    Ok(fetched)
  }

  /// Carves a fresh span from the page heap and files it as nonempty.
  fn populate(&self, inner: &mut Inner, heap: &PageHeap) -> Result<NonNull<Span>> {
    let span = heap.new_span(self.span_pages)?;
    let count = unsafe {
      heap.register_size_class(span, self.class);
      (*span.as_ptr()).carve_objects(self.object_bytes)
    };
    unsafe { inner.nonempty.push_front(span) };
    inner.spans += 1;
    inner.free_objects += count;
    log::trace!("class {}: carved {count} objects from a {} page span", self.class, self.span_pages);
    Ok(span)
  }

  unsafe fn release_to_spans(
    &self,
    inner: &mut Inner,
    heap: &PageHeap,
    mut list: FreeList,
  ) -> Result<()> {
    let mut first_err = None;
    while let Some(obj) = list.pop() {
      let addr = obj.as_ptr() as usize;
      let checked = match heap.span_for_page(addr >> PAGE_SHIFT) {
        None => Err(InvalidFreeReason::Unmapped),
        Some(span) => self.check_released(span, obj).map(|()| span),
      };
      let span = match checked {
        Ok(span) => span,
        Err(reason) => {
          log::error!("class {}: rejected released object {obj:p}: {reason}", self.class);
          if first_err.is_none() {
            first_err = Some(Error::InvalidFree { addr, reason });
          }
          continue;
        }
      };
      let s = span.as_ptr();
      unsafe {
        if (*s).objects.is_empty() {
          inner.empty.remove(span);
          inner.nonempty.push_front(span);
        }
        (*s).refcount -= 1;
        (*s).objects.push(obj);
        inner.free_objects += 1;

        if (*s).refcount == 0 {
          inner.free_objects -= (*s).objects.len();
          inner.nonempty.remove(span);
          inner.spans -= 1;
          heap.delete_span(span);
        }
      }
    }
    first_err.map_or(Ok(()), Err)
  }

  /// Whether `obj` can go back on `span`: the span must be a live span of this class with objects
  /// out, and `obj` must not be the object freed last on it.
  fn check_released(
    &self,
    span: NonNull<Span>,
    obj: NonNull<u8>,
  ) -> Result<(), InvalidFreeReason> {
    let s = unsafe { span.as_ref() };
    let page = obj.as_ptr() as usize >> PAGE_SHIFT;
    if s.location() != Location::InUse || !s.contains_page(page) || s.size_class() != self.class {
      return Err(InvalidFreeReason::NotInUse);
    }
    if s.refcount() == 0 || s.objects.first() == Some(obj) {
      return Err(InvalidFreeReason::DoubleFree);
    }
    Ok(())
  }
}
