use core::{
  ops::Bound::{Excluded, Unbounded},
  ptr::NonNull,
};
use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::{
  Config, Error, PAGE_SHIFT, PAGE_SIZE, Result,
  arena::Slab,
  config::align_up,
  error::ensure,
  os::{PageSource, SystemPages},
  page_map::PageMap,
  span::{Location, Span, SpanList},
};

/// Spans up to this many pages sit on exact-fit lists; longer ones in ordered sets.
pub const MAX_SMALL_PAGES: usize = 127;

/// Byte accounting of a page heap. `system == normal + returned + in_use` at every quiescent point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Mapped from the page source.
  pub system_bytes: usize,
  /// Free and backed by memory.
  pub normal_bytes: usize,
  /// Free and handed back to the OS.
  pub returned_bytes: usize,
  /// Checked out by callers.
  pub in_use_bytes: usize,
  pub small_normal_bytes: usize,
  pub small_returned_bytes: usize,
  pub large_normal_bytes: usize,
  pub large_returned_bytes: usize,
}

/// One mapping obtained from the page source.
struct Region {
  base: NonNull<u8>,
  bytes: usize,
}

struct Inner {
  spans: Slab<Span>,
  /// Indexed by exact page count; slot 0 stays empty.
  small_normal: [SpanList; MAX_SMALL_PAGES + 1],
  small_returned: [SpanList; MAX_SMALL_PAGES + 1],
  /// `(npages, page_id)` of every free span longer than `MAX_SMALL_PAGES`.
  large_normal: BTreeSet<(usize, usize)>,
  large_returned: BTreeSet<(usize, usize)>,
  stats: HeapStats,
  /// Small list the next release looks at. Wrapping past the last one releases a large span.
  release_index: usize,
  /// Pages left to free before the next release to the OS.
  release_rate: isize,
  regions: Vec<Region>,
}

// Region bases are only handed back to the page source on drop.
unsafe impl Send for Inner {}

/// Page-granular span allocator.
///
/// Every span not checked out lives here, indexed by size on exact-fit lists (up to
/// `MAX_SMALL_PAGES`) or in best-fit ordered sets, separately for normal and returned memory.
/// Freed spans coalesce with free neighbours of the same kind, and one normal span goes back to
/// the OS every `release_rate_pages` freed pages.
pub struct PageHeap {
  inner: Mutex<Inner>,
  page_map: PageMap<Span>,
  source: Box<dyn PageSource>,
  min_system_bytes: usize,
  release_rate_pages: usize,
}

impl PageHeap {
  pub fn new(config: &Config) -> Self {
    Self::with_source(config, Box::new(SystemPages))
  }

  pub fn with_source(config: &Config, source: Box<dyn PageSource>) -> Self {
    let release_rate_pages = config.release_rate_pages.max(1);
    Self {
      inner: Mutex::new(Inner {
        spans: Slab::new(),
        small_normal: [const { SpanList::new() }; MAX_SMALL_PAGES + 1],
        small_returned: [const { SpanList::new() }; MAX_SMALL_PAGES + 1],
        large_normal: BTreeSet::new(),
        large_returned: BTreeSet::new(),
        stats: HeapStats::default(),
        release_index: 0,
        release_rate: release_rate_pages as isize,
        regions: Vec::new(),
      }),
      page_map: PageMap::new(),
      source,
      min_system_bytes: align_up(config.min_system_bytes.max(PAGE_SIZE), PAGE_SIZE),
      release_rate_pages,
    }
  }

  // ===========================================================================
  // Public operations
  // ===========================================================================

  /// Checks out a span of exactly `npages` pages. The span is `InUse`, has no size class, and
  /// belongs to the caller until `delete_span`.
  pub fn new_span(&self, npages: usize) -> Result<NonNull<Span>> {
    if npages == 0 {
      return Err(Error::InvalidRequest("span of zero pages"));
    }
    let mut inner = self.inner.lock();

    if let Some(span) = self.search(&mut inner, npages) {
      return self.carve(&mut inner, span, npages);
    }

    // Lots of free memory but nothing long enough: releasing coalesces normal spans with their
    // returned neighbours, which may build a fit.
    let stats = inner.stats;
    if stats.normal_bytes != 0
      && stats.returned_bytes != 0
      && stats.normal_bytes + stats.returned_bytes > stats.system_bytes / 4
      && self.release_normal_spans(&mut inner, usize::MAX) > 0
      && let Some(span) = self.search(&mut inner, npages)
    {
      return self.carve(&mut inner, span, npages);
    }

    self.grow(&mut inner, npages)?;
    match self.search(&mut inner, npages) {
      Some(span) => self.carve(&mut inner, span, npages),
      None => Err(Error::InvariantViolation(format!("no {npages} page span after growing"))),
    }
  }

  /// Gives a checked-out span back.
  ///
  /// # Safety
  /// `span` must come from `new_span` on this heap, must not have been deleted already, and no
  /// object inside it may still be in use.
  pub unsafe fn delete_span(&self, span: NonNull<Span>) {
    let mut inner = self.inner.lock();
    unsafe { self.merge_into_free_list(&mut inner, span) };
    self.tripwire(&inner);
  }

  /// Marks a checked-out span as carved into objects of `class` and indexes every page of it, so
  /// any interior pointer resolves to the span.
  ///
  /// # Safety
  /// `span` must be checked out from this heap.
  pub unsafe fn register_size_class(&self, span: NonNull<Span>, class: usize) {
    let _inner = self.inner.lock();
    let s = unsafe { span.as_ref() };
    debug_assert_eq!(s.location(), Location::InUse);
    debug_assert_eq!(s.size_class(), 0);
    s.set_size_class(class);
    for page in s.page_id() + 1..s.last_page() {
      self.index(page, span);
    }
  }

  /// The span last indexed at `page`, without locking. The result may be stale for pages that
  /// are not inside a checked-out span; callers check `contains_page` and `location`.
  #[inline]
  pub fn span_for_page(&self, page: usize) -> Option<NonNull<Span>> {
    self.page_map.get(page)
  }

  pub fn stats(&self) -> HeapStats {
    self.inner.lock().stats
  }

  /// Number of free spans, normal and returned.
  pub fn free_spans(&self) -> usize {
    let inner = self.inner.lock();
    let small: usize = inner
      .small_normal
      .iter()
      .chain(inner.small_returned.iter())
      .map(SpanList::len)
      .sum();
    small + inner.large_normal.len() + inner.large_returned.len()
  }

  /// Releases free normal spans to the OS until at least `pages` pages went back or nothing
  /// normal is left. Returns the pages released.
  pub fn release_free_pages(&self, pages: usize) -> usize {
    let mut inner = self.inner.lock();
    let released = self.release_normal_spans(&mut inner, pages);
    self.tripwire(&inner);
    released
  }

  /// Walks every free list and set and cross-checks them against the accounting and the page map.
  pub fn check_state(&self) -> Result<()> {
    let inner = self.inner.lock();
    self.check_inner(&inner)
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Finds and unlinks a free span of at least `npages` pages.
  fn search(&self, inner: &mut Inner, npages: usize) -> Option<NonNull<Span>> {
    for len in npages..=MAX_SMALL_PAGES {
      let found = inner.small_normal[len].first().or_else(|| inner.small_returned[len].first());
      if let Some(span) = found {
        unsafe { self.remove_free(inner, span) };
        return Some(span);
      }
    }
    self.search_large(inner, npages)
  }

  /// Best fit over both large sets. Shorter spans win; between equal lengths, normal memory does.
  fn search_large(&self, inner: &mut Inner, npages: usize) -> Option<NonNull<Span>> {
    let bound = (Excluded((npages, 0)), Unbounded);
    let normal = inner.large_normal.range(bound).next().copied();
    let returned = inner.large_returned.range(bound).next().copied();
    let (_, page_id) = match (normal, returned) {
      (Some(n), Some(r)) if r.0 < n.0 => r,
      (Some(n), _) => n,
      (None, Some(r)) => r,
      (None, None) => return None,
    };
    let span = self.page_map.get(page_id)?;
    unsafe { self.remove_free(inner, span) };
    Some(span)
  }

  /// Trims a free, unlinked span to `npages` and checks it out. The remainder goes back on the
  /// free lists with the span's old location.
  fn carve(&self, inner: &mut Inner, span: NonNull<Span>, npages: usize) -> Result<NonNull<Span>> {
    let s = span.as_ptr();
    unsafe {
      let old = (*s).location();
      debug_assert_ne!(old, Location::InUse);
      debug_assert!((*s).npages() >= npages);

      if (*s).npages() > npages {
        let extra = (*s).npages() - npages;
        let tail_id = (*s).page_id() + npages;
        let Some(tail) = inner.spans.alloc(Span::new(tail_id, extra, old)) else {
          self.insert_free(inner, span);
          log::warn!("could not map span metadata");
          return Err(Error::OutOfMemory { bytes: size_of::<Span>() });
        };
        (*s).set_npages(npages);
        self.index((*s).last_page(), span);
        self.index(tail_id, tail);
        self.index(tail_id + extra - 1, tail);
        self.insert_free(inner, tail);
      }

      (*s).set_location(Location::InUse);
    }
    inner.stats.in_use_bytes += npages * PAGE_SIZE;
    self.tripwire(inner);
    Ok(span)
  }

  /// Maps at least `npages` more pages from the source and frees them into the heap.
  fn grow(&self, inner: &mut Inner, npages: usize) -> Result<()> {
    let wanted = npages
      .checked_mul(PAGE_SIZE)
      .ok_or(Error::OutOfMemory { bytes: usize::MAX })?;
    let bytes = align_up(wanted.max(self.min_system_bytes), PAGE_SIZE);
    // One spare page so the span can start on a page boundary whatever the source returns.
    let mapped = bytes + PAGE_SIZE;
    let Some(raw) = self.source.reserve(mapped) else {
      log::warn!("page source refused {mapped} bytes");
      return Err(Error::OutOfMemory { bytes: mapped });
    };
    inner.regions.push(Region { base: raw, bytes: mapped });

    let page_id = align_up(raw.as_ptr() as usize, PAGE_SIZE) >> PAGE_SHIFT;
    let span_pages = bytes >> PAGE_SHIFT;
    // Every later page map write lands inside some region, so it cannot fail.
    self.page_map.ensure(page_id, span_pages)?;

    let Some(span) = inner.spans.alloc(Span::new(page_id, span_pages, Location::InUse)) else {
      log::warn!("could not map span metadata");
      return Err(Error::OutOfMemory { bytes: size_of::<Span>() });
    };
    self.index(page_id, span);
    self.index(page_id + span_pages - 1, span);
    inner.stats.system_bytes += bytes;
    inner.stats.in_use_bytes += bytes;
    log::debug!(
      "page heap grew by {span_pages} pages at {:#x}, {} bytes mapped",
      page_id << PAGE_SHIFT,
      inner.stats.system_bytes
    );

    unsafe { self.free_span(inner, span) };
    Ok(())
  }

  // ===========================================================================
  // Deallocation
  // ===========================================================================

  unsafe fn merge_into_free_list(&self, inner: &mut Inner, span: NonNull<Span>) {
    let npages = unsafe { self.free_span(inner, span) };

    inner.release_rate -= npages as isize;
    if inner.release_rate <= 0 {
      let released = self.release_normal_spans(inner, 1);
      let rate = released.max(1) * self.release_rate_pages;
      inner.release_rate = rate as isize;
    }
  }

  /// Turns a checked-out span into a free normal one and coalesces it. Returns its original length.
  unsafe fn free_span(&self, inner: &mut Inner, span: NonNull<Span>) -> usize {
    let s = span.as_ptr();
    unsafe {
      debug_assert_eq!((*s).location(), Location::InUse);
      let npages = (*s).npages();
      inner.stats.in_use_bytes -= npages * PAGE_SIZE;
      (*s).set_size_class(0);
      (*s).refcount = 0;
      (*s).objects = Default::default();
      (*s).set_location(Location::Normal);
      let span = self.merge_neighbours(inner, span);
      self.insert_free(inner, span);
      npages
    }
  }

  /// Absorbs the free neighbours on both sides that share `span`'s location. `span` must be free
  /// and unlinked; the returned span is the coalesced one, still unlinked.
  unsafe fn merge_neighbours(&self, inner: &mut Inner, span: NonNull<Span>) -> NonNull<Span> {
    let s = span.as_ptr();
    unsafe {
      let location = (*s).location();

      if let Some(before) = (*s).page_id().checked_sub(1)
        && let Some(prev) = self.page_map.get(before)
        && (*prev.as_ptr()).location() == location
      {
        let p = prev.as_ptr();
        debug_assert_eq!((*p).page_id() + (*p).npages(), (*s).page_id());
        self.remove_free(inner, prev);
        (*s).set_page_id((*p).page_id());
        (*s).set_npages((*s).npages() + (*p).npages());
        self.retire(inner, prev);
        self.index((*s).page_id(), span);
      }

      if let Some(next) = self.page_map.get((*s).page_id() + (*s).npages())
        && (*next.as_ptr()).location() == location
      {
        let n = next.as_ptr();
        debug_assert_eq!((*n).page_id(), (*s).page_id() + (*s).npages());
        self.remove_free(inner, next);
        (*s).set_npages((*s).npages() + (*n).npages());
        self.retire(inner, next);
        self.index((*s).last_page(), span);
      }
    }
    span
  }

  /// Returns a merged-away span descriptor to the slab.
  unsafe fn retire(&self, inner: &mut Inner, span: NonNull<Span>) {
    // A stale page map entry may still point here; a zero length makes it contain no page.
    unsafe {
      (*span.as_ptr()).set_npages(0);
      inner.spans.free(span);
    }
  }

  // ===========================================================================
  // Release to the OS
  // ===========================================================================

  /// Releases normal spans until `target` pages went back, nothing normal is left, or the source
  /// refuses. Returns the pages released.
  fn release_normal_spans(&self, inner: &mut Inner, target: usize) -> usize {
    let mut released = 0;
    while released < target && inner.stats.normal_bytes > 0 {
      inner.release_index += 1;
      let span = if inner.release_index > MAX_SMALL_PAGES {
        inner.release_index = 0;
        match inner.large_normal.first() {
          Some(&(_, page_id)) => self.page_map.get(page_id),
          None => None,
        }
      } else {
        inner.small_normal[inner.release_index].first()
      };
      let Some(span) = span else { continue };
      match unsafe { self.release_span(inner, span) } {
        0 => break,
        pages => released += pages,
      }
    }
    released
  }

  /// Hands one free normal span to the OS and re-files it as returned. Returns its length, or 0 if
  /// the source refused.
  unsafe fn release_span(&self, inner: &mut Inner, span: NonNull<Span>) -> usize {
    let s = span.as_ptr();
    unsafe {
      debug_assert_eq!((*s).location(), Location::Normal);
      let npages = (*s).npages();
      if !self.source.release((*s).start(), npages * PAGE_SIZE) {
        log::warn!("could not release {npages} pages at {:p}", (*s).start());
        return 0;
      }
      log::trace!("released {npages} pages at {:p}", (*s).start());
      self.remove_free(inner, span);
      (*s).set_location(Location::Returned);
      let span = self.merge_neighbours(inner, span);
      self.insert_free(inner, span);
      npages
    }
  }

  // ===========================================================================
  // Free list bookkeeping
  // ===========================================================================

  unsafe fn insert_free(&self, inner: &mut Inner, span: NonNull<Span>) {
    let s = unsafe { span.as_ref() };
    let (npages, page_id, location) = (s.npages(), s.page_id(), s.location());
    let bytes = npages * PAGE_SIZE;
    let stats = &mut inner.stats;
    match (npages <= MAX_SMALL_PAGES, location) {
      (true, Location::Normal) => {
        unsafe { inner.small_normal[npages].push_front(span) };
        stats.small_normal_bytes += bytes;
      }
      (true, Location::Returned) => {
        unsafe { inner.small_returned[npages].push_front(span) };
        stats.small_returned_bytes += bytes;
      }
      (false, Location::Normal) => {
        let inserted = inner.large_normal.insert((npages, page_id));
        debug_assert!(inserted);
        stats.large_normal_bytes += bytes;
      }
      (false, Location::Returned) => {
        let inserted = inner.large_returned.insert((npages, page_id));
        debug_assert!(inserted);
        stats.large_returned_bytes += bytes;
      }
      (_, Location::InUse) => unreachable!("in-use span filed as free"),
    }
    match location {
      Location::Normal => stats.normal_bytes += bytes,
      _ => stats.returned_bytes += bytes,
    }
  }

  unsafe fn remove_free(&self, inner: &mut Inner, span: NonNull<Span>) {
    let s = unsafe { span.as_ref() };
    let (npages, page_id, location) = (s.npages(), s.page_id(), s.location());
    let bytes = npages * PAGE_SIZE;
    let stats = &mut inner.stats;
    match (npages <= MAX_SMALL_PAGES, location) {
      (true, Location::Normal) => {
        unsafe { inner.small_normal[npages].remove(span) };
        stats.small_normal_bytes -= bytes;
      }
      (true, Location::Returned) => {
        unsafe { inner.small_returned[npages].remove(span) };
        stats.small_returned_bytes -= bytes;
      }
      (false, Location::Normal) => {
        let removed = inner.large_normal.remove(&(npages, page_id));
        debug_assert!(removed);
        stats.large_normal_bytes -= bytes;
      }
      (false, Location::Returned) => {
        let removed = inner.large_returned.remove(&(npages, page_id));
        debug_assert!(removed);
        stats.large_returned_bytes -= bytes;
      }
      (_, Location::InUse) => unreachable!("in-use span unlinked from free lists"),
    }
    match location {
      Location::Normal => stats.normal_bytes -= bytes,
      _ => stats.returned_bytes -= bytes,
    }
  }

  #[inline]
  fn index(&self, page: usize, span: NonNull<Span>) {
    // Nodes for every page of every region were mapped by `grow`.
    let indexed = self.page_map.set(page, span);
    debug_assert!(indexed.is_ok(), "page {page:#x} outside the heap");
  }

  // ===========================================================================
  // Consistency
  // ===========================================================================

  fn check_inner(&self, inner: &Inner) -> Result<()> {
    let stats = inner.stats;
    ensure!(inner.release_rate > 0, "release rate {} not positive", inner.release_rate);
    ensure!(
      inner.release_index <= MAX_SMALL_PAGES,
      "release index {} out of range",
      inner.release_index
    );
    ensure!(
      stats.system_bytes == stats.normal_bytes + stats.returned_bytes + stats.in_use_bytes,
      "system {} != normal {} + returned {} + in use {}",
      stats.system_bytes,
      stats.normal_bytes,
      stats.returned_bytes,
      stats.in_use_bytes
    );
    ensure!(
      stats.normal_bytes == stats.small_normal_bytes + stats.large_normal_bytes,
      "normal bytes {} do not match small {} + large {}",
      stats.normal_bytes,
      stats.small_normal_bytes,
      stats.large_normal_bytes
    );
    ensure!(
      stats.returned_bytes == stats.small_returned_bytes + stats.large_returned_bytes,
      "returned bytes {} do not match small {} + large {}",
      stats.returned_bytes,
      stats.small_returned_bytes,
      stats.large_returned_bytes
    );

    let mut small_normal = 0;
    let mut small_returned = 0;
    for npages in 0..=MAX_SMALL_PAGES {
      small_normal += self.check_list(&inner.small_normal[npages], npages, Location::Normal)?;
      small_returned += self.check_list(&inner.small_returned[npages], npages, Location::Returned)?;
    }
    ensure!(
      small_normal == stats.small_normal_bytes,
      "small normal lists hold {small_normal} bytes, accounted {}",
      stats.small_normal_bytes
    );
    ensure!(
      small_returned == stats.small_returned_bytes,
      "small returned lists hold {small_returned} bytes, accounted {}",
      stats.small_returned_bytes
    );

    let large_normal = self.check_set(&inner.large_normal, Location::Normal)?;
    let large_returned = self.check_set(&inner.large_returned, Location::Returned)?;
    ensure!(
      large_normal == stats.large_normal_bytes,
      "large normal set holds {large_normal} bytes, accounted {}",
      stats.large_normal_bytes
    );
    ensure!(
      large_returned == stats.large_returned_bytes,
      "large returned set holds {large_returned} bytes, accounted {}",
      stats.large_returned_bytes
    );
    Ok(())
  }

  /// Checks one exact-fit list and returns the bytes it holds.
  fn check_list(&self, list: &SpanList, npages: usize, location: Location) -> Result<usize> {
    let mut count = 0;
    for span in list.iter() {
      let s = unsafe { span.as_ref() };
      ensure!(
        s.npages() == npages,
        "span at page {:#x} has {} pages on the {npages} page list",
        s.page_id(),
        s.npages()
      );
      self.check_free_span(span, location)?;
      count += 1;
    }
    ensure!(count == list.len(), "{npages} page list has {count} spans, counted {}", list.len());
    Ok(count * npages * PAGE_SIZE)
  }

  /// Checks one large set and returns the bytes it holds.
  fn check_set(&self, set: &BTreeSet<(usize, usize)>, location: Location) -> Result<usize> {
    let mut bytes = 0;
    for &(npages, page_id) in set {
      ensure!(npages > MAX_SMALL_PAGES, "{npages} page span in a large set");
      let Some(span) = self.page_map.get(page_id) else {
        return Err(Error::InvariantViolation(format!(
          "large span at page {page_id:#x} is not indexed"
        )));
      };
      let s = unsafe { span.as_ref() };
      ensure!(
        s.page_id() == page_id && s.npages() == npages,
        "large set entry ({npages}, {page_id:#x}) resolves to ({}, {:#x})",
        s.npages(),
        s.page_id()
      );
      self.check_free_span(span, location)?;
      bytes += npages * PAGE_SIZE;
    }
    Ok(bytes)
  }

  fn check_free_span(&self, span: NonNull<Span>, location: Location) -> Result<()> {
    let s = unsafe { span.as_ref() };
    ensure!(
      s.location() == location,
      "span at page {:#x} is {:?} on a {location:?} list",
      s.page_id(),
      s.location()
    );
    ensure!(
      s.size_class() == 0,
      "free span at page {:#x} has class {}",
      s.page_id(),
      s.size_class()
    );
    ensure!(
      self.page_map.get(s.page_id()) == Some(span),
      "free span first page {:#x} not indexed",
      s.page_id()
    );
    ensure!(
      self.page_map.get(s.last_page()) == Some(span),
      "free span last page {:#x} not indexed",
      s.last_page()
    );
    Ok(())
  }

  #[cfg(feature = "debug-tripwire")]
  fn tripwire(&self, inner: &Inner) {
    if let Err(err) = self.check_inner(inner) {
      panic!("page heap corrupted: {err}");
    }
  }

  #[cfg(not(feature = "debug-tripwire"))]
  #[inline(always)]
  fn tripwire(&self, _inner: &Inner) {}
}

impl Drop for PageHeap {
  fn drop(&mut self) {
    for region in self.inner.get_mut().regions.drain(..) {
      unsafe { self.source.unmap(region.base, region.bytes) };
    }
  }
}
