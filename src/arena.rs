use core::{
  marker::PhantomData,
  mem::{align_of, size_of},
  ptr::{self, NonNull},
};

use crate::{
  config::align_up,
  os::{os_mmap, os_munmap},
};

const CHUNK_SIZE: usize = 256 << 10; // 256KB

/// Link written over the first word of a reclaimed object.
#[repr(C)]
struct FreeSlot {
  next: *mut FreeSlot,
}

/// Header at the start of every chunk. Chunks form a list so `Drop` can unmap them.
#[repr(C)]
struct ChunkHeader {
  next: *mut ChunkHeader,
}

/// Fixed-size object allocator for allocator metadata.
///
/// Objects are bump-allocated out of `mmap`ed chunks and recycled LIFO through an intrusive free
/// list threaded through their first word. Chunks are only unmapped when the slab is dropped, so a
/// recycled object's address stays readable for as long as the slab lives.
pub struct Slab<T> {
  /// Bump cursor inside the newest chunk.
  cursor: *mut u8,
  /// End of the newest chunk.
  limit: *mut u8,
  free: *mut FreeSlot,
  chunks: *mut ChunkHeader,
  live: usize,
  chunk_count: usize,
  _marker: PhantomData<T>,
}

// Objects handed out are only reachable through the pointers `alloc` returns; the bookkeeping
// pointers never leave the slab.
unsafe impl<T: Send> Send for Slab<T> {}

impl<T> Slab<T> {
  const STRIDE: usize = align_up(size_of::<T>(), align_of::<T>());
  const FIRST: usize = align_up(size_of::<ChunkHeader>(), align_of::<T>());
  const FITS: () = {
    assert!(size_of::<T>() >= size_of::<FreeSlot>());
    assert!(align_of::<T>() >= align_of::<FreeSlot>());
    assert!(Self::FIRST + Self::STRIDE <= CHUNK_SIZE);
  };

  pub const fn new() -> Self {
    let () = Self::FITS;
    Self {
      cursor: ptr::null_mut(),
      limit: ptr::null_mut(),
      free: ptr::null_mut(),
      chunks: ptr::null_mut(),
      live: 0,
      chunk_count: 0,
      _marker: PhantomData,
    }
  }

  /// Moves `value` into a slab slot. `None` when no chunk can be mapped.
  pub fn alloc(&mut self, value: T) -> Option<NonNull<T>> {
    let slot = match NonNull::new(self.free) {
      Some(slot) => {
        self.free = unsafe { (*slot.as_ptr()).next };
        slot.cast::<T>()
      }
      None => self.bump()?,
    };
    unsafe { slot.as_ptr().write(value) };
    self.live += 1;
    Some(slot)
  }

  /// Drops the object and recycles its slot.
  ///
  /// # Safety
  /// `obj` must come from `alloc` on this slab and must not be freed twice.
  pub unsafe fn free(&mut self, obj: NonNull<T>) {
    debug_assert!(self.live > 0);
    unsafe {
      ptr::drop_in_place(obj.as_ptr());
      let slot = obj.cast::<FreeSlot>().as_ptr();
      (*slot).next = self.free;
      self.free = slot;
    }
    self.live -= 1;
  }

  /// Objects currently handed out.
  pub fn live(&self) -> usize {
    self.live
  }

  /// Chunks mapped so far.
  pub fn chunks(&self) -> usize {
    self.chunk_count
  }

  fn bump(&mut self) -> Option<NonNull<T>> {
    if self.cursor.is_null() || (self.limit as usize - self.cursor as usize) < Self::STRIDE {
      let chunk = os_mmap(CHUNK_SIZE)?;
      let header = chunk.cast::<ChunkHeader>().as_ptr();
      unsafe {
        (*header).next = self.chunks;
        self.cursor = chunk.as_ptr().add(Self::FIRST);
        self.limit = chunk.as_ptr().add(CHUNK_SIZE);
      }
      self.chunks = header;
      self.chunk_count += 1;
    }
    let obj = self.cursor.cast::<T>();
    self.cursor = unsafe { self.cursor.add(Self::STRIDE) };
    NonNull::new(obj)
  }
}

impl<T> Default for Slab<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for Slab<T> {
  // Live objects are not dropped: slab users only store plain metadata.
  fn drop(&mut self) {
    let mut chunk = self.chunks;
    while let Some(header) = NonNull::new(chunk) {
      unsafe {
        chunk = (*header.as_ptr()).next;
        os_munmap(header.cast(), CHUNK_SIZE);
      }
    }
  }
}
