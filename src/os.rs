use core::ptr::{NonNull, null_mut};

// =============================================================================
// Platform
// =============================================================================

/// Maps `size` bytes of zeroed, private, read-write memory.
pub(crate) fn os_mmap(size: usize) -> Option<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    None
  } else {
    NonNull::new(ptr.cast())
  }
}

/// # Safety
/// `[ptr, ptr + size)` must come from `os_mmap` and must not be used afterwards.
pub(crate) unsafe fn os_munmap(ptr: NonNull<u8>, size: usize) {
  if unsafe { libc::munmap(ptr.as_ptr().cast(), size) } != 0 {
    log::warn!("munmap({:p}, {size}) failed: {}", ptr, std::io::Error::last_os_error());
  }
}

/// Drops the physical backing of a range. The mapping stays valid and reads back as zeroes.
#[cfg(feature = "release-mem")]
unsafe fn os_release(ptr: NonNull<u8>, size: usize) -> bool {
  let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) };
  if rc != 0 {
    log::warn!("madvise({:p}, {size}) failed: {}", ptr, std::io::Error::last_os_error());
  }
  rc == 0
}

#[cfg(not(feature = "release-mem"))]
unsafe fn os_release(_ptr: NonNull<u8>, _size: usize) -> bool {
  true
}

// =============================================================================
// Page Source
// =============================================================================

/// Where the page heap gets its address space from.
pub trait PageSource: Send + Sync {
  /// Maps `bytes` of fresh memory, or `None` when the system refuses.
  fn reserve(&self, bytes: usize) -> Option<NonNull<u8>>;

  /// Hands the physical pages of a range back to the system. Returns `false` on failure, in which
  /// case the range is left untouched.
  ///
  /// # Safety
  /// The range must lie inside a reservation and hold no live data.
  unsafe fn release(&self, addr: NonNull<u8>, bytes: usize) -> bool;

  /// Gives a whole reservation back.
  ///
  /// # Safety
  /// `addr` and `bytes` must be exactly what a previous `reserve` returned and asked for, and the
  /// range must not be touched afterwards.
  unsafe fn unmap(&self, addr: NonNull<u8>, bytes: usize) {
    let _ = (addr, bytes);
  }
}

/// Anonymous `mmap` memory. Release uses `madvise(MADV_DONTNEED)` when the `release-mem`
/// feature is on and is a no-op otherwise.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPages;

impl PageSource for SystemPages {
  fn reserve(&self, bytes: usize) -> Option<NonNull<u8>> {
    os_mmap(bytes)
  }

  unsafe fn release(&self, addr: NonNull<u8>, bytes: usize) -> bool {
    unsafe { os_release(addr, bytes) }
  }

  unsafe fn unmap(&self, addr: NonNull<u8>, bytes: usize) {
    unsafe { os_munmap(addr, bytes) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::PAGE_SIZE;

  #[test]
  fn mapped_memory_is_zeroed_and_writable() {
    let pages = SystemPages;
    let ptr = pages.reserve(4 * PAGE_SIZE).expect("mmap");
    unsafe {
      let bytes = core::slice::from_raw_parts_mut(ptr.as_ptr(), 4 * PAGE_SIZE);
      assert!(bytes.iter().all(|&b| b == 0));
      bytes.fill(0xAB);
      assert!(pages.release(ptr, 4 * PAGE_SIZE));
      pages.unmap(ptr, 4 * PAGE_SIZE);
    }
  }

  #[cfg(feature = "release-mem")]
  #[test]
  fn released_pages_read_back_as_zero() {
    let pages = SystemPages;
    let ptr = pages.reserve(2 * PAGE_SIZE).expect("mmap");
    unsafe {
      ptr.as_ptr().write_bytes(0x5A, 2 * PAGE_SIZE);
      assert!(pages.release(ptr, 2 * PAGE_SIZE));
      assert_eq!(*ptr.as_ptr(), 0);
      assert_eq!(*ptr.as_ptr().add(2 * PAGE_SIZE - 1), 0);
      pages.unmap(ptr, 2 * PAGE_SIZE);
    }
  }
}
