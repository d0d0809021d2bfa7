use core::{
  mem::size_of,
  ptr::{self, NonNull},
  sync::atomic::{AtomicPtr, Ordering},
};

use parking_lot::Mutex;

use crate::{
  Error, Result,
  os::{os_mmap, os_munmap},
};

// =============================================================================
// Constants
// =============================================================================

const ROOT_BITS: usize = 22;
const MID_BITS: usize = 22;
const LEAF_BITS: usize = 20;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const _: () = assert!(usize::BITS == 64);
const _: () = assert!(ROOT_BITS + MID_BITS + LEAF_BITS == 64);

type Leaf<T> = [AtomicPtr<T>; LEAF_LEN];
type Mid<T> = [AtomicPtr<Leaf<T>>; MID_LEN];
type Root<T> = [AtomicPtr<Mid<T>>; ROOT_LEN];

#[inline(always)]
const fn split(key: usize) -> (usize, usize, usize) {
  (
    key >> (MID_BITS + LEAF_BITS),
    (key >> LEAF_BITS) & (MID_LEN - 1),
    key & (LEAF_LEN - 1),
  )
}

// =============================================================================
// Page Map
// =============================================================================

/// Sparse map from a 64-bit page id to a pointer, as a three-level radix tree.
///
/// Nodes are mapped from the OS on first write and are zero-filled, so an untouched entry reads as
/// `None`. Reads never lock. Writes are expected to be serialized by the caller; node creation is
/// still race-free on its own.
pub struct PageMap<T> {
  root: AtomicPtr<Root<T>>,
  /// Every node mapped so far, with its size, for `Drop`.
  nodes: Mutex<Vec<(NonNull<u8>, usize)>>,
}

// Entries are plain addresses; the map never dereferences them.
unsafe impl<T> Send for PageMap<T> {}
unsafe impl<T> Sync for PageMap<T> {}

impl<T> PageMap<T> {
  pub fn new() -> Self {
    Self {
      root: AtomicPtr::new(ptr::null_mut()),
      nodes: Mutex::new(Vec::new()),
    }
  }

  /// Entry for `key`, `None` if never set.
  #[inline]
  pub fn get(&self, key: usize) -> Option<NonNull<T>> {
    let (r, m, l) = split(key);
    let root = NonNull::new(self.root.load(Ordering::Acquire))?;
    let mid = NonNull::new(unsafe { root.as_ref() }[r].load(Ordering::Acquire))?;
    let leaf = NonNull::new(unsafe { mid.as_ref() }[m].load(Ordering::Acquire))?;
    NonNull::new(unsafe { leaf.as_ref() }[l].load(Ordering::Acquire))
  }

  /// Points `key` at `value`, mapping the nodes on the way if needed.
  pub fn set(&self, key: usize, value: NonNull<T>) -> Result<()> {
    let leaf = self.leaf_for(key)?;
    let (_, _, l) = split(key);
    let leaf = unsafe { leaf.as_ref() };
    leaf[l].store(value.as_ptr(), Ordering::Release);
    Ok(())
  }

  /// Maps every node needed to `set` any key in `[start, start + len)`.
  pub fn ensure(&self, start: usize, len: usize) -> Result<()> {
    let mut key = start;
    let end = start.saturating_add(len);
    while key < end {
      self.leaf_for(key)?;
      // Jump to the first key of the next leaf.
      key = match (key | (LEAF_LEN - 1)).checked_add(1) {
        Some(next) => next,
        None => break,
      };
    }
    Ok(())
  }

  fn leaf_for(&self, key: usize) -> Result<NonNull<Leaf<T>>> {
    let (r, m, _) = split(key);
    let root = self.child(&self.root)?;
    let mid = self.child(&unsafe { root.as_ref() }[r])?;
    self.child(&unsafe { mid.as_ref() }[m])
  }

  /// Loads the node behind `slot`, mapping and publishing a fresh one if it is empty.
  fn child<N>(&self, slot: &AtomicPtr<N>) -> Result<NonNull<N>> {
    if let Some(node) = NonNull::new(slot.load(Ordering::Acquire)) {
      return Ok(node);
    }
    let fresh = map_node::<N>()?;
    let published =
      slot.compare_exchange(ptr::null_mut(), fresh.as_ptr(), Ordering::AcqRel, Ordering::Acquire);
    match published {
      Ok(_) => {
        self.nodes.lock().push((fresh.cast(), size_of::<N>()));
        Ok(fresh)
      }
      Err(winner) => {
        unsafe { os_munmap(fresh.cast(), size_of::<N>()) };
        // The exchange only fails against a non-null node.
        Ok(unsafe { NonNull::new_unchecked(winner) })
      }
    }
  }

  /// Bytes of address space mapped for nodes.
  pub fn mapped_bytes(&self) -> usize {
    self.nodes.lock().iter().map(|&(_, bytes)| bytes).sum()
  }
}

impl<T> Default for PageMap<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for PageMap<T> {
  fn drop(&mut self) {
    for (node, bytes) in self.nodes.get_mut().drain(..) {
      unsafe { os_munmap(node, bytes) };
    }
  }
}

fn map_node<N>() -> Result<NonNull<N>> {
  let bytes = size_of::<N>();
  match os_mmap(bytes) {
    Some(node) => Ok(node.cast()),
    None => {
      log::warn!("page map could not map a {bytes} byte node");
      Err(Error::OutOfMemory { bytes })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn val(v: usize) -> NonNull<u64> {
    NonNull::new(v as *mut u64).unwrap()
  }

  #[test]
  fn sparse_keys_across_levels() {
    let map = PageMap::<u64>::new();
    assert_eq!(map.get(0x1), None);
    map.set(0x1, val(1)).unwrap();
    map.set(0x2, val(2)).unwrap();
    assert_eq!(map.get(0x1), Some(val(1)));
    assert_eq!(map.get(0x2), Some(val(2)));
    map.set(0x2, val(3)).unwrap();
    assert_eq!(map.get(0x2), Some(val(3)));
    assert_eq!(map.get(0x3), None);

    map.set(0x0f00_fff0, val(4)).unwrap();
    map.set(0x0f00_fff1, val(5)).unwrap();
    map.set(0xff00_fff0, val(6)).unwrap();
    assert_eq!(map.get(0x0f00_fff0), Some(val(4)));
    assert_eq!(map.get(0x0f00_fff1), Some(val(5)));
    assert_eq!(map.get(0xff00_fff0), Some(val(6)));
    assert_eq!(map.get(0x8f00_fff0), None);

    map.set(0xfff1_0000_0f00_fff0, val(7)).unwrap();
    map.set(0xfff2_0000_0f00_fff1, val(8)).unwrap();
    map.set(0xfff3_0000_ff00_fff0, val(9)).unwrap();
    assert_eq!(map.get(0xfff1_0000_0f00_fff0), Some(val(7)));
    assert_eq!(map.get(0xfff2_0000_0f00_fff1), Some(val(8)));
    assert_eq!(map.get(0xfff3_0000_ff00_fff0), Some(val(9)));
    assert_eq!(map.get(0xffff_0000_8f00_fff0), None);

    // Earlier entries are untouched by later nodes.
    assert_eq!(map.get(0x1), Some(val(1)));
  }

  #[test]
  fn ensure_maps_nodes_up_front() {
    let map = PageMap::<u64>::new();
    assert_eq!(map.mapped_bytes(), 0);
    let start = LEAF_LEN - 2;
    map.ensure(start, 4).unwrap();
    let after = map.mapped_bytes();
    // Root, one mid node and the two leaves the range straddles.
    assert_eq!(
      after,
      size_of::<Root<u64>>() + size_of::<Mid<u64>>() + 2 * size_of::<Leaf<u64>>()
    );
    for key in start..start + 4 {
      assert_eq!(map.get(key), None);
      map.set(key, val(key)).unwrap();
    }
    assert_eq!(map.mapped_bytes(), after);
  }

  #[test]
  fn concurrent_writers_share_nodes() {
    let map = PageMap::<u64>::new();
    std::thread::scope(|s| {
      for t in 0..4usize {
        let map = &map;
        s.spawn(move || {
          for i in 0..1000usize {
            let key = (t << 12) | i;
            map.set(key, val(key + 1)).unwrap();
          }
        });
      }
    });
    for t in 0..4usize {
      for i in 0..1000usize {
        let key = (t << 12) | i;
        assert_eq!(map.get(key), Some(val(key + 1)));
      }
    }
    assert_eq!(
      map.mapped_bytes(),
      size_of::<Root<u64>>() + size_of::<Mid<u64>>() + size_of::<Leaf<u64>>()
    );
  }
}
