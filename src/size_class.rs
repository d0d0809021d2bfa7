use crate::PAGE_SIZE;

// =============================================================================
// Constants
// =============================================================================

/// Largest request served from a size class; anything bigger gets its own span.
pub const MAX_SMALL_SIZE: usize = 256 << 10; // 256KB

/// Last linear class: 8, then 16..=128 in steps of 16, after the 0 sentinel.
const CLASSES_LINEAR: usize = 9;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Sub-class multipliers for geometric range (scaled by 4 for integer math).
/// Each represents a fraction of the doubling: 1.25, 1.5, 1.75, 2.0
const GEO_MULTIPLIERS: [usize; 4] = [5, 6, 7, 8];

/// Bytes moved per batch between a thread cache and a central list, before clamping.
const TARGET_BATCH_BYTES: usize = 16 << 10;
const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 128;

/// Number of entries in the class table, including the 0 sentinel.
pub const NUM_CLASSES: usize = count_size_classes();

const LOOKUP_LEN: usize = class_index(MAX_SMALL_SIZE) + 1;

// =============================================================================
// Compile-time checks
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(class_to_size(1) == 8);
const _: () = assert!(class_to_size(NUM_CLASSES - 1) == MAX_SMALL_SIZE);
const _: () = assert!(NUM_CLASSES <= u8::MAX as usize);
const _: () = assert!(pages_for(MAX_SMALL_SIZE, batch_for(MAX_SMALL_SIZE)) <= 127);

// =============================================================================
// Table
// =============================================================================

/// Static description of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassInfo {
  /// Object size in bytes. 0 for the sentinel class.
  pub size: usize,
  /// Pages in one span of this class.
  pub pages: usize,
  /// Objects moved per transfer between caches.
  pub batch: usize,
}

impl SizeClassInfo {
  pub const fn objects_per_span(&self) -> usize {
    if self.size == 0 { 0 } else { self.pages * PAGE_SIZE / self.size }
  }
}

/// Every size class, indexed by class number. Class 0 means "no class".
pub static SIZE_CLASSES: [SizeClassInfo; NUM_CLASSES] = build_table();

static CLASS_LOOKUP: [u8; LOOKUP_LEN] = build_lookup();

/// Class serving `size` bytes, or `None` if `size` exceeds `MAX_SMALL_SIZE`. `0` maps to the
/// smallest class.
#[inline(always)]
pub fn class_for_size(size: usize) -> Option<usize> {
  if size > MAX_SMALL_SIZE {
    return None;
  }
  Some(CLASS_LOOKUP[class_index(size)] as usize)
}

#[inline(always)]
pub fn size_for_class(class: usize) -> usize {
  SIZE_CLASSES[class].size
}

#[inline(always)]
pub fn batch_size_for_class(class: usize) -> usize {
  SIZE_CLASSES[class].batch
}

#[inline(always)]
pub fn pages_for_class(class: usize) -> usize {
  SIZE_CLASSES[class].pages
}

/// True for real classes, false for the sentinel and out-of-range numbers.
#[inline(always)]
pub fn is_valid_class(class: usize) -> bool {
  class != 0 && class < NUM_CLASSES
}

// =============================================================================
// Const builders
// =============================================================================

/// Convert class index to allocation size.
const fn class_to_size(class: usize) -> usize {
  if class == 0 {
    0
  } else if class == 1 {
    8
  } else if class <= CLASSES_LINEAR {
    (class - 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR - 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;
    ((128 << order) * GEO_MULTIPLIERS[sub]) / 4
  }
}

const fn count_size_classes() -> usize {
  let mut class = 1;
  while class_to_size(class) < MAX_SMALL_SIZE {
    class += 1;
  }
  class + 1
}

/// Dense index for the lookup table: 8 byte granularity up to 1KB, 128 byte granularity above.
/// Every class above 1KB is a multiple of 128, so the coarse steps never straddle a class.
#[inline(always)]
const fn class_index(size: usize) -> usize {
  if size <= 1024 {
    (size + 7) >> 3
  } else {
    (size + 127 + (120 << 7)) >> 7
  }
}

const fn batch_for(size: usize) -> usize {
  let batch = TARGET_BATCH_BYTES / size;
  if batch < MIN_BATCH {
    MIN_BATCH
  } else if batch > MAX_BATCH {
    MAX_BATCH
  } else {
    batch
  }
}

/// Smallest span that wastes at most 1/8 of itself and holds at least one batch.
const fn pages_for(size: usize, batch: usize) -> usize {
  let mut pages = 1;
  loop {
    let bytes = pages * PAGE_SIZE;
    if bytes / size >= batch && bytes % size <= bytes / 8 {
      return pages;
    }
    pages += 1;
  }
}

const fn build_table() -> [SizeClassInfo; NUM_CLASSES] {
  let mut table = [SizeClassInfo { size: 0, pages: 0, batch: 0 }; NUM_CLASSES];
  let mut class = 1;
  while class < NUM_CLASSES {
    let size = class_to_size(class);
    let batch = batch_for(size);
    table[class] = SizeClassInfo { size, pages: pages_for(size, batch), batch };
    class += 1;
  }
  table
}

const fn build_lookup() -> [u8; LOOKUP_LEN] {
  let mut lookup = [0u8; LOOKUP_LEN];
  let mut index = 0;
  while index < LOOKUP_LEN {
    // Largest size that lands on this index.
    let size = if index <= 128 { index << 3 } else { (index << 7) - (120 << 7) };
    let mut class = 1;
    while class_to_size(class) < size {
      class += 1;
    }
    lookup[index] = class as u8;
    index += 1;
  }
  lookup
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn table_shape() {
    assert_eq!(NUM_CLASSES, 54);
    assert_eq!(size_for_class(1), 8);
    assert_eq!(size_for_class(2), 16);
    assert_eq!(size_for_class(9), 128);
    assert_eq!(size_for_class(10), 160);
    assert_eq!(size_for_class(NUM_CLASSES - 1), MAX_SMALL_SIZE);
  }

  #[test]
  fn sizes_strictly_increase() {
    for class in 2..NUM_CLASSES {
      assert!(size_for_class(class) > size_for_class(class - 1), "class {class}");
    }
  }

  #[test]
  fn every_span_holds_a_batch_with_bounded_waste() {
    for class in 1..NUM_CLASSES {
      let info = SIZE_CLASSES[class];
      let bytes = info.pages * PAGE_SIZE;
      assert!(info.objects_per_span() >= info.batch, "class {class}: {info:?}");
      assert!(bytes % info.size <= bytes / 8, "class {class}: {info:?}");
      assert!((MIN_BATCH..=MAX_BATCH).contains(&info.batch));
      assert!((1..=127).contains(&info.pages));
    }
  }

  #[test]
  fn class_for_size_picks_smallest_fit() {
    assert_eq!(class_for_size(0), Some(1));
    assert_eq!(class_for_size(1), Some(1));
    assert_eq!(class_for_size(8), Some(1));
    assert_eq!(class_for_size(9), Some(2));
    assert_eq!(size_for_class(class_for_size(1025).unwrap()), 1280);
    assert_eq!(class_for_size(MAX_SMALL_SIZE), Some(NUM_CLASSES - 1));
    assert_eq!(class_for_size(MAX_SMALL_SIZE + 1), None);

    for size in 0..=MAX_SMALL_SIZE {
      let class = class_for_size(size).unwrap();
      assert!(size_for_class(class) >= size, "size {size}");
      if class > 1 {
        assert!(size_for_class(class - 1) < size, "size {size}");
      }
    }
  }

  #[test]
  fn class_sizes_map_back_to_themselves() {
    for class in 1..NUM_CLASSES {
      assert_eq!(class_for_size(size_for_class(class)), Some(class));
    }
  }

  #[test]
  fn validity() {
    assert!(!is_valid_class(0));
    assert!(is_valid_class(1));
    assert!(is_valid_class(NUM_CLASSES - 1));
    assert!(!is_valid_class(NUM_CLASSES));
  }
}
