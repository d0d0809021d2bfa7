use crate::PAGE_SIZE;

/// Hard ceiling for the process-wide thread cache budget.
pub const MAX_OVERALL_CACHE_BYTES: usize = 1 << 30; // 1GB
/// Hard ceiling for the number of batches a central list keeps on hand.
pub const MAX_CACHED_BATCHES: usize = 64;

/// Tunables for one `Allocator`.
///
/// `Default` gives the values the allocator is tuned around. `from_env` starts
/// from those and applies any `STRATA_*` overrides found in the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
  /// Smallest amount of memory the page heap maps at once.
  pub min_system_bytes: usize,
  /// Pages freed between two releases of a normal span to the OS.
  pub release_rate_pages: usize,
  /// Initial process-wide thread cache budget.
  pub overall_cache_bytes: usize,
  pub min_thread_cache_bytes: usize,
  pub max_thread_cache_bytes: usize,
  /// Budget moved per successful steal.
  pub steal_bytes: usize,
  /// Caches visited before a steal attempt gives up.
  pub max_steal_candidates: usize,
  pub max_free_list_length: usize,
  /// Oversized releases tolerated before a list's `max_length` shrinks.
  pub max_overages: usize,
  /// Byte budget of each central list's batch cache.
  pub central_cache_bytes: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      min_system_bytes: 1 << 30, // 1GB
      release_rate_pages: 100,
      overall_cache_bytes: 32 << 20,
      min_thread_cache_bytes: 512 << 10,
      max_thread_cache_bytes: 4 << 20,
      steal_bytes: 64 << 10,
      max_steal_candidates: 10,
      max_free_list_length: 8192,
      max_overages: 3,
      central_cache_bytes: 1 << 20,
    }
  }
}

impl Config {
  /// Defaults overridden by `STRATA_*` environment variables.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Same as `from_env`, reading variables through `lookup`.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut config = Self::default();
    let fields: [(&str, &mut usize); 10] = [
      ("STRATA_MIN_SYSTEM_BYTES", &mut config.min_system_bytes),
      ("STRATA_RELEASE_RATE_PAGES", &mut config.release_rate_pages),
      ("STRATA_CACHE_BYTES", &mut config.overall_cache_bytes),
      ("STRATA_MIN_THREAD_CACHE_BYTES", &mut config.min_thread_cache_bytes),
      ("STRATA_MAX_THREAD_CACHE_BYTES", &mut config.max_thread_cache_bytes),
      ("STRATA_STEAL_BYTES", &mut config.steal_bytes),
      ("STRATA_MAX_STEAL_CANDIDATES", &mut config.max_steal_candidates),
      ("STRATA_MAX_FREE_LIST_LENGTH", &mut config.max_free_list_length),
      ("STRATA_MAX_OVERAGES", &mut config.max_overages),
      ("STRATA_CENTRAL_CACHE_BYTES", &mut config.central_cache_bytes),
    ];
    for (key, slot) in fields {
      let Some(raw) = lookup(key) else { continue };
      match raw.trim().parse::<usize>() {
        Ok(value) => *slot = value,
        Err(err) => log::warn!("ignoring {key}={raw:?}: {err}"),
      }
    }
    config.sanitized()
  }

  /// Pulls every field back into a range the allocator can run with.
  pub fn sanitized(mut self) -> Self {
    let defaults = Self::default();
    if self.release_rate_pages == 0 {
      log::warn!("release_rate_pages must be positive, using {}", defaults.release_rate_pages);
      self.release_rate_pages = defaults.release_rate_pages;
    }
    self.min_system_bytes = align_up(self.min_system_bytes.max(PAGE_SIZE), PAGE_SIZE);
    if self.min_thread_cache_bytes > self.max_thread_cache_bytes {
      log::warn!(
        "min_thread_cache_bytes {} exceeds max_thread_cache_bytes {}, swapping",
        self.min_thread_cache_bytes,
        self.max_thread_cache_bytes
      );
      core::mem::swap(&mut self.min_thread_cache_bytes, &mut self.max_thread_cache_bytes);
    }
    self.min_thread_cache_bytes = self.min_thread_cache_bytes.max(1);
    self.max_thread_cache_bytes = self.max_thread_cache_bytes.max(self.min_thread_cache_bytes);
    self.overall_cache_bytes = self
      .overall_cache_bytes
      .clamp(self.min_thread_cache_bytes, MAX_OVERALL_CACHE_BYTES.max(self.min_thread_cache_bytes));
    self.steal_bytes = self.steal_bytes.max(1);
    self.max_free_list_length = self.max_free_list_length.max(1);
    self
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
