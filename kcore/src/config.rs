//! Tunables the distilled spec states as literal constants. Broken out into
//! plain structs (rather than `const`s) so tests can shrink them — a 64-entry
//! cache or an 8 MiB stack window makes for a slow exhaustion test.

/// Configuration for [`kcore_cache::BufferCache`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Number of fixed buffer-cache entries. Spec: `CACHE_MAX = 64`.
    pub capacity: usize,
    /// How long the clock sweep backs off before retrying when a full
    /// revolution finds no victim. Spec: "sleep briefly and retry" (~1s).
    pub eviction_backoff: std::time::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            eviction_backoff: std::time::Duration::from_millis(1000),
        }
    }
}

/// Configuration for the VM triad (frame table / SPT / swap).
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Size of the stack-growth window below `PHYS_BASE`. Spec: 8 MiB.
    pub stack_growth_window: u64,
    /// How close to the stack pointer a fault must land to count as growth.
    /// Spec: "address >= esp - 32".
    pub stack_growth_slack: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_growth_window: 8 * 1024 * 1024,
            stack_growth_slack: 32,
        }
    }
}
