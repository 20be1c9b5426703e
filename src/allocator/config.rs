//! Caching allocator configuration
//!
//! Built with the usual `with_*` builder calls or parsed from the
//! `NPUFORGE_ALLOC_CONF` environment variable, a comma separated list of
//! `key:value` pairs:
//!
//! ```text
//! NPUFORGE_ALLOC_CONF="max_split_size_mb:128,release_policy:eager"
//! ```

use crate::error::{ForgeResult, NpuForgeError};

/// Minimum block size and rounding granularity.
pub const MIN_BLOCK_SIZE: usize = 512;
/// Requests up to this size are served from the small pool.
pub const SMALL_SIZE: usize = 1 << 20;
/// Segment size for small-pool allocations.
pub const SMALL_BUFFER: usize = 2 << 20;
/// Segment size for mid-sized large-pool allocations.
pub const LARGE_BUFFER: usize = 20 << 20;
/// Large-pool requests from this size get a dedicated segment.
pub const MIN_LARGE_ALLOC: usize = 10 << 20;
/// Rounding granularity of dedicated large segments.
pub const ROUND_LARGE: usize = 2 << 20;

/// Default capacity of each device's allocation history ring.
pub const DEFAULT_TRACE_MAX_ENTRIES: usize = 1000;

const ALLOC_CONF_ENV: &str = "NPUFORGE_ALLOC_CONF";
const MB: usize = 1024 * 1024;

/// When fully free cached segments go back to the device.
///
/// `Deferred` is the default: a segment freed on a stream stays available to
/// the next request on that stream without another native allocation.
/// `Eager` returns each segment to the device as soon as it is whole again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Keep them cached until `empty_cache` or an out-of-memory retry.
    #[default]
    Deferred,
    /// Release a segment as soon as its last block is freed.
    Eager,
}

impl ReleasePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deferred" | "cached" => Some(ReleasePolicy::Deferred),
            "eager" | "immediate" => Some(ReleasePolicy::Eager),
            _ => None,
        }
    }
}

/// Caching allocator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Cached blocks at least this large are never split.
    pub max_split_size: usize,
    pub release_policy: ReleasePolicy,
    /// Ring capacity used when history is enabled without an explicit size.
    pub trace_max_entries: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_split_size: usize::MAX,
            release_policy: ReleasePolicy::Deferred,
            trace_max_entries: DEFAULT_TRACE_MAX_ENTRIES,
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_split_size(mut self, bytes: usize) -> Self {
        self.max_split_size = bytes;
        self
    }

    pub fn with_max_split_size_mb(self, mb: usize) -> Self {
        self.with_max_split_size(mb.saturating_mul(MB))
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    pub fn with_trace_max_entries(mut self, entries: usize) -> Self {
        self.trace_max_entries = entries;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> ForgeResult<()> {
        if self.max_split_size <= LARGE_BUFFER {
            return Err(NpuForgeError::InvalidConfiguration(format!(
                "max_split_size must exceed {} MB, got {} bytes",
                LARGE_BUFFER / MB,
                self.max_split_size
            )));
        }
        if self.trace_max_entries == 0 {
            return Err(NpuForgeError::InvalidConfiguration(
                "trace_max_entries must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a `key:value,key:value` option string on top of the defaults.
    pub fn parse(options: &str) -> ForgeResult<Self> {
        let mut config = Self::default();
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = option.split_once(':').ok_or_else(|| {
                NpuForgeError::InvalidConfiguration(format!(
                    "allocator option '{}' is not of the form key:value",
                    option
                ))
            })?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "max_split_size_mb" => {
                    let mb: usize = value.parse().map_err(|_| {
                        NpuForgeError::InvalidConfiguration(format!(
                            "max_split_size_mb expects an integer, got '{}'",
                            value
                        ))
                    })?;
                    config = config.with_max_split_size_mb(mb);
                }
                "release_policy" => {
                    let policy = ReleasePolicy::from_str(value).ok_or_else(|| {
                        NpuForgeError::InvalidConfiguration(format!(
                            "release_policy expects 'deferred' or 'eager', got '{}'",
                            value
                        ))
                    })?;
                    config = config.with_release_policy(policy);
                }
                "trace_max_entries" => {
                    let entries: usize = value.parse().map_err(|_| {
                        NpuForgeError::InvalidConfiguration(format!(
                            "trace_max_entries expects an integer, got '{}'",
                            value
                        ))
                    })?;
                    config = config.with_trace_max_entries(entries);
                }
                other => {
                    return Err(NpuForgeError::InvalidConfiguration(format!(
                        "unrecognized allocator option '{}'",
                        other
                    )))
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Read `NPUFORGE_ALLOC_CONF`; defaults when unset.
    pub fn from_env() -> ForgeResult<Self> {
        match std::env::var(ALLOC_CONF_ENV) {
            Ok(options) => {
                let config = Self::parse(&options)?;
                tracing::debug!("Allocator configuration from {}: {:?}", ALLOC_CONF_ENV, config);
                Ok(config)
            }
            Err(_) => Ok(Self::default()),
        }
    }
}
