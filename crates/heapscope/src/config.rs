//! Configuration Module - Session Parameters
//!
//! Tunables for one inspection session: target word size, cache page sizes,
//! caps that turn corrupted input into errors instead of endless loops, and
//! the walk/verification policy.

use crate::logging::EventLogConfig;
use thiserror::Error;

/// Configuration for a [`HeapSession`](crate::HeapSession)
///
/// # Examples
///
/// ```rust
/// use heapscope::SessionConfig;
///
/// // 64-bit target with defaults
/// let config = SessionConfig::default();
/// assert!(config.validate().is_ok());
///
/// // 32-bit target, careful walk
/// let config = SessionConfig {
///     careful_walk: true,
///     ..SessionConfig::for_pointer_size(4)
/// };
/// assert_eq!(config.min_object_size(), 12);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target pointer size in bytes (4 or 8)
    ///
    /// Default: 8
    pub pointer_size: usize,

    /// Page size of the object read cache
    ///
    /// Requests larger than this bypass the cache.
    /// Default: 64KB
    pub page_size: usize,

    /// Page size of the caches used for root-range scans
    ///
    /// Finalizer-queue and older-generation scans use their own small cache
    /// so they do not evict the object page.
    /// Default: 512 bytes
    pub root_scan_page_size: usize,

    /// Maximum number of segments across all heaps
    ///
    /// A longer chain is reported as corruption.
    /// Default: 1000
    pub max_segments: usize,

    /// Alignment of objects in generation segments
    ///
    /// Default: pointer size
    pub object_alignment: usize,

    /// Alignment of objects in large-object segments
    ///
    /// Default: 8
    pub large_object_alignment: usize,

    /// Check every object against its segment and type before trusting it
    ///
    /// Default: false
    pub verify_objects: bool,

    /// Resume at the next segment after a corrupted object
    ///
    /// When false the walk ends at the first corruption.
    /// Default: false
    pub careful_walk: bool,

    /// Largest GCDesc series count accepted for one type
    ///
    /// Default: 4096
    pub max_gc_desc_series: usize,

    /// Largest number of search nodes one root may expand
    ///
    /// Default: 16M
    pub max_search_nodes: usize,

    /// Structured event log settings
    pub events: EventLogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_pointer_size(8)
    }
}

impl SessionConfig {
    /// Defaults for a target with the given pointer size
    pub fn for_pointer_size(pointer_size: usize) -> Self {
        Self {
            pointer_size,
            page_size: 64 * KB,
            root_scan_page_size: 512,
            max_segments: 1000,
            object_alignment: pointer_size,
            large_object_alignment: 8,
            verify_objects: false,
            careful_walk: false,
            max_gc_desc_series: 4096,
            max_search_nodes: 16 * MB,
            events: EventLogConfig::default(),
        }
    }

    /// Smallest object the target heap can hold (header, type handle, one slot)
    #[inline]
    pub fn min_object_size(&self) -> u64 {
        3 * self.pointer_size as u64
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pointer_size != 4 && self.pointer_size != 8 {
            return Err(ConfigError::InvalidPointerSize(self.pointer_size));
        }

        if self.page_size == 0 || self.page_size > u32::MAX as usize {
            return Err(ConfigError::InvalidPageSize(format!(
                "page_size ({}) must be in 1..=u32::MAX",
                self.page_size
            )));
        }

        if self.root_scan_page_size == 0 || self.root_scan_page_size > self.page_size {
            return Err(ConfigError::InvalidPageSize(format!(
                "root_scan_page_size ({}) must be in 1..=page_size ({})",
                self.root_scan_page_size, self.page_size
            )));
        }

        if !self.object_alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(format!(
                "object_alignment ({}) is not a power of two",
                self.object_alignment
            )));
        }

        if !self.large_object_alignment.is_power_of_two()
            || self.large_object_alignment < self.object_alignment
        {
            return Err(ConfigError::InvalidAlignment(format!(
                "large_object_alignment ({}) must be a power of two >= object_alignment ({})",
                self.large_object_alignment, self.object_alignment
            )));
        }

        if self.max_segments == 0 {
            return Err(ConfigError::InvalidLimit("max_segments must be > 0".into()));
        }

        if self.max_gc_desc_series == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_gc_desc_series must be > 0".into(),
            ));
        }

        if self.max_search_nodes == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_search_nodes must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Load configuration from environment variables
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HEAPSCOPE_POINTER_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                let events = config.events.clone();
                config = Self {
                    events,
                    ..Self::for_pointer_size(size)
                };
            }
        }

        if let Ok(val) = std::env::var("HEAPSCOPE_PAGE_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.page_size = size;
            }
        }

        if let Ok(val) = std::env::var("HEAPSCOPE_MAX_SEGMENTS") {
            if let Ok(count) = val.parse::<usize>() {
                config.max_segments = count;
            }
        }

        if let Ok(val) = std::env::var("HEAPSCOPE_VERIFY") {
            config.verify_objects = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("HEAPSCOPE_CAREFUL") {
            config.careful_walk = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("HEAPSCOPE_EVENT_CAPACITY") {
            if let Ok(count) = val.parse::<usize>() {
                config.events.capacity = count;
            }
        }

        if let Ok(val) = std::env::var("HEAPSCOPE_VERBOSE") {
            if parse_flag(&val) {
                config.events.level = crate::logging::LogLevel::Trace;
            }
        }

        config
    }
}

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid pointer size: {0} (expected 4 or 8)")]
    InvalidPointerSize(usize),

    #[error("Invalid page size: {0}")]
    InvalidPageSize(String),

    #[error("Invalid alignment: {0}")]
    InvalidAlignment(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

const KB: usize = 1024;
const MB: usize = 1024 * 1024;
