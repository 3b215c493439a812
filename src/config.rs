//! Ambient configuration layer.
//!
//! Plain data, `Default`-able, read-only once handed to [`crate::cache::Cache`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::mode::CacheMode;

/// Cache-wide, read-only-at-request-time configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of cache-line-sized units the cache holds.
    pub cachelines: u32,

    /// Use pass-through mode for I/O requests unaligned to 4 KiB.
    pub pt_unaligned_io: bool,

    /// Fallback-pt error threshold. `None` is the inactive sentinel —
    /// fallback-pt can never trigger.
    pub fallback_pt_error_threshold: Option<u32>,

    /// Cache-wide default mode, used when a partition has no override
    /// or its configured mode is invalid.
    pub default_cache_mode: CacheMode,

    /// Per-partition mode overrides (user-partition id -> mode).
    pub partition_modes: HashMap<u32, CacheMode>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cachelines: 1024,
            pt_unaligned_io: false,
            fallback_pt_error_threshold: Some(100),
            default_cache_mode: CacheMode::Wt,
            partition_modes: HashMap::new(),
        }
    }
}
