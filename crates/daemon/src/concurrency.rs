//! Concurrency planning module for recstation
//!
//! Resolves the encode and stream process ceilings from configuration and CPU core count.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrent encode processes
    pub max_encode_jobs: u32,
    /// Maximum number of concurrent stream processes
    pub max_streams: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - Derives max_encode_jobs: 1 below 8 cores, 2 otherwise (unless explicit)
    /// - Derives max_streams: half the cores, at least 2 (unless explicit)
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`ConcurrencyPlan::derive`] with a fixed core count.
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_encode_jobs = if cfg.encode.max_concurrent_jobs > 0 {
            cfg.encode.max_concurrent_jobs
        } else {
            derive_max_encode_jobs(total_cores)
        };

        let max_streams = if cfg.stream.max_streams > 0 {
            cfg.stream.max_streams
        } else {
            derive_max_streams(total_cores)
        };

        Self {
            total_cores,
            max_encode_jobs,
            max_streams,
        }
    }
}

/// Derive max concurrent encode jobs based on core count
/// - 1 job below 8 cores
/// - 2 jobs otherwise
fn derive_max_encode_jobs(cores: u32) -> u32 {
    if cores < 8 {
        1
    } else {
        2
    }
}

fn derive_max_streams(cores: u32) -> u32 {
    (cores / 2).max(2)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
