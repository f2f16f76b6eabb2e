//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of payloads cached on disk at once (None = 80% of the open files limit)
    pub max_cache_files: Option<usize>,
    /// Backend requests per second (0 = no throttle)
    pub request_throttle: usize,
    /// Transferred chunks per second (0 = no throttle)
    pub chunk_throttle: usize,
    /// Chunk size used to count chunks per blob (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using chunk_throttle".to_string());
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_throttle_needs_chunk_size() {
        let mut config = ThrottleConfig {
            chunk_throttle: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.chunk_size = 4 * 1024 * 1024;
        assert!(config.validate().is_ok());
        assert!(ThrottleConfig::default().validate().is_ok());
    }
}
