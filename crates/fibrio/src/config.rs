//! Runtime configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! Environment variables (all optional):
//! - `FIBRIO_QUEUE_DEPTH` — io_uring submission-queue depth
//! - `FIBRIO_N_BLOCKS` — fixed-buffer block count
//! - `FIBRIO_BLOCK_SIZE` — fixed-buffer block size in bytes
//! - `FIBRIO_SQPOLL_IDLE_MS` — enable kernel SQ polling with this idle time
//! - `FIBRIO_DEBUG` — scheduler diagnostics to stderr (0/1)

use std::time::Duration;

use fibrio_core::{Error, Result};

/// Default submission-queue depth.
pub const DEFAULT_QUEUE_DEPTH: u32 = 64;

/// Default fixed-buffer block size.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

fn env_get<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Scheduler configuration with builder-style setters.
#[derive(Debug, Clone)]
pub struct Config {
    /// io_uring submission-queue depth. Must be a power of two.
    pub queue_depth: u32,
    /// Number of fixed-buffer blocks registered with the kernel.
    pub n_blocks: usize,
    /// Size of one fixed-buffer block.
    pub block_size: usize,
    /// When set, the ring is created with kernel SQ polling and this idle
    /// timeout; submissions then skip the `io_uring_enter` syscall while the
    /// poller thread is awake.
    pub sqpoll_idle: Option<Duration>,
    /// Scheduler diagnostics to stderr.
    pub debug_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    /// Library defaults, no environment overrides.
    pub fn new() -> Self {
        Config {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            n_blocks: DEFAULT_QUEUE_DEPTH as usize,
            block_size: DEFAULT_BLOCK_SIZE,
            sqpoll_idle: None,
            debug_logging: false,
        }
    }

    /// Library defaults with `FIBRIO_*` environment overrides.
    pub fn from_env() -> Self {
        let queue_depth = env_get("FIBRIO_QUEUE_DEPTH", DEFAULT_QUEUE_DEPTH);
        Config {
            queue_depth,
            n_blocks: env_get("FIBRIO_N_BLOCKS", queue_depth as usize),
            block_size: env_get("FIBRIO_BLOCK_SIZE", DEFAULT_BLOCK_SIZE),
            sqpoll_idle: std::env::var("FIBRIO_SQPOLL_IDLE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            debug_logging: env_get("FIBRIO_DEBUG", 0u8) != 0,
        }
    }

    pub fn queue_depth(mut self, n: u32) -> Self {
        self.queue_depth = n;
        self
    }

    pub fn n_blocks(mut self, n: usize) -> Self {
        self.n_blocks = n;
        self
    }

    pub fn block_size(mut self, n: usize) -> Self {
        self.block_size = n;
        self
    }

    pub fn sqpoll_idle(mut self, idle: Duration) -> Self {
        self.sqpoll_idle = Some(idle);
        self
    }

    pub fn debug_logging(mut self, on: bool) -> Self {
        self.debug_logging = on;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 || !self.queue_depth.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "queue_depth must be a nonzero power of two, got {}",
                self.queue_depth
            )));
        }
        if self.block_size == 0 || self.n_blocks == 0 {
            return Err(Error::InvalidConfig(
                "block_size and n_blocks must be nonzero".to_string(),
            ));
        }
        if self.n_blocks > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "n_blocks is limited to {}, got {}",
                u16::MAX,
                self.n_blocks
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::new();
        assert_eq!(cfg.queue_depth, 64);
        assert_eq!(cfg.n_blocks, 64);
        assert_eq!(cfg.block_size, 4096);
        assert!(cfg.sqpoll_idle.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = Config::new().queue_depth(16).n_blocks(4).block_size(512);
        assert_eq!(cfg.queue_depth, 16);
        assert_eq!(cfg.n_blocks, 4);
        assert_eq!(cfg.block_size, 512);
    }

    #[test]
    fn test_validate_rejects_bad_depth() {
        assert!(Config::new().queue_depth(0).validate().is_err());
        assert!(Config::new().queue_depth(48).validate().is_err());
        assert!(Config::new().queue_depth(128).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(Config::new().block_size(0).validate().is_err());
        assert!(Config::new().n_blocks(0).validate().is_err());
    }
}
