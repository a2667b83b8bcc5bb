//! Kernel configuration
//!
//! Sizes and timing knobs fixed at boot. Every field has a default, so a
//! JSON document only needs the fields it changes.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Boot-time kernel configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Most unreaped user processes at once
    pub max_processes: usize,
    /// Mutex registry size, reserved slot 0 included
    pub max_mutexes: usize,
    /// Semaphore registry size, reserved slot 0 included
    pub max_semaphores: usize,
    /// Bytes added to every image for the user and kernel stacks
    pub stack_reserve: u32,
    /// Top part of the reserve kept for the kernel stack
    pub kernel_stack_size: u32,
    /// Milliseconds per timer tick
    pub tick_ms: u32,
    /// Commits kept in memory
    pub commit_log_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: 64,
            max_mutexes: 256,
            max_semaphores: 256,
            stack_reserve: 16384,
            kernel_stack_size: 4096,
            tick_ms: 10,
            commit_log_capacity: 1024,
        }
    }
}

impl KernelConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|_| ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the kernel cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_processes == 0 {
            return Err(ConfigError::Invalid("max_processes must be at least 1"));
        }
        if self.max_mutexes < 2 {
            return Err(ConfigError::Invalid("max_mutexes must be at least 2"));
        }
        if self.max_semaphores < 2 {
            return Err(ConfigError::Invalid("max_semaphores must be at least 2"));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be nonzero"));
        }
        // The initial stack pointer sits 4 bytes below the kernel stack
        if self.kernel_stack_size.saturating_add(4) > self.stack_reserve {
            return Err(ConfigError::Invalid(
                "stack_reserve must exceed kernel_stack_size",
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Not valid JSON, or a field has the wrong type
    Parse,
    /// Parsed but unusable
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse => write!(f, "malformed configuration"),
            ConfigError::Invalid(why) => write!(f, "invalid configuration: {}", why),
        }
    }
}
