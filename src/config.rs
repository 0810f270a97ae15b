use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the iterations of a plan are executed on this rank.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// A single loop over the blocks of the plan, in plan order.
    Sequential,
    /// The blocks of one color run in parallel on a thread pool, colors one after another.
    Threaded,
    /// Threaded execution that overlaps halo exchange with the core iterations.
    Distributed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coloring {
    /// First-fit greedy coloring of the conflict graph.
    Greedy,
    /// Put every iteration in a single color. Only valid for the sequential backend.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: Backend,
    /// Size of the thread pool. `None` uses the rayon default.
    pub num_threads: Option<usize>,
    /// Maximum number of iterations in a block.
    pub block_size: usize,
    /// Maximum number of distinct indirectly addressed entities in a block.
    pub locality_budget: usize,
    pub coloring: Coloring,
    /// How long a rank waits for a halo or reduction message before the loop fails.
    pub exchange_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Threaded,
            num_threads: None,
            block_size: 256,
            locality_budget: 2048,
            coloring: Coloring::Greedy,
            exchange_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn with_backend(self, backend: Backend) -> Self {
        Self { backend, ..self }
    }

    pub fn with_num_threads(self, num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
            ..self
        }
    }

    pub fn with_block_size(self, block_size: usize) -> Self {
        Self { block_size, ..self }
    }

    pub fn with_locality_budget(self, locality_budget: usize) -> Self {
        Self {
            locality_budget,
            ..self
        }
    }

    pub fn with_coloring(self, coloring: Coloring) -> Self {
        Self { coloring, ..self }
    }

    pub fn with_exchange_timeout(self, timeout: Duration) -> Self {
        Self {
            exchange_timeout_ms: timeout.as_millis() as u64,
            ..self
        }
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError {
                reason: reason.to_string(),
            })
        };
        if self.block_size == 0 {
            return invalid("block size must be positive");
        }
        if self.locality_budget == 0 {
            return invalid("locality budget must be positive");
        }
        if self.num_threads == Some(0) {
            return invalid("number of threads must be positive");
        }
        if self.exchange_timeout_ms == 0 {
            return invalid("exchange timeout must be positive");
        }
        Ok(())
    }
}
