//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VecError};

fn default_block_width() -> usize {
    128
}

fn default_reduce_width() -> usize {
    256
}

/// Tunables fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum threads per block for elementwise launches.
    #[serde(default = "default_block_width")]
    pub block_width: usize,
    /// Column threshold above which log-sum-exp reduces in groups first.
    /// Also the widest block a reduction launch uses.
    #[serde(default = "default_reduce_width")]
    pub reduce_width: usize,
    /// Generator seed applied at session start; entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_width: default_block_width(),
            reduce_width: default_reduce_width(),
            seed: None,
        }
    }
}

impl SessionConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_width == 0 {
            return Err(VecError::Configuration("block_width must be positive".into()));
        }
        if self.reduce_width < 2 || !gvec_kernels::is_power_of_two(self.reduce_width) {
            return Err(VecError::Configuration(format!(
                "reduce_width must be a power of two of at least 2, got {}",
                self.reduce_width
            )));
        }
        Ok(())
    }
}
