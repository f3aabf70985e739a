//! Input generations used to discard stale asynchronous results.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PipelineError, PipelineResult};

/// One (image, threshold) submission. Zero means nothing was submitted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic epoch counter shared by detection and rendering.
#[derive(Debug, Default)]
pub struct EpochCounter {
    current: AtomicU64,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, invalidating everything in flight.
    pub fn advance(&self) -> Epoch {
        Epoch(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn current(&self) -> Epoch {
        Epoch(self.current.load(Ordering::Acquire))
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.current() == epoch
    }

    pub fn ensure_current(&self, epoch: Epoch) -> PipelineResult<()> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(PipelineError::Stale { epoch })
        }
    }
}
