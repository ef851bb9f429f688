//! Ordered consumption of a route's backend targets.

use std::collections::VecDeque;

use crate::routing::router::Target;

/// Hands out targets front to back. A target is never returned twice.
#[derive(Debug, Clone, Default)]
pub struct TargetSequencer {
    remaining: VecDeque<Target>,
}

impl TargetSequencer {
    pub fn new(targets: impl IntoIterator<Item = Target>) -> Self {
        Self {
            remaining: targets.into_iter().collect(),
        }
    }

    /// Remove and return the next target; `None` once exhausted.
    pub fn next(&mut self) -> Option<Target> {
        self.remaining.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_empty()
    }
}
