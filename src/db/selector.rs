//! Strategies for picking the slave engine behind a read session.

use crate::error::{DbError, DbResult};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks an index into the configured slaves. `count` is always at least 1.
pub trait SlaveSelector: Send + Sync + std::fmt::Debug {
    fn select(&self, count: usize) -> usize;
}

/// Uniformly random choice; the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformRandom;

impl SlaveSelector for UniformRandom {
    fn select(&self, count: usize) -> usize {
        if count <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0..count)
    }
}

/// Cycles through slaves in configuration order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SlaveSelector for RoundRobin {
    fn select(&self, count: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % count.max(1)
    }
}

/// Random choice proportional to per-slave weights.
#[derive(Debug)]
pub struct Weighted {
    weights: Vec<u32>,
    index: WeightedIndex<u32>,
}

impl Weighted {
    pub fn new(weights: Vec<u32>) -> DbResult<Self> {
        let index = WeightedIndex::new(&weights)
            .map_err(|e| DbError::configuration(format!("Invalid slave weights: {}", e)))?;
        Ok(Self { weights, index })
    }
}

impl SlaveSelector for Weighted {
    fn select(&self, count: usize) -> usize {
        let picked = self.index.sample(&mut rand::thread_rng());
        // Weights for slaves that no longer exist are ignored.
        if picked < count {
            picked
        } else {
            picked % count.max(1)
        }
    }
}

impl Weighted {
    pub fn weights(&self) -> &[u32] {
        &self.weights
    }
}
