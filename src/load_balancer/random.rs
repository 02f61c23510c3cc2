// src/load_balancer/random.rs

use super::LoadBalancer;
use crate::backend::Backend;
use rand::Rng;

/// Uniform random selection, no weights, no state between picks.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn select<'a>(&self, active: &'a [Backend]) -> &'a Backend {
        let idx = rand::thread_rng().gen_range(0..active.len());
        &active[idx]
    }
}
