//! KL annealing schedules.

use serde::{Deserialize, Serialize};

/// Raises beta whenever the reconstruction loss stops improving.
///
/// Each epoch the solver reports its mean reconstruction loss. After `patience`
/// reports without an improvement larger than `min_delta`, beta grows by
/// `beta_increment` (capped at `beta_max`) and the best loss is re-based, since
/// the higher KL weight is expected to raise the reconstruction loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaScheduler {
    pub beta: f32,
    pub beta_max: f32,
    pub beta_increment: f32,
    pub patience: usize,
    pub min_delta: f32,
    best: Option<f32>,
    bad_epochs: usize,
}

impl BetaScheduler {
    pub fn new(
        beta: f32,
        beta_max: f32,
        beta_increment: f32,
        patience: usize,
        min_delta: f32,
    ) -> Self {
        Self {
            beta,
            beta_max,
            beta_increment,
            patience,
            min_delta,
            best: None,
            bad_epochs: 0,
        }
    }

    /// A scheduler that never changes beta.
    pub fn constant(beta: f32) -> Self {
        Self::new(beta, beta, 0.0, 0, 0.0)
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    pub fn bad_epochs(&self) -> usize {
        self.bad_epochs
    }

    /// Returns true when beta changed.
    pub fn observe(&mut self, recon_loss: f32) -> bool {
        if self.patience == 0 || self.beta >= self.beta_max {
            return false;
        }

        let improved = recon_loss.is_finite()
            && match self.best {
                None => true,
                Some(best) => recon_loss < best - self.min_delta,
            };

        if improved {
            self.best = Some(recon_loss);
            self.bad_epochs = 0;
            return false;
        }

        self.bad_epochs += 1;
        if self.bad_epochs < self.patience {
            return false;
        }

        self.beta = (self.beta + self.beta_increment).min(self.beta_max);
        self.bad_epochs = 0;
        if recon_loss.is_finite() {
            self.best = Some(recon_loss);
        }
        true
    }
}

/// Linearly grows the KL capacity target from `c_offset` to `c_max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacitySchedule {
    pub c_offset: f32,
    pub c_max: f32,
    pub c_stop_iter: usize,
}

impl CapacitySchedule {
    pub fn capacity(&self, iteration: usize) -> f32 {
        if self.c_stop_iter == 0 {
            return self.c_max;
        }
        let progress = iteration as f32 / self.c_stop_iter as f32;
        let c = self.c_offset + (self.c_max - self.c_offset) * progress;
        c.min(self.c_max)
    }
}
