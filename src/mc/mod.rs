//! Monte Carlo simulation of basket default and prepayment events.
//!
//! [`engine::PathSimulator`] turns a basket into reproducible paths, [`sampler`] decides how
//! paths are allocated (plain or stratified on the default count) and [`accumulator`] folds
//! weighted paths into per-date statistics and loss histograms.

pub mod accumulator;
pub mod engine;
pub mod sampler;

use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};

pub use accumulator::{OnlineMoments, PathAggregator};
pub use engine::{PathScratch, PathSimulator, SimulatedPath, fold_paths, simulate_paths, simulate_paths_parallel};
pub use sampler::{Sampler, StratifiedConfig, Stratum};

/// Monte Carlo controls.
///
/// With a stratified sampler the path count is the sum of the strata paths and `paths`
/// is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McConfig {
    pub paths: usize,
    pub seed: u64,
    pub sampler: Sampler,
    /// Paths folded per work item; results do not depend on it.
    pub chunk_size: usize,
}

impl Default for McConfig {
    fn default() -> Self {
        Self {
            paths: 100_000,
            seed: 42,
            sampler: Sampler::Plain,
            chunk_size: 4096,
        }
    }
}

impl McConfig {
    pub fn with_paths(paths: usize, seed: u64) -> Self {
        Self {
            paths,
            seed,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CreditError::invalid("chunk_size must be >= 1"));
        }
        match &self.sampler {
            Sampler::Plain if self.paths == 0 => Err(CreditError::invalid("paths must be >= 1")),
            Sampler::Plain => Ok(()),
            Sampler::Stratified(cfg) => cfg.validate(),
        }
    }

    pub fn total_paths(&self) -> usize {
        match &self.sampler {
            Sampler::Plain => self.paths,
            Sampler::Stratified(cfg) => cfg.total_paths(),
        }
    }
}

/// Per-date Monte Carlo estimates with their standard errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McStatistics {
    pub dates: Vec<f64>,
    pub expected_loss: Vec<f64>,
    pub loss_stderr: Vec<f64>,
    pub expected_defaults: Vec<f64>,
    pub defaults_stderr: Vec<f64>,
    pub expected_amortization: Vec<f64>,
    pub amortization_stderr: Vec<f64>,
    pub paths: usize,
    pub weight_sum: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json_with_defaults() {
        let cfg: McConfig = serde_json::from_str(r#"{"paths": 500}"#).unwrap();
        assert_eq!(cfg.paths, 500);
        assert_eq!(cfg.seed, 42);
        assert_eq!(cfg.sampler, Sampler::Plain);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn stratified_total_overrides_paths() {
        let cfg = McConfig {
            paths: 10,
            sampler: Sampler::Stratified(StratifiedConfig::from_boundaries(&[0, 4], 25).unwrap()),
            ..McConfig::default()
        };
        assert_eq!(cfg.total_paths(), 50);
        assert!(McConfig { chunk_size: 0, ..McConfig::default() }.validate().is_err());
        assert!(McConfig::with_paths(0, 1).validate().is_err());
    }
}
