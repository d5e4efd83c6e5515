//! Path allocation: plain sampling or stratification on the horizon default count.
//!
//! A stratum covers the default counts `min_defaults..=max_defaults` (counted over names
//! without a pre-set default time) and receives `paths` paths. Within a stratum the counts
//! are enumerated in full cycles; the remainder draws the count uniformly. A path with
//! count `k` and factor `m` carries the weight `|K_s| P(D = k | m) / n_s`, which makes
//! every stratum an unbiased estimate of its probability mass.

use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stratum {
    pub min_defaults: usize,
    /// Inclusive; clamped to the number of random names.
    pub max_defaults: usize,
    pub paths: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratifiedConfig {
    pub strata: Vec<Stratum>,
}

impl StratifiedConfig {
    /// Contiguous strata starting at zero defaults.
    pub fn new(strata: Vec<Stratum>) -> Result<Self> {
        let config = Self { strata };
        config.validate()?;
        Ok(config)
    }

    /// One stratum covering every default count.
    pub fn single(paths: usize) -> Self {
        Self {
            strata: vec![Stratum {
                min_defaults: 0,
                max_defaults: usize::MAX,
                paths,
            }],
        }
    }

    /// Strata `[b_0, b_1 - 1], [b_1, b_2 - 1], ..., [b_last, inf)` with `boundaries[0] = 0`
    /// and the same number of paths in each.
    pub fn from_boundaries(boundaries: &[usize], paths_per_stratum: usize) -> Result<Self> {
        let strata = boundaries
            .iter()
            .enumerate()
            .map(|(s, &lo)| Stratum {
                min_defaults: lo,
                max_defaults: boundaries
                    .get(s + 1)
                    .map_or(usize::MAX, |&next| next.saturating_sub(1)),
                paths: paths_per_stratum,
            })
            .collect();
        Self::new(strata)
    }

    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.strata.first() else {
            return Err(CreditError::invalid("stratified sampler needs at least one stratum"));
        };
        if first.min_defaults != 0 {
            return Err(CreditError::invalid("the first stratum must start at zero defaults"));
        }
        for s in &self.strata {
            if s.paths == 0 {
                return Err(CreditError::invalid("every stratum needs at least one path"));
            }
            if s.max_defaults < s.min_defaults {
                return Err(CreditError::invalid(format!(
                    "stratum [{}, {}] is empty",
                    s.min_defaults, s.max_defaults
                )));
            }
        }
        if self
            .strata
            .windows(2)
            .any(|w| w[0].max_defaults.checked_add(1) != Some(w[1].min_defaults))
        {
            return Err(CreditError::invalid("strata must be contiguous and ascending"));
        }
        Ok(())
    }

    pub fn total_paths(&self) -> usize {
        self.strata.iter().map(|s| s.paths).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sampler {
    #[default]
    Plain,
    Stratified(StratifiedConfig),
}

/// Stratum bounds resolved against the number of random names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StratumSlot {
    pub lo: usize,
    pub hi: usize,
    pub paths: usize,
    pub first_path: u64,
}

impl StratumSlot {
    pub fn width(&self) -> usize {
        self.hi + 1 - self.lo
    }

    /// Count assigned to the `local`-th path; `draw` in `[0, 1)` is used past the last full
    /// cycle.
    pub fn count(&self, local: usize, draw: f64) -> usize {
        let width = self.width();
        let cycled = (self.paths / width) * width;
        if local < cycled {
            self.lo + local % width
        } else {
            (self.lo + (draw * width as f64) as usize).min(self.hi)
        }
    }
}

/// Maps a global path index to its stratum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StratifiedPlan {
    slots: Vec<StratumSlot>,
}

impl StratifiedPlan {
    pub fn new(config: &StratifiedConfig, random_names: usize) -> Result<Self> {
        config.validate()?;
        let mut slots = Vec::with_capacity(config.strata.len());
        let mut first_path = 0_u64;
        for s in &config.strata {
            if s.min_defaults > random_names {
                return Err(CreditError::invalid(format!(
                    "stratum starting at {} defaults exceeds the {random_names} random names",
                    s.min_defaults
                )));
            }
            slots.push(StratumSlot {
                lo: s.min_defaults,
                hi: s.max_defaults.min(random_names),
                paths: s.paths,
                first_path,
            });
            first_path += s.paths as u64;
        }
        if slots.last().is_some_and(|s| s.hi < random_names) {
            return Err(CreditError::invalid(format!(
                "strata must cover every default count up to {random_names}"
            )));
        }
        Ok(Self { slots })
    }

    /// Stratum of `path` and the path's index inside it.
    pub fn locate(&self, path: u64) -> Option<(&StratumSlot, usize)> {
        let s = self.slots.partition_point(|slot| slot.first_path <= path);
        let slot = self.slots.get(s.checked_sub(1)?)?;
        let local = (path - slot.first_path) as usize;
        (local < slot.paths).then_some((slot, local))
    }

    pub fn total_paths(&self) -> usize {
        self.slots.iter().map(|s| s.paths).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_build_contiguous_strata() {
        let cfg = StratifiedConfig::from_boundaries(&[0, 2, 5], 100).unwrap();
        assert_eq!(cfg.strata[0].max_defaults, 1);
        assert_eq!(cfg.strata[1].max_defaults, 4);
        assert_eq!(cfg.strata[2].max_defaults, usize::MAX);
        assert_eq!(cfg.total_paths(), 300);
        assert!(StratifiedConfig::from_boundaries(&[1, 3], 10).is_err());
        assert!(StratifiedConfig::from_boundaries(&[0, 3, 3], 10).is_err());
    }

    #[test]
    fn plan_locates_paths_and_clamps_to_the_pool() {
        let cfg = StratifiedConfig::from_boundaries(&[0, 3], 4).unwrap();
        let plan = StratifiedPlan::new(&cfg, 5).unwrap();
        let (slot, local) = plan.locate(5).unwrap();
        assert_eq!((slot.lo, slot.hi, local), (3, 5, 1));
        assert!(plan.locate(8).is_none());
        assert!(StratifiedPlan::new(&cfg, 2).is_err());
    }

    #[test]
    fn counts_cycle_before_random_draws() {
        let slot = StratumSlot {
            lo: 2,
            hi: 4,
            paths: 7,
            first_path: 0,
        };
        let counts: Vec<_> = (0..6).map(|q| slot.count(q, 0.0)).collect();
        assert_eq!(counts, vec![2, 3, 4, 2, 3, 4]);
        assert_eq!(slot.count(6, 0.99), 4);
        assert_eq!(slot.count(6, 0.0), 2);
    }
}
