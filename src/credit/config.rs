use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};

/// Discretization and quadrature controls shared by the semi-analytic engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossModelConfig {
    /// Number of loss-grid steps between zero and the basket notional.
    pub grid_size: usize,
    /// Pick a loss unit that every name's loss is a whole multiple of, when such a unit
    /// needs at most `grid_size` steps; otherwise fall back to the even grid.
    pub adaptive: bool,
    /// First-stage (systemic factor) quadrature order per factor.
    pub factor_order: usize,
    /// Second-stage (recovery dispersion) quadrature order.
    pub recovery_order: usize,
}

impl Default for LossModelConfig {
    fn default() -> Self {
        Self {
            grid_size: 500,
            adaptive: true,
            factor_order: 48,
            recovery_order: 8,
        }
    }
}

impl LossModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grid_size == 0 {
            return Err(CreditError::invalid("grid_size must be >= 1"));
        }
        if self.factor_order == 0 || self.recovery_order == 0 {
            return Err(CreditError::invalid("quadrature orders must be >= 1"));
        }
        Ok(())
    }
}
