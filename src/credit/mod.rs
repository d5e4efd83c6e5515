//! Credit portfolio loss modelling: names, dependence, loss grids and basket engines.
//!
//! Survival curves and recoveries are consumed as already fitted inputs. A [`Basket`]
//! normalizes names, correlation and grids; the engines in [`basket`] turn it into
//! per-date loss and amortization distributions, and [`tranche`] maps those onto
//! attachment/detachment windows.

pub mod basket;
pub mod config;
pub mod copula;
pub mod distribution;
pub mod factor;
pub mod loss_grid;
pub mod name;
pub mod quadrature;
pub mod recovery;
pub mod survival_curve;
pub mod tranche;

pub use basket::{
    Basket, BasketBuilder, BasketLossModel, CdoSquaredBasket, CdoSquaredMethod, DateGrid,
    DefaultedAdjustment, HeterogeneousBasket, HomogeneousBasket, InnerTranche, LargePoolBasket,
    MonteCarloBasket, NthToDefaultBasket, UniformBasket,
};
pub use config::LossModelConfig;
pub use copula::{Copula, CopulaEngine};
pub use distribution::{BasketDistribution, DistributionKind, GridDistribution, LossDistributionGrid};
pub use factor::{CorrelationSpec, FactorLoadings};
pub use loss_grid::LossGrid;
pub use name::CreditName;
pub use quadrature::FactorQuadrature;
pub use recovery::Recovery;
pub use survival_curve::{SurvivalCurve, SurvivalTermStructure};
pub use tranche::{
    LossWindow, TrancheSpec, cumulative_probability, expected_tranche_amortization,
    expected_tranche_loss, tranche_amortization, tranche_expected_loss,
};
