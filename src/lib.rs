#![deny(dead_code)]
#![deny(unused_imports)]

pub mod atoms;
pub mod dataset;
pub mod empirical;
pub mod error;
pub mod imputer;
pub mod linalg;
pub mod mixture;
pub mod probability;
pub mod regression;
mod suffstats;
pub mod workers;

pub use atoms::{AtomCatalog, CellCategory, ErrorCorrectionModel};
pub use dataset::{DataSet, Observation};
pub use empirical::{EmpiricalDistribution, EmpiricalDistributionState};
pub use error::ImputeError;
pub use imputer::MvRegCopulaImputer;
pub use mixture::MixingWeights;
pub use regression::{CopulaRegression, RegressionPrior};
pub use workers::WorkerPool;
