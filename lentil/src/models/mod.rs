pub mod mixture;
pub mod mixtureset;
pub mod normal;
pub mod normalset;
pub mod traits;
pub mod vae;

pub use mixture::{Mixture, MixtureState};
pub use mixtureset::{MixtureSet, MixtureSetElement, MixtureSetState};
pub use normal::{
    NormalDiagonalCovariance, NormalFullCovariance, NormalIsotropicCovariance, NormalView,
};
pub use normalset::{
    NormalDiagonalCovarianceSet, NormalFullCovarianceSet, NormalSetSharedDiagonalCovariance,
    NormalSetSharedFullCovariance,
};
pub use traits::*;
pub use vae::{ObservationNoise, Vae, VaeState};
