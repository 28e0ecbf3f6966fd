//! Natural-gradient variational Bayes with conjugate
//! exponential-family priors.
//!
//! Every trainable quantity is a [`parameters::BayesianParameter`]:
//! a prior and a posterior of the same [`expfamily::Family`]. Models
//! map data to sufficient statistics, compute their expected
//! log-likelihood under the posteriors and route responsibility
//! weighted statistics back to their parameters, which
//! [`training::BayesianModelOptimizer`] turns into closed-form natural
//! gradient steps.

pub mod error;
pub mod expfamily;
pub mod models;
pub mod parameters;
pub mod training;
pub mod utils;

pub use error::ModelError;
