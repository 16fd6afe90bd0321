//! Mean-field variational inference (MFVI) for Bayesian neural networks.
//!
//! Implements Bayes-by-Backprop style training: each Bayesian layer
//! keeps a diagonal Gaussian posterior over its weights (and bias),
//! forward passes draw parameters by reparameterization, and the
//! training objective is the negative evidence lower bound
//!
//! ```text
//! nelbo = nll + minibatch_ratio * KL(q || p)
//! ```
//!
//! with the KL available in closed form because posterior and prior are
//! both diagonal Gaussians.
//!
//! # Key characteristics
//!
//! - Capability interface (`LayerVariational`) instead of a closed list
//!   of layer types; aggregation skips deterministic layers silently
//! - Std positivity is structural: layers store ln_std and expose
//!   exp(ln_std)
//! - One parametrized objective body; negative-ELBO, MLG and MAP differ
//!   only in the plugged complexity term
//!
//! # Example
//!
//! ```ignore
//! use bnn_util::mfvi::{linear_bnn, nelbo, BayesLinearConfig, GaussianNll, NegativeLogLikelihood};
//!
//! let model = linear_bnn(vb.pp("bnn"), &[1, 50, 50, 1], Activation::Relu, &config)?;
//! let likelihood = GaussianNll::new(vb.pp("likelihood"), -3.0)?;
//!
//! // Training loop
//! for _ in 0..num_epochs {
//!     let pred = model.forward(&x)?;
//!     let nll = likelihood.nll(&pred, &y)?;
//!     let terms = nelbo(&model, nll, minibatch_ratio, &device)?;
//!     // optimizer.backward_step(&terms.total)?;
//! }
//! ```

mod emp_linear;
mod functional;
mod likelihood;
mod linear;
mod mlg_linear;
mod stack;
mod traits;

pub use emp_linear::{EmpBayesLinear, ExtEmpBayesLinear};
pub use functional::{
    gaussian_kl, gaussian_kl_model, maximum_a_posteriori, mlg_nelbo, nelbo, objective,
    penalized_nll, standard_normal_kl_model, LossTerms, ObjectiveKind,
};
pub use likelihood::{accuracy, CategoricalNll, GaussianNll};
pub use linear::{BayesLinear, BayesLinearConfig};
pub use mlg_linear::MlgBayesLinear;
pub use stack::{linear_bnn, linear_emp_bnn, linear_ext_emp_bnn, linear_mlg_bnn, BnnStack};
pub use traits::{
    BayesModuleT, GaussianStats, LayerVariational, NegativeLogLikelihood, VariationalModel,
};
