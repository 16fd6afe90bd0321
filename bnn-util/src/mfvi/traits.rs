use candle_core::{Result, Tensor};
use candle_nn::Module;

/// Mean and standard deviation of a diagonal Gaussian.
///
/// The two tensors must be broadcastable against each other; a 0-dim
/// tensor stands for a shared scalar parameter.
pub struct GaussianStats {
    pub mean: Tensor,
    pub std: Tensor,
}

/// Capability interface for layers that carry a mean-field variational
/// posterior and a Gaussian prior over their parameters.
///
/// KL aggregation iterates over layers exposing this interface; any layer
/// variant may implement it, there is no closed list of recognized kinds.
pub trait LayerVariational {
    /// Posterior statistics of the weight matrix, shape (out, in).
    fn weight_posterior(&self) -> Result<GaussianStats>;

    /// Prior statistics of the weight matrix, broadcastable to (out, in).
    fn weight_prior(&self) -> Result<GaussianStats>;

    /// Posterior statistics of the bias vector, shape (out), if present.
    fn bias_posterior(&self) -> Result<Option<GaussianStats>>;

    /// Prior statistics of the bias vector, broadcastable to (out).
    fn bias_prior(&self) -> Result<Option<GaussianStats>>;

    /// Whether the bias term participates in the variational scheme.
    fn has_bias(&self) -> bool;
}

/// A model whose variational layers can be enumerated for KL aggregation.
pub trait VariationalModel {
    /// All layers exposing `LayerVariational`, in model order.
    /// Deterministic layers are simply absent from the result.
    fn variational_layers(&self) -> Vec<&dyn LayerVariational>;
}

/// A module that may be stacked into a Bayesian neural network.
///
/// `forward` draws fresh parameter samples where the layer is stochastic;
/// `forward_mean` propagates posterior means for deterministic prediction.
pub trait BayesModuleT: Module {
    /// The variational capability of this layer, if it has one.
    fn variational(&self) -> Option<&dyn LayerVariational> {
        None
    }

    /// Forward pass through posterior means (no sampling).
    fn forward_mean(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

/// Plain deterministic layers pass through unchanged and contribute
/// nothing to the KL term.
impl BayesModuleT for candle_nn::Linear {}

/// Negative log-likelihood term of the training objective.
///
/// Implementations return a 0-dim tensor (sum reduction over the
/// minibatch) with gradient linkage to `pred` and to any auxiliary
/// likelihood parameters they own.
pub trait NegativeLogLikelihood {
    fn nll(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor>;
}
