//! Softmax cross-entropy for classification.

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;

use crate::mfvi::traits::NegativeLogLikelihood;

/// Categorical negative log-likelihood (softmax cross-entropy), sum
/// reduction.
///
/// `pred` holds logits of shape (n, k); `target` holds class indexes of
/// shape (n) or (n, 1), any integer-valued dtype.
pub struct CategoricalNll;

impl NegativeLogLikelihood for CategoricalNll {
    fn nll(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        let labels = class_indexes(target)?;
        let log_prob_nk = ops::log_softmax(pred, 1)?;
        let picked_n1 = log_prob_nk.gather(&labels.unsqueeze(1)?, 1)?;
        picked_n1.sum_all()?.neg()
    }
}

fn class_indexes(target: &Tensor) -> Result<Tensor> {
    let target = if target.rank() == 2 {
        target.squeeze(1)?
    } else {
        target.clone()
    };
    target.to_dtype(DType::U32)
}

/// Fraction of rows where the argmax logit matches the label.
pub fn accuracy(logits_nk: &Tensor, target: &Tensor) -> Result<f32> {
    let labels = class_indexes(target)?;
    let predicted = logits_nk.argmax(1)?;
    predicted
        .eq(&labels)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar()
}
