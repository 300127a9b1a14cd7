//! Gradient rules for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph.

use ndarray::{Array2, Axis};

use crate::loss::log_softmax;

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    AddBias,
    DotProduct,
    Linear,
    ReLU,
    SquareLoss,
    SoftmaxLoss,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::ReLU => 1,
            BackpropFunc::Add
            | BackpropFunc::AddBias
            | BackpropFunc::DotProduct
            | BackpropFunc::Linear
            | BackpropFunc::SquareLoss
            | BackpropFunc::SoftmaxLoss => 2,
        }
    }
}

/// Represents backprop for the operation `x + y = out`
pub fn add(grad: &Array2<f32>) -> Vec<Array2<f32>> {
    vec![grad.clone(), grad.clone()]
}

/// Represents backprop for the operation `features + bias = out`, the bias being broadcast over rows
pub fn add_bias(grad: &Array2<f32>) -> Vec<Array2<f32>> {
    vec![grad.clone(), grad.sum_axis(Axis(0)).insert_axis(Axis(0))]
}

/// Represents backprop for the operation `features . weights^T = out`
pub fn dot_product(features: &Array2<f32>, weights: &Array2<f32>, grad: &Array2<f32>) -> Vec<Array2<f32>> {
    vec![grad.dot(weights), grad.t().dot(features)]
}

/// Represents backprop for the operation `features @ weights = out`
pub fn linear(features: &Array2<f32>, weights: &Array2<f32>, grad: &Array2<f32>) -> Vec<Array2<f32>> {
    vec![grad.dot(&weights.t()), features.t().dot(grad)]
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(input: &Array2<f32>, grad: &Array2<f32>) -> Vec<Array2<f32>> {
    let mask = input.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    vec![mask * grad]
}

/// Represents backprop for `mean((a - b)^2) / 2 = out`
pub fn square_loss(a: &Array2<f32>, b: &Array2<f32>, grad: &Array2<f32>) -> Vec<Array2<f32>> {
    let scale = grad[[0, 0]] / a.len() as f32;
    let diff = (a - b) * scale;
    let neg = -&diff;
    vec![diff, neg]
}

/// Represents backprop for softmax cross-entropy averaged over the batch
pub fn softmax_loss(logits: &Array2<f32>, labels: &Array2<f32>, grad: &Array2<f32>) -> Vec<Array2<f32>> {
    let scale = grad[[0, 0]] / logits.nrows() as f32;
    let log_probs = log_softmax(logits);
    let probs = log_probs.mapv(f32::exp);
    vec![(probs - labels) * scale, log_probs * -scale]
}

/// Gradients for every input of a node, in the order the inputs were recorded
pub fn input_gradients(
    backprop_fn: BackpropFunc,
    inputs: &[&Array2<f32>],
    grad: &Array2<f32>,
) -> Vec<Array2<f32>> {
    debug_assert_eq!(backprop_fn.n_operands(), inputs.len());
    match backprop_fn {
        BackpropFunc::Add => add(grad),
        BackpropFunc::AddBias => add_bias(grad),
        BackpropFunc::DotProduct => dot_product(inputs[0], inputs[1], grad),
        BackpropFunc::Linear => linear(inputs[0], inputs[1], grad),
        BackpropFunc::ReLU => relu(inputs[0], grad),
        BackpropFunc::SquareLoss => square_loss(inputs[0], inputs[1], grad),
        BackpropFunc::SoftmaxLoss => softmax_loss(inputs[0], inputs[1], grad),
    }
}
