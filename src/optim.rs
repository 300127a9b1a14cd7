//! Optimizer(s)

use crate::tensor::{Parameter, Tensor, TensorError, gradients};

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Differentiates `loss` with respect to the optimized parameters and applies a single update
    fn step(&mut self, loss: &Tensor) -> Result<(), TensorError>;
}

/// Plain gradient descent with a fixed learning rate
///
/// Follows the additive convention `param <- param + lr * grad`, so descending the
/// loss takes a negative `lr`.
pub struct SGD {
    params: Vec<Parameter>,
    lr: f32,
}

impl SGD {
    pub fn new(params: Vec<Parameter>, lr: f32) -> Self {
        Self { params, lr }
    }
}

impl Optim for SGD {
    fn step(&mut self, loss: &Tensor) -> Result<(), TensorError> {
        let grads = gradients(loss, &self.params)?;
        for (param, grad) in self.params.iter_mut().zip(grads.iter()) {
            param.update(grad, self.lr)?;
        }
        Ok(())
    }
}
