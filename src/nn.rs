//! Components shared by the models: module traits, training configuration and errors

use ndarray::{Array2, ArrayView1};
use thiserror::Error;

use crate::{
    dataloader::{DataLoader, DataLoaderError},
    optim::Optim,
    tensor::{Parameter, Tensor, TensorError},
};

/// Errors for running a model
#[derive(Debug, Error, PartialEq)]
pub enum NNError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("Input sequence must contain at least one step")]
    EmptySequence,
}

/// Errors for training a model
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Data(#[from] DataLoaderError),
    #[error("Training did not converge after {iterations} iterations (last metric: {metric})")]
    DidNotConverge { iterations: usize, metric: f32 },
}

/// Loosely analogous to torch.nn.Module. Every model implements this trait.
pub trait Module {
    /// A single batch tensor, or a sequence of them for recurrent models
    type Input: ?Sized;

    /// Handles to the trainable parameters, in a fixed order
    fn parameters(&self) -> Vec<Parameter>;
    fn run(&self, inputs: &Self::Input) -> Result<Tensor, NNError>;
}

/// A module with a differentiable objective
pub trait Trainable: Module {
    fn get_loss(&self, inputs: &Self::Input, labels: &Tensor) -> Result<Tensor, NNError>;
}

/// Hyperparameters and stopping rule of a training loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    /// Multiplier applied to each gradient, negative to descend
    pub learning_rate: f32,
    pub batch_size: usize,
    /// Convergence threshold, its meaning (loss, accuracy, mistakes) depends on the model
    pub target: f32,
    /// Upper bound on epochs (or steps for models trained on an endless stream)
    pub max_iterations: usize,
}

impl TrainConfig {
    pub fn with_learning_rate(self, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..self
        }
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn with_target(self, target: f32) -> Self {
        Self { target, ..self }
    }

    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
}

/// Outcome of a converged training run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    /// Epochs or steps taken, including the one that converged
    pub iterations: usize,
    /// Value of the convergence metric when training stopped
    pub metric: f32,
}

/// Takes one optimizer step per batch over a single pass of `loader`
pub fn train_epoch<M, O>(
    model: &M,
    optim: &mut O,
    loader: &DataLoader,
    batch_size: usize,
) -> Result<(), TrainError>
where
    M: Trainable<Input = Tensor>,
    O: Optim,
{
    for (x, y) in loader.iterate_once(batch_size)? {
        let loss = model.get_loss(&x, &y)?;
        optim.step(&loss)?;
    }
    Ok(())
}

/// Index of the largest entry, the first one on ties
pub fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max { (i, v) } else { (best, max) }
        })
        .0
}

/// Predicted class of every row of a batch of scores
pub fn predicted_classes(scores: &Array2<f32>) -> Vec<usize> {
    scores.rows().into_iter().map(argmax).collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(array![0.1, 3.0, -2.0].view()), 1);
        // ties resolve to the first index
        assert_eq!(argmax(array![1.0, 1.0].view()), 0);
    }

    #[test]
    fn test_predicted_classes() {
        let scores = array![[0.0, 1.0, 0.5], [2.0, -1.0, 0.0]];
        assert_eq!(predicted_classes(&scores), vec![1, 0]);
    }

    #[test]
    fn test_config_builders() {
        let config = TrainConfig {
            learning_rate: -0.1,
            batch_size: 10,
            target: 0.5,
            max_iterations: 3,
        }
        .with_max_iterations(7)
        .with_batch_size(2);
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.learning_rate, -0.1);
    }
}
