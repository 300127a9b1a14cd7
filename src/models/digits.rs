use rand::Rng;

use crate::{
    dataloader::ClassificationDataset,
    loss::SoftmaxLoss,
    nn::{Module, NNError, Trainable, TrainConfig, TrainError, TrainReport, train_epoch},
    optim::SGD,
    tensor::{Parameter, Tensor},
};

/// Flattened 28x28 grayscale image
const INPUT_DIM: usize = 784;
const HIDDEN_LAYER_SIZE: usize = 125;
const N_DIGITS: usize = 10;

/// Handwritten digit classifier, `784 -> 125 -> 10` with a ReLU hidden layer
pub struct DigitClassificationModel {
    weights1: Parameter,
    bias1: Parameter,
    weights_out: Parameter,
    bias_out: Parameter,
}

impl DigitClassificationModel {
    /// `target` is the validation accuracy to reach; `max_iterations` counts epochs
    pub const DEFAULT_CONFIG: TrainConfig = TrainConfig {
        learning_rate: -0.008,
        batch_size: 1,
        target: 0.97,
        max_iterations: 100,
    };

    pub fn new() -> Result<Self, NNError> {
        Self::with_rng(&mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(rng: &mut R) -> Result<Self, NNError> {
        Ok(Self {
            weights1: Parameter::new(INPUT_DIM, HIDDEN_LAYER_SIZE, rng)?,
            bias1: Parameter::new(1, HIDDEN_LAYER_SIZE, rng)?,
            weights_out: Parameter::new(HIDDEN_LAYER_SIZE, N_DIGITS, rng)?,
            bias_out: Parameter::new(1, N_DIGITS, rng)?,
        })
    }

    pub fn train(&mut self, dataset: &ClassificationDataset) -> Result<TrainReport, TrainError> {
        self.train_with(dataset, &Self::DEFAULT_CONFIG)
    }

    /// One gradient step per batch each epoch, then stops once validation accuracy reaches
    /// `config.target`
    pub fn train_with(
        &mut self,
        dataset: &ClassificationDataset,
        config: &TrainConfig,
    ) -> Result<TrainReport, TrainError> {
        let mut optim = SGD::new(self.parameters(), config.learning_rate);
        let mut accuracy = 0.0;
        for epoch in 1..=config.max_iterations {
            train_epoch(&*self, &mut optim, dataset.train(), config.batch_size)?;

            accuracy = dataset.validation_accuracy(&*self)?;
            log::debug!("epoch: {}, validation accuracy: {}", epoch, accuracy);
            if accuracy >= config.target {
                log::info!(
                    "Digit classifier converged after {} epochs, validation accuracy: {}",
                    epoch,
                    accuracy
                );
                return Ok(TrainReport {
                    iterations: epoch,
                    metric: accuracy,
                });
            }
        }
        log::warn!(
            "Digit classifier validation accuracy still {} after {} epochs",
            accuracy,
            config.max_iterations
        );
        Err(TrainError::DidNotConverge {
            iterations: config.max_iterations,
            metric: accuracy,
        })
    }
}

impl Module for DigitClassificationModel {
    type Input = Tensor;

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            self.weights1.clone(),
            self.bias1.clone(),
            self.weights_out.clone(),
            self.bias_out.clone(),
        ]
    }

    /// Maps images `(batch x 784)` to logits `(batch x 10)`
    fn run(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        let hidden = inputs
            .linear(self.weights1.as_tensor())?
            .add_bias(self.bias1.as_tensor())?
            .relu();
        Ok(hidden
            .linear(self.weights_out.as_tensor())?
            .add_bias(self.bias_out.as_tensor())?)
    }
}

impl Trainable for DigitClassificationModel {
    fn get_loss(&self, inputs: &Tensor, labels: &Tensor) -> Result<Tensor, NNError> {
        Ok(SoftmaxLoss::call(&self.run(inputs)?, labels)?)
    }
}
