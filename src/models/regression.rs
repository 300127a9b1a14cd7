use rand::Rng;

use crate::{
    dataloader::DataLoader,
    loss::SquareLoss,
    nn::{Module, NNError, Trainable, TrainConfig, TrainError, TrainReport, train_epoch},
    optim::SGD,
    tensor::{Parameter, Tensor, as_scalar},
};

const HIDDEN_LAYER_SIZE: usize = 30;

/// Approximates a real function of one real variable, `1 -> 30 -> 1` with a ReLU hidden layer
pub struct RegressionModel {
    weights1: Parameter,
    bias1: Parameter,
    weights_out: Parameter,
    bias_out: Parameter,
}

impl RegressionModel {
    /// `target` is the highest acceptable loss over the whole dataset; `max_iterations` counts epochs
    pub const DEFAULT_CONFIG: TrainConfig = TrainConfig {
        learning_rate: -0.004,
        batch_size: 1,
        target: 0.02,
        max_iterations: 10_000,
    };

    pub fn new() -> Result<Self, NNError> {
        Self::with_rng(&mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(rng: &mut R) -> Result<Self, NNError> {
        Ok(Self {
            weights1: Parameter::new(1, HIDDEN_LAYER_SIZE, rng)?,
            bias1: Parameter::new(1, HIDDEN_LAYER_SIZE, rng)?,
            weights_out: Parameter::new(HIDDEN_LAYER_SIZE, 1, rng)?,
            bias_out: Parameter::new(1, 1, rng)?,
        })
    }

    pub fn train(&mut self, dataset: &DataLoader) -> Result<TrainReport, TrainError> {
        self.train_with(dataset, &Self::DEFAULT_CONFIG)
    }

    /// One gradient step per batch each epoch, then stops once the loss over the full
    /// dataset drops to `config.target`
    pub fn train_with(
        &mut self,
        dataset: &DataLoader,
        config: &TrainConfig,
    ) -> Result<TrainReport, TrainError> {
        let mut optim = SGD::new(self.parameters(), config.learning_rate);
        let mut loss = f32::INFINITY;
        for epoch in 1..=config.max_iterations {
            train_epoch(&*self, &mut optim, dataset, config.batch_size)?;

            let (x, y) = dataset.full_batch();
            loss = as_scalar(&self.get_loss(&x, &y)?)?;
            log::debug!("epoch: {}, loss: {}", epoch, loss);
            if loss <= config.target {
                log::info!("Regression converged after {} epochs, loss: {}", epoch, loss);
                return Ok(TrainReport {
                    iterations: epoch,
                    metric: loss,
                });
            }
        }
        log::warn!(
            "Regression loss still {} after {} epochs",
            loss,
            config.max_iterations
        );
        Err(TrainError::DidNotConverge {
            iterations: config.max_iterations,
            metric: loss,
        })
    }
}

impl Module for RegressionModel {
    type Input = Tensor;

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            self.weights1.clone(),
            self.bias1.clone(),
            self.weights_out.clone(),
            self.bias_out.clone(),
        ]
    }

    /// Maps `x (batch x 1)` to predictions `(batch x 1)`
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

impl Trainable for RegressionModel {
    fn get_loss(&self, inputs: &Tensor, labels: &Tensor) -> Result<Tensor, NNError> {
        Ok(SquareLoss::call(&self.run(inputs)?, labels)?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Axis, array};
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn model(seed: u64) -> RegressionModel {
        RegressionModel::with_rng(&mut Pcg64Mcg::seed_from_u64(seed)).unwrap()
    }

    #[test]
    fn test_run_shape_and_repeatability() {
        let model = model(0);
        let x = Tensor::constant(array![[0.5], [-1.0], [2.0], [0.0]]);
        let first = model.run(&x).unwrap();
        assert_eq!(first.shape(), (4, 1));
        assert_eq!(first.data(), model.run(&x).unwrap().data());
        assert_eq!(model.parameters().len(), 4);
    }

    #[test]
    fn test_train_reaches_target_loss() {
        // a gentle slope is learnt within a handful of epochs
        let x = Array1::linspace(-1.0f32, 1.0, 20).insert_axis(Axis(1));
        let y = x.mapv(|v| 0.5 * v + 0.2);
        let dataset = DataLoader::new(x, y, false).unwrap();
        let mut model = model(3);

        let config = RegressionModel::DEFAULT_CONFIG.with_max_iterations(2_000);
        let report = model.train_with(&dataset, &config).unwrap();
        assert!(report.metric <= config.target);

        let (x, y) = dataset.full_batch();
        let loss = as_scalar(&model.get_loss(&x, &y).unwrap()).unwrap();
        assert!(loss <= config.target);
    }

    #[test]
    fn test_train_reports_non_convergence() {
        let dataset = DataLoader::new(array![[0.0], [1.0]], array![[0.0], [1.0]], false).unwrap();
        let mut model = model(5);
        // a squared loss is never negative
        let config = RegressionModel::DEFAULT_CONFIG
            .with_target(-1.0)
            .with_max_iterations(3);
        assert!(matches!(
            model.train_with(&dataset, &config),
            Err(TrainError::DidNotConverge { iterations: 3, .. })
        ));
    }

    #[test]
    fn test_bad_batch_size_is_reported() {
        let dataset = DataLoader::new(array![[0.0], [1.0], [2.0]], array![[0.0], [1.0], [2.0]], false)
            .unwrap();
        let mut model = model(5);
        let config = RegressionModel::DEFAULT_CONFIG.with_batch_size(2);
        assert!(matches!(
            model.train_with(&dataset, &config),
            Err(TrainError::Data(_))
        ));
    }
}
