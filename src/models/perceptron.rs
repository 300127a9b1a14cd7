use ndarray::Array2;
use rand::Rng;

use crate::{
    dataloader::DataLoader,
    nn::{Module, NNError, TrainConfig, TrainError, TrainReport},
    tensor::{Parameter, Tensor, as_scalar},
};

/// Binary linear classifier predicting `+1` or `-1`
pub struct PerceptronModel {
    w: Parameter,
}

impl PerceptronModel {
    /// `learning_rate` scales the `label * x` correction; `batch_size` is the number of points
    /// predicted before the weights are corrected; `target` is the number of mistakes tolerated
    /// in a sweep; `max_iterations` counts sweeps
    pub const DEFAULT_CONFIG: TrainConfig = TrainConfig {
        learning_rate: 1.0,
        batch_size: 1,
        target: 0.0,
        max_iterations: 1_000,
    };

    /// A perceptron for points of `dimensions` coordinates
    pub fn new(dimensions: usize) -> Result<Self, NNError> {
        Self::with_rng(dimensions, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(dimensions: usize, rng: &mut R) -> Result<Self, NNError> {
        Ok(Self {
            w: Parameter::new(1, dimensions, rng)?,
        })
    }

    pub fn get_weights(&self) -> &Parameter {
        &self.w
    }

    /// `1` when the score of a single point `x (1 x dimensions)` is non-negative, `-1` otherwise
    pub fn get_prediction(&self, x: &Tensor) -> Result<i32, NNError> {
        Ok(sign(as_scalar(&self.run(x)?)?))
    }

    pub fn train(&mut self, dataset: &DataLoader) -> Result<TrainReport, TrainError> {
        self.train_with(dataset, &Self::DEFAULT_CONFIG)
    }

    /// Sweeps the dataset in batches, adding `label * x` for every misclassified point of a
    /// batch, until a sweep makes no more than `config.target` mistakes
    ///
    /// A batch size of 1 is the classic rule of correcting after every point.
    pub fn train_with(
        &mut self,
        dataset: &DataLoader,
        config: &TrainConfig,
    ) -> Result<TrainReport, TrainError> {
        let mut mistakes = 0;
        for sweep in 1..=config.max_iterations {
            mistakes = 0;
            for (x, y) in dataset.iterate_once(config.batch_size)? {
                let scores = self.run(&x)?.data();
                let (points, labels) = (x.data(), y.data());
                let mut correction = Array2::zeros(self.w.shape());
                let mut batch_mistakes = 0;
                for ((&score, &label), point) in
                    scores.iter().zip(labels.iter()).zip(points.rows())
                {
                    if sign(score) as f32 != label {
                        correction.row_mut(0).scaled_add(label, &point);
                        batch_mistakes += 1;
                    }
                }
                if batch_mistakes > 0 {
                    self.w.update(&correction, config.learning_rate)?;
                    mistakes += batch_mistakes;
                }
            }
            log::debug!("sweep: {}, mistakes: {}", sweep, mistakes);
            if mistakes as f32 <= config.target {
                log::info!("Perceptron converged after {} sweeps", sweep);
                return Ok(TrainReport {
                    iterations: sweep,
                    metric: mistakes as f32,
                });
            }
        }
        log::warn!(
            "Perceptron still made {} mistakes after {} sweeps",
            mistakes,
            config.max_iterations
        );
        Err(TrainError::DidNotConverge {
            iterations: config.max_iterations,
            metric: mistakes as f32,
        })
    }
}

// a zero score counts as positive
fn sign(score: f32) -> i32 {
    if score >= 0.0 { 1 } else { -1 }
}

impl Module for PerceptronModel {
    type Input = Tensor;

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.w.clone()]
    }

    fn run(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        Ok(inputs.dot_product(self.w.as_tensor())?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{dataloader::DataLoaderError, datasets::gen_perceptron_data};

    #[test]
    fn test_prediction_sign() {
        let mut model = PerceptronModel::new(2).unwrap();
        model.w = Parameter::from_data(array![[1.0, -1.0]]).unwrap();
        let x = Tensor::constant(array![[2.0, 1.0]]);
        assert_eq!(model.get_prediction(&x).unwrap(), 1);
        let x = Tensor::constant(array![[1.0, 2.0]]);
        assert_eq!(model.get_prediction(&x).unwrap(), -1);
        // a zero score counts as positive
        let x = Tensor::constant(array![[1.0, 1.0]]);
        assert_eq!(model.get_prediction(&x).unwrap(), 1);
    }

    #[test]
    fn test_run_keeps_batch_dimension_and_is_repeatable() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = PerceptronModel::with_rng(3, &mut rng).unwrap();
        let x = Tensor::constant(array![[1.0, 2.0, 1.0], [0.0, -1.0, 1.0], [3.0, 3.0, 1.0]]);
        let first = model.run(&x).unwrap();
        assert_eq!(first.shape(), (3, 1));
        assert_eq!(first.data(), model.run(&x).unwrap().data());
    }

    #[test]
    fn test_train_separates_data() {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let (data, labels) = gen_perceptron_data(100, &mut rng);
        let dataset = DataLoader::new(data, labels, false).unwrap();
        let mut model = PerceptronModel::with_rng(3, &mut rng).unwrap();

        let report = model.train(&dataset).unwrap();
        assert_eq!(report.metric, 0.0);
        for (x, y) in dataset.iterate_once(1).unwrap() {
            assert_eq!(model.get_prediction(&x).unwrap() as f32, as_scalar(&y).unwrap());
        }
    }

    #[test]
    fn test_train_gives_up_on_inseparable_data() {
        // the same point carries both labels
        let data = array![[1.0, 1.0], [1.0, 1.0]];
        let labels = array![[1.0], [-1.0]];
        let dataset = DataLoader::new(data, labels, false).unwrap();
        let mut model = PerceptronModel::new(2).unwrap();

        let config = PerceptronModel::DEFAULT_CONFIG.with_max_iterations(5);
        let err = model.train_with(&dataset, &config).unwrap_err();
        assert!(matches!(
            err,
            TrainError::DidNotConverge { iterations: 5, metric } if metric >= 1.0
        ));
    }

    #[test]
    fn test_train_in_batches() {
        let data = array![[2.0, 1.0], [-2.0, 1.0], [3.0, 1.0], [-1.0, 1.0]];
        let labels = array![[1.0], [-1.0], [1.0], [-1.0]];
        let dataset = DataLoader::new(data, labels, false).unwrap();
        let mut model = PerceptronModel::with_rng(2, &mut Pcg64Mcg::seed_from_u64(3)).unwrap();

        let config = PerceptronModel::DEFAULT_CONFIG.with_batch_size(2);
        let report = model.train_with(&dataset, &config).unwrap();
        assert_eq!(report.metric, 0.0);
        for (x, y) in dataset.iterate_once(1).unwrap() {
            assert_eq!(model.get_prediction(&x).unwrap() as f32, as_scalar(&y).unwrap());
        }

        let config = PerceptronModel::DEFAULT_CONFIG.with_batch_size(3);
        assert!(matches!(
            model.train_with(&dataset, &config),
            Err(TrainError::Data(DataLoaderError::InvalidBatchSize { batch_size: 3, len: 4 }))
        ));
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let model = PerceptronModel::new(3).unwrap();
        let x = Tensor::constant(array![[1.0, 2.0]]);
        assert!(matches!(model.run(&x), Err(NNError::Tensor(_))));
        assert_eq!(model.get_weights().shape(), (1, 3));
    }
}
