use rand::Rng;

use crate::{
    dataloader::SequenceDataset,
    loss::SoftmaxLoss,
    nn::{Module, NNError, Trainable, TrainConfig, TrainError, TrainReport},
    optim::{Optim, SGD},
    tensor::{Parameter, Tensor},
};

/// Languages in label order
pub const LANGUAGES: [&str; 5] = ["English", "Spanish", "Finnish", "Dutch", "Polish"];
const DEFAULT_HIDDEN_SIZE: usize = 200;

/// Recurrent network identifying the language of a single word
///
/// The same input, recurrent and bias weights are applied at every character, so the parameter
/// count does not depend on word length.
pub struct LanguageIdModel {
    w_input: Parameter,
    w_hidden: Parameter,
    bias_hidden: Parameter,
    w_out: Parameter,
    bias_out: Parameter,
}

impl LanguageIdModel {
    /// `target` is the validation accuracy to reach; `max_iterations` counts batches
    pub const DEFAULT_CONFIG: TrainConfig = TrainConfig {
        learning_rate: -0.1,
        batch_size: 100,
        target: 0.89,
        max_iterations: 50_000,
    };

    pub fn new(num_chars: usize) -> Result<Self, NNError> {
        Self::with_hidden_size(num_chars, DEFAULT_HIDDEN_SIZE, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(num_chars: usize, rng: &mut R) -> Result<Self, NNError> {
        Self::with_hidden_size(num_chars, DEFAULT_HIDDEN_SIZE, rng)
    }

    pub fn with_hidden_size<R: Rng + ?Sized>(
        num_chars: usize,
        hidden_size: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        Ok(Self {
            w_input: Parameter::new(num_chars, hidden_size, rng)?,
            w_hidden: Parameter::new(hidden_size, hidden_size, rng)?,
            bias_hidden: Parameter::new(1, hidden_size, rng)?,
            w_out: Parameter::new(hidden_size, LANGUAGES.len(), rng)?,
            bias_out: Parameter::new(1, LANGUAGES.len(), rng)?,
        })
    }

    pub fn train(&mut self, dataset: &SequenceDataset) -> Result<TrainReport, TrainError> {
        self.train_with(dataset, &Self::DEFAULT_CONFIG)
    }

    /// One gradient step per random batch, checking validation accuracy after every step and
    /// stopping as soon as it reaches `config.target`
    pub fn train_with(
        &mut self,
        dataset: &SequenceDataset,
        config: &TrainConfig,
    ) -> Result<TrainReport, TrainError> {
        let mut optim = SGD::new(self.parameters(), config.learning_rate);
        let mut accuracy = 0.0;
        let batches = dataset
            .iterate_forever(config.batch_size)?
            .take(config.max_iterations);
        for (step, (xs, y)) in (1..).zip(batches) {
            let loss = self.get_loss(&xs[..], &y)?;
            optim.step(&loss)?;

            accuracy = dataset.validation_accuracy(&*self)?;
            log::debug!("step: {}, validation accuracy: {}", step, accuracy);
            if accuracy >= config.target {
                log::info!(
                    "Language identifier converged after {} steps, validation accuracy: {}",
                    step,
                    accuracy
                );
                return Ok(TrainReport {
                    iterations: step,
                    metric: accuracy,
                });
            }
        }
        log::warn!(
            "Language identifier validation accuracy still {} after {} steps",
            accuracy,
            config.max_iterations
        );
        Err(TrainError::DidNotConverge {
            iterations: config.max_iterations,
            metric: accuracy,
        })
    }
}

impl Module for LanguageIdModel {
    type Input = [Tensor];

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            self.w_input.clone(),
            self.w_hidden.clone(),
            self.bias_hidden.clone(),
            self.w_out.clone(),
            self.bias_out.clone(),
        ]
    }

    /// Summarizes one `(batch x num_chars)` tensor per character into logits `(batch x 5)`
    fn run(&self, inputs: &[Tensor]) -> Result<Tensor, NNError> {
        let (first, rest) = inputs.split_first().ok_or(NNError::EmptySequence)?;
        // no recurrent term for the first character
        let mut hidden = first
            .linear(self.w_input.as_tensor())?
            .add_bias(self.bias_hidden.as_tensor())?
            .relu();
        for x in rest {
            hidden = x
                .linear(self.w_input.as_tensor())?
                .add(&hidden.linear(self.w_hidden.as_tensor())?)?
                .add_bias(self.bias_hidden.as_tensor())?
                .relu();
        }
        Ok(hidden
            .linear(self.w_out.as_tensor())?
            .add_bias(self.bias_out.as_tensor())?)
    }
}

impl Trainable for LanguageIdModel {
    fn get_loss(&self, inputs: &[Tensor], labels: &Tensor) -> Result<Tensor, NNError> {
        Ok(SoftmaxLoss::call(&self.run(inputs)?, labels)?)
    }
}
