//! Data loaders: batching, endless iteration and validation accuracy

use std::{cell::RefCell, collections::BTreeMap};

use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    nn::{Module, NNError, predicted_classes},
    tensor::Tensor,
};

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq)]
pub enum DataLoaderError {
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Dataset must contain at least one example")]
    EmptyDataset,
    #[error("Batch size {batch_size} must be positive and divide the dataset size {len}")]
    InvalidBatchSize { batch_size: usize, len: usize },
    #[error("Label {label} is out of range for {n_classes} classes")]
    InvalidLabel { label: usize, n_classes: usize },
    #[error("Character {index} is out of range for an alphabet of {num_chars}")]
    InvalidCharacter { index: usize, num_chars: usize },
    #[error("Words must contain at least one character")]
    EmptyWord,
}

/// A batch of a sequence dataset: one `(batch x num_chars)` tensor per character, and the labels
pub type SequenceBatch = (Vec<Tensor>, Tensor);

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    x: Array2<f32>,
    y: Array2<f32>,
    shuffle: bool,
    rng: RefCell<Pcg64Mcg>,
}

impl DataLoader {
    pub fn new(x: Array2<f32>, y: Array2<f32>, shuffle: bool) -> Result<Self, DataLoaderError> {
        if x.nrows() != y.nrows() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: y.nrows(),
                data_len: x.nrows(),
            });
        }
        if x.nrows() == 0 {
            return Err(DataLoaderError::EmptyDataset);
        }
        Ok(Self {
            x,
            y,
            shuffle,
            rng: RefCell::new(Pcg64Mcg::from_rng(&mut rand::rng())),
        })
    }

    /// Makes shuffling reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.x.nrows() == 0
    }

    pub fn labels(&self) -> &Array2<f32> {
        &self.y
    }

    /// One pass over the dataset. `batch_size` must divide the number of examples.
    pub fn iterate_once(&self, batch_size: usize) -> Result<DataLoaderIterator<'_>, DataLoaderError> {
        self.check_batch_size(batch_size)?;
        Ok(self.batches(batch_size))
    }

    /// Endless passes over the dataset, reshuffled on every pass when shuffling is enabled
    pub fn iterate_forever(&self, batch_size: usize) -> Result<ForeverIterator<'_>, DataLoaderError> {
        self.check_batch_size(batch_size)?;
        Ok(ForeverIterator {
            loader: self,
            batch_size,
            current: self.batches(batch_size),
        })
    }

    /// The whole dataset as a single batch
    pub fn full_batch(&self) -> (Tensor, Tensor) {
        (Tensor::constant(self.x.clone()), Tensor::constant(self.y.clone()))
    }

    fn check_batch_size(&self, batch_size: usize) -> Result<(), DataLoaderError> {
        if batch_size == 0 || self.len() % batch_size != 0 {
            return Err(DataLoaderError::InvalidBatchSize {
                batch_size,
                len: self.len(),
            });
        }
        Ok(())
    }

    fn batches(&self, batch_size: usize) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(&mut *self.rng.borrow_mut());
        }
        DataLoaderIterator {
            loader: self,
            batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let batch = &self.indices[self.curr_iter..self.curr_iter + self.batch_size];
        self.curr_iter += self.batch_size;
        Some((
            Tensor::constant(self.loader.x.select(Axis(0), batch)),
            Tensor::constant(self.loader.y.select(Axis(0), batch)),
        ))
    }
}

/// Cycles through the dataset without end
pub struct ForeverIterator<'a> {
    loader: &'a DataLoader,
    batch_size: usize,
    current: DataLoaderIterator<'a>,
}

impl Iterator for ForeverIterator<'_> {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(batch) = self.current.next() {
            return Some(batch);
        }
        self.current = self.loader.batches(self.batch_size);
        self.current.next()
    }
}

/// One-hot encodes class indices into a `(len x n_classes)` matrix
pub fn one_hot(labels: &[usize], n_classes: usize) -> Result<Array2<f32>, DataLoaderError> {
    let mut out = Array2::zeros((labels.len(), n_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= n_classes {
            return Err(DataLoaderError::InvalidLabel { label, n_classes });
        }
        out[[i, label]] = 1.0;
    }
    Ok(out)
}

/// Training loader plus a held-out set scored by classification accuracy
pub struct ClassificationDataset {
    train: DataLoader,
    validation_x: Array2<f32>,
    validation_labels: Vec<usize>,
}

impl ClassificationDataset {
    pub fn new(
        train: DataLoader,
        validation_x: Array2<f32>,
        validation_labels: Vec<usize>,
    ) -> Result<Self, DataLoaderError> {
        if validation_x.nrows() != validation_labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: validation_labels.len(),
                data_len: validation_x.nrows(),
            });
        }
        if validation_labels.is_empty() {
            return Err(DataLoaderError::EmptyDataset);
        }
        let n_classes = train.labels().ncols();
        if let Some(&label) = validation_labels.iter().find(|&&l| l >= n_classes) {
            return Err(DataLoaderError::InvalidLabel { label, n_classes });
        }
        Ok(Self {
            train,
            validation_x,
            validation_labels,
        })
    }

    /// Makes shuffling of the training set reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            train: self.train.with_seed(seed),
            ..self
        }
    }

    pub fn train(&self) -> &DataLoader {
        &self.train
    }

    /// Fraction of validation examples whose highest score matches the label
    pub fn validation_accuracy<M>(&self, model: &M) -> Result<f32, NNError>
    where
        M: Module<Input = Tensor>,
    {
        let scores = model.run(&Tensor::constant(self.validation_x.clone()))?;
        let predictions = predicted_classes(&scores.data());
        Ok(accuracy(&predictions, &self.validation_labels))
    }
}

/// Words encoded as character indices, batched so that every batch holds words of one length
pub struct SequenceDataset {
    num_chars: usize,
    n_classes: usize,
    train: Vec<(Vec<usize>, usize)>,
    // word length -> indices into `train`
    train_buckets: BTreeMap<usize, Vec<usize>>,
    validation: Vec<(Vec<usize>, usize)>,
    rng: RefCell<Pcg64Mcg>,
}

impl SequenceDataset {
    pub fn new(
        num_chars: usize,
        n_classes: usize,
        train: Vec<(Vec<usize>, usize)>,
        validation: Vec<(Vec<usize>, usize)>,
    ) -> Result<Self, DataLoaderError> {
        if train.is_empty() || validation.is_empty() {
            return Err(DataLoaderError::EmptyDataset);
        }
        for (word, label) in train.iter().chain(validation.iter()) {
            if word.is_empty() {
                return Err(DataLoaderError::EmptyWord);
            }
            if let Some(&index) = word.iter().find(|&&c| c >= num_chars) {
                return Err(DataLoaderError::InvalidCharacter { index, num_chars });
            }
            if *label >= n_classes {
                return Err(DataLoaderError::InvalidLabel {
                    label: *label,
                    n_classes,
                });
            }
        }
        Ok(Self {
            num_chars,
            n_classes,
            train_buckets: bucket_by_length(&train),
            train,
            validation,
            rng: RefCell::new(Pcg64Mcg::from_rng(&mut rand::rng())),
        })
    }

    /// Makes batch sampling reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn num_chars(&self) -> usize {
        self.num_chars
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn len(&self) -> usize {
        self.train.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty()
    }

    /// One pass over the training words in shuffled batches of at most `batch_size` equal-length words
    pub fn iterate_once(
        &self,
        batch_size: usize,
    ) -> Result<impl Iterator<Item = SequenceBatch> + '_, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::InvalidBatchSize {
                batch_size,
                len: self.len(),
            });
        }
        let mut rng = self.rng.borrow_mut();
        let mut batches = vec![];
        for bucket in self.train_buckets.values() {
            let mut bucket = bucket.clone();
            bucket.shuffle(&mut *rng);
            batches.extend(bucket.chunks(batch_size).map(<[usize]>::to_vec));
        }
        batches.shuffle(&mut *rng);
        Ok(batches
            .into_iter()
            .map(move |indices| self.encode(&self.train, &indices)))
    }

    /// Endless random batches; a length is drawn proportionally to how many words have it
    pub fn iterate_forever(
        &self,
        batch_size: usize,
    ) -> Result<impl Iterator<Item = SequenceBatch> + '_, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::InvalidBatchSize {
                batch_size,
                len: self.len(),
            });
        }
        Ok(std::iter::repeat_with(move || self.random_batch(batch_size)))
    }

    /// Fraction of validation words classified correctly, scored one length bucket at a time
    pub fn validation_accuracy<M>(&self, model: &M) -> Result<f32, NNError>
    where
        M: Module<Input = [Tensor]>,
    {
        let mut predictions = Vec::with_capacity(self.validation.len());
        let mut labels = Vec::with_capacity(self.validation.len());
        for indices in bucket_by_length(&self.validation).values() {
            let (xs, _) = self.encode(&self.validation, indices);
            let scores = model.run(&xs[..])?;
            predictions.extend(predicted_classes(&scores.data()));
            labels.extend(indices.iter().map(|&i| self.validation[i].1));
        }
        Ok(accuracy(&predictions, &labels))
    }

    fn random_batch(&self, batch_size: usize) -> SequenceBatch {
        let mut rng = self.rng.borrow_mut();
        let mut pick = rng.random_range(0..self.train.len());
        let mut chosen = vec![];
        for bucket in self.train_buckets.values() {
            if pick < bucket.len() {
                chosen = bucket.clone();
                break;
            }
            pick -= bucket.len();
        }
        chosen.shuffle(&mut *rng);
        chosen.truncate(batch_size);
        drop(rng);
        self.encode(&self.train, &chosen)
    }

    /// One-hot encodes the words at `indices`, which must all have the same length
    fn encode(&self, words: &[(Vec<usize>, usize)], indices: &[usize]) -> SequenceBatch {
        let length = indices.first().map_or(0, |&i| words[i].0.len());
        let xs = (0..length)
            .map(|t| {
                let mut step = Array2::zeros((indices.len(), self.num_chars));
                for (row, &i) in indices.iter().enumerate() {
                    step[[row, words[i].0[t]]] = 1.0;
                }
                Tensor::constant(step)
            })
            .collect();
        let mut labels = Array2::zeros((indices.len(), self.n_classes));
        for (row, &i) in indices.iter().enumerate() {
            labels[[row, words[i].1]] = 1.0;
        }
        (xs, Tensor::constant(labels))
    }
}

fn bucket_by_length(words: &[(Vec<usize>, usize)]) -> BTreeMap<usize, Vec<usize>> {
    let mut buckets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, (word, _)) in words.iter().enumerate() {
        buckets.entry(word.len()).or_default().push(i);
    }
    buckets
}

fn accuracy(predictions: &[usize], labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels.iter())
        .filter(|(p, l)| p == l)
        .count();
    correct as f32 / labels.len() as f32
}
