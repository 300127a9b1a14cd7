//! Data sources for the models and utilities for plotting trained models
//!
//! Synthetic datasets are generated for the perceptron and regression tasks, while digit
//! classification reads MNIST IDX files and language identification reads tab separated word lists.
//! By convention the negative class is plotted in red and the positive class in blue.

use std::{
    collections::BTreeSet,
    error::Error,
    f32::consts::PI,
    fmt::{self, Display},
    fs,
    path::Path,
};

use clap::ValueEnum;
use ndarray::{Array1, Array2, Axis};
use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, Circle, IntoDrawingArea, LineSeries, Rectangle},
    style::{BLUE, Color, RED, RGBColor, WHITE},
};
use rand::Rng;
use thiserror::Error;

use crate::{
    dataloader::{ClassificationDataset, DataLoader, DataLoaderError, SequenceDataset, one_hot},
    models::{LANGUAGES, PerceptronModel, RegressionModel},
    nn::Module,
    tensor::Tensor,
};

/// Points closer than this to the separating line are not generated, which bounds perceptron sweeps
const PERCEPTRON_MARGIN: f32 = 0.25;
const MNIST_CLASSES: usize = 10;

/// Errors for loading datasets from disk
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid dataset file: {0}")]
    InvalidFormat(String),
    #[error("Unknown language '{0}'")]
    UnknownLanguage(String),
    #[error(transparent)]
    Loader(#[from] DataLoaderError),
}

/// Toggles between the models to train
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Perceptron,
    Regression,
    Digits,
    LangId,
}

impl Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Perceptron => write!(f, "perceptron"),
            Task::Regression => write!(f, "regression"),
            Task::Digits => write!(f, "digits"),
            Task::LangId => write!(f, "lang-id"),
        }
    }
}

/// Generates a linearly separable dataset of 2D points with labels `+1` and `-1`
///
/// Each row is `[x, y, 1]`, the constant column lets the perceptron learn an offset.
pub fn gen_perceptron_data<R: Rng + ?Sized>(n: usize, rng: &mut R) -> (Array2<f32>, Array2<f32>) {
    let angle: f32 = rng.random_range(0.0..2.0 * PI);
    let offset: f32 = rng.random_range(-1.0..1.0);
    let mut data = Array2::zeros((n, 3));
    let mut labels = Array2::zeros((n, 1));

    let mut i = 0;
    while i < n {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        let score = angle.cos() * x + angle.sin() * y + offset;
        if score.abs() < PERCEPTRON_MARGIN {
            continue;
        }
        data[[i, 0]] = x;
        data[[i, 1]] = y;
        data[[i, 2]] = 1.0;
        labels[[i, 0]] = if score > 0.0 { 1.0 } else { -1.0 };
        i += 1;
    }

    (data, labels)
}

/// Samples `sin(x)` at `n` evenly spaced points of `[-2pi, 2pi]`, as `(n x 1)` columns
pub fn gen_regression_data(n: usize) -> (Array2<f32>, Array2<f32>) {
    let x = Array1::linspace(-2.0 * PI, 2.0 * PI, n).insert_axis(Axis(1));
    let y = x.mapv(f32::sin);
    (x, y)
}

/// Splits an unsigned byte IDX file into its dimensions and payload
pub fn parse_idx(bytes: &[u8]) -> Result<(Vec<usize>, &[u8]), DatasetError> {
    if bytes.len() < 4 || bytes[..3] != [0, 0, 0x08] {
        return Err(DatasetError::InvalidFormat(
            "expected an unsigned byte IDX header".to_string(),
        ));
    }
    let n_dims = bytes[3] as usize;
    let header_len = 4 + 4 * n_dims;
    if bytes.len() < header_len {
        return Err(DatasetError::InvalidFormat("truncated IDX header".to_string()));
    }
    let dims = bytes[4..header_len]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]) as usize)
        .collect::<Vec<_>>();
    let payload = &bytes[header_len..];
    let expected = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            DatasetError::InvalidFormat(format!("IDX dimensions {:?} overflow", dims))
        })?;
    if payload.len() != expected {
        return Err(DatasetError::InvalidFormat(format!(
            "IDX dimensions {:?} need {} bytes, found {}",
            dims,
            expected,
            payload.len()
        )));
    }
    Ok((dims, payload))
}

/// Reads IDX images into one flattened row per image, with pixels scaled to `[0, 1]`
pub fn load_idx_images(path: &Path) -> Result<Array2<f32>, DatasetError> {
    let bytes = fs::read(path)?;
    let (dims, pixels) = parse_idx(&bytes)?;
    let [n, rows, cols] = dims[..] else {
        return Err(DatasetError::InvalidFormat(format!(
            "{}: expected 3 dimensions, found {}",
            path.display(),
            dims.len()
        )));
    };
    let data = pixels.iter().map(|&p| p as f32 / 255.0).collect();
    Array2::from_shape_vec((n, rows * cols), data)
        .map_err(|e| DatasetError::InvalidFormat(e.to_string()))
}

pub fn load_idx_labels(path: &Path) -> Result<Vec<usize>, DatasetError> {
    let bytes = fs::read(path)?;
    let (dims, labels) = parse_idx(&bytes)?;
    if dims.len() != 1 {
        return Err(DatasetError::InvalidFormat(format!(
            "{}: expected 1 dimension, found {}",
            path.display(),
            dims.len()
        )));
    }
    Ok(labels.iter().map(|&l| l as usize).collect())
}

/// Loads MNIST from the four standard IDX files in `dir`; the test split is used for validation
pub fn load_mnist(dir: &Path, shuffle: bool) -> Result<ClassificationDataset, DatasetError> {
    let train_x = load_idx_images(&dir.join("train-images-idx3-ubyte"))?;
    let train_labels = load_idx_labels(&dir.join("train-labels-idx1-ubyte"))?;
    let validation_x = load_idx_images(&dir.join("t10k-images-idx3-ubyte"))?;
    let validation_labels = load_idx_labels(&dir.join("t10k-labels-idx1-ubyte"))?;
    log::info!(
        "Loaded {} training and {} validation digits from '{}'",
        train_x.nrows(),
        validation_x.nrows(),
        dir.display()
    );

    let train_y = one_hot(&train_labels, MNIST_CLASSES)?;
    let train = DataLoader::new(train_x, train_y, shuffle)?;
    Ok(ClassificationDataset::new(train, validation_x, validation_labels)?)
}

/// Index of a language name in [`LANGUAGES`], ignoring case
pub fn language_index(name: &str) -> Option<usize> {
    LANGUAGES.iter().position(|l| l.eq_ignore_ascii_case(name))
}

/// Parses lines of `<language>\t<word>`; blank lines and lines starting with `#` are skipped
pub fn parse_word_list(contents: &str) -> Result<Vec<(String, usize)>, DatasetError> {
    let mut words = vec![];
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((language, word)) = line.split_once('\t') else {
            return Err(DatasetError::InvalidFormat(format!(
                "line {}: expected '<language>\\t<word>'",
                line_no + 1
            )));
        };
        let language = language.trim();
        let label = language_index(language)
            .ok_or_else(|| DatasetError::UnknownLanguage(language.to_string()))?;
        let word = word.trim().to_lowercase();
        if word.is_empty() {
            return Err(DatasetError::InvalidFormat(format!(
                "line {}: empty word",
                line_no + 1
            )));
        }
        words.push((word, label));
    }
    Ok(words)
}

/// Builds a language identification dataset from two word lists
///
/// Returns the dataset and its alphabet: the sorted characters of both files, a character's
/// position being its one-hot index.
pub fn load_language_words(
    train: &Path,
    validation: &Path,
) -> Result<(SequenceDataset, Vec<char>), DatasetError> {
    let train = parse_word_list(&fs::read_to_string(train)?)?;
    let validation = parse_word_list(&fs::read_to_string(validation)?)?;
    let alphabet = train
        .iter()
        .chain(validation.iter())
        .flat_map(|(word, _)| word.chars())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    log::info!(
        "Loaded {} training and {} validation words over {} characters",
        train.len(),
        validation.len(),
        alphabet.len()
    );

    let encode = |words: Vec<(String, usize)>| {
        words
            .into_iter()
            .map(|(word, label)| {
                let chars = word
                    .chars()
                    .map(|c| {
                        alphabet.binary_search(&c).map_err(|_| {
                            DatasetError::InvalidFormat(format!("character '{c}' not in alphabet"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, DatasetError>((chars, label))
            })
            .collect::<Result<Vec<_>, DatasetError>>()
    };
    let dataset = SequenceDataset::new(
        alphabet.len(),
        LANGUAGES.len(),
        encode(train)?,
        encode(validation)?,
    )?;
    Ok((dataset, alphabet))
}

/// Plots the perceptron's decision regions along with the data points
pub fn plot_perceptron(
    model: &PerceptronModel,
    data: &Array2<f32>,
    labels: &Array2<f32>,
    file_name: &str,
) -> Result<(), Box<dyn Error>> {
    let grid_min = -6.0f32;
    let grid_max = 6.0f32;
    let step = 0.20;
    let n_steps = ((grid_max - grid_min) / step).round() as i32;

    // evaluate the model first so failures surface before anything is drawn
    let mut cells = vec![];
    for xi in 0..n_steps {
        let x = grid_min + xi as f32 * step;
        for yi in 0..n_steps {
            let y = grid_min + yi as f32 * step;
            let input = Tensor::from_shape_vec(1, 3, vec![x, y, 1.0])?;
            cells.push((x, y, model.get_prediction(&input)?));
        }
    }

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Perceptron decision boundary", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(grid_min..grid_max, grid_min..grid_max)?;

    chart.configure_mesh().draw()?;

    let red_bg = RGBColor(255, 200, 200);
    let blue_bg = RGBColor(200, 200, 255);
    chart.draw_series(cells.into_iter().map(|(x, y, prediction)| {
        let color = if prediction > 0 { blue_bg } else { red_bg };
        Rectangle::new(
            [
                (x - step / 2.0, y - step / 2.0),
                (x + step / 2.0, y + step / 2.0),
            ],
            color.filled(),
        )
    }))?;

    chart.draw_series(data.rows().into_iter().zip(labels.iter()).map(|(point, &label)| {
        let color = if label > 0.0 { BLUE } else { RED };
        Circle::new((point[0], point[1]), 3, color.filled())
    }))?;

    root_area.present()?;
    log::info!("Decision boundary plot saved to '{}'.", file_name);
    Ok(())
}

/// Plots the regression target (blue) against the model's predictions (red)
pub fn plot_regression(
    model: &RegressionModel,
    x: &Array2<f32>,
    y: &Array2<f32>,
    file_name: &str,
) -> Result<(), Box<dyn Error>> {
    let predictions = model.run(&Tensor::constant(x.clone()))?.data();

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Regression fit", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(-2.0 * PI..2.0 * PI, -1.5f32..1.5f32)?;

    chart.configure_mesh().draw()?;

    chart.draw_series(LineSeries::new(
        x.iter().copied().zip(y.iter().copied()),
        &BLUE,
    ))?;
    chart.draw_series(LineSeries::new(
        x.iter().copied().zip(predictions.iter().copied()),
        &RED,
    ))?;

    root_area.present()?;
    log::info!("Regression plot saved to '{}'.", file_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_perceptron_data_is_labelled_and_biased() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let (data, labels) = gen_perceptron_data(50, &mut rng);
        assert_eq!(data.dim(), (50, 3));
        assert_eq!(labels.dim(), (50, 1));
        assert!(data.column(2).iter().all(|&v| v == 1.0));
        assert!(labels.iter().all(|&l| l == 1.0 || l == -1.0));
    }

    #[test]
    fn test_regression_data() {
        let (x, y) = gen_regression_data(5);
        assert_eq!(x.dim(), (5, 1));
        assert_eq_float!(x[[0, 0]], -2.0 * PI);
        assert_eq_float!(x[[2, 0]], 0.0);
        assert_eq_float!(y[[2, 0]], 0.0);
    }

    #[test]
    fn test_parse_idx() {
        let mut bytes = vec![0, 0, 0x08, 2, 0, 0, 0, 2, 0, 0, 0, 3];
        bytes.extend([1, 2, 3, 4, 5, 6]);
        let (dims, payload) = parse_idx(&bytes).unwrap();
        assert_eq!(dims, vec![2, 3]);
        assert_eq!(payload, &[1, 2, 3, 4, 5, 6]);

        bytes.pop();
        assert!(matches!(
            parse_idx(&bytes),
            Err(DatasetError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_idx(&[0, 0, 0x0D, 1]),
            Err(DatasetError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_idx_rejects_overflowing_dimensions() {
        let mut bytes = vec![0, 0, 0x08, 3];
        for _ in 0..3 {
            bytes.extend([0xFF; 4]);
        }
        assert!(matches!(
            parse_idx(&bytes),
            Err(DatasetError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_word_list() {
        let contents = "# header\nEnglish\tHello\n\nspanish\thola\n";
        let words = parse_word_list(contents).unwrap();
        assert_eq!(
            words,
            vec![("hello".to_string(), 0), ("hola".to_string(), 1)]
        );

        assert!(matches!(
            parse_word_list("Klingon\tqapla"),
            Err(DatasetError::UnknownLanguage(name)) if name == "Klingon"
        ));
        assert!(matches!(
            parse_word_list("English hello"),
            Err(DatasetError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_load_language_words() {
        let dir = std::env::temp_dir().join(format!("grad-models-lang-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let train = dir.join("train.tsv");
        let validation = dir.join("validation.tsv");
        fs::write(&train, "English\tcat\nDutch\tkat\n").unwrap();
        fs::write(&validation, "Polish\tkot\n").unwrap();

        let (dataset, alphabet) = load_language_words(&train, &validation).unwrap();
        assert_eq!(alphabet, vec!['a', 'c', 'k', 'o', 't']);
        assert_eq!(dataset.num_chars(), 5);
        assert_eq!(dataset.n_classes(), 5);
        assert_eq!(dataset.len(), 2);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_task_display_round_trips_through_clap() {
        for task in [Task::Perceptron, Task::Regression, Task::Digits, Task::LangId] {
            assert_eq!(Task::from_str(&task.to_string(), false), Ok(task));
        }
    }
}
