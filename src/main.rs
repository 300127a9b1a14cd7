//! Trains one of the `grad_models` models and reports how training went
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- --task regression --plot
//! cargo run --release -- --task digits --data-dir data/mnist
//! cargo run --release -- --task lang-id --data-dir data/lang_id
//! ```
//!
//! The perceptron and regression tasks use generated data. Digit classification expects the four
//! MNIST IDX files in `--data-dir`, language identification expects `train.tsv` and
//! `validation.tsv` word lists there.

use std::{error::Error, fs, path::PathBuf};

use grad_models::{
    dataloader::DataLoader,
    datasets::{
        Task, gen_perceptron_data, gen_regression_data, load_language_words, load_mnist,
        plot_perceptron, plot_regression,
    },
    models::{DigitClassificationModel, LanguageIdModel, PerceptronModel, RegressionModel},
    nn::{TrainConfig, TrainReport},
};

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Task::Perceptron)]
    task: Task,
    /// Directory holding the digit or language datasets
    #[clap(short, long)]
    data_dir: Option<PathBuf>,
    /// Overrides the model's bound on epochs (or steps for lang-id)
    #[clap(long)]
    max_iterations: Option<usize>,
    #[clap(short, long)]
    learning_rate: Option<f32>,
    /// Seeds parameter initialization, data generation and shuffling
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(long, default_value_t = 500)]
    perceptron_points: usize,
    #[clap(long, default_value_t = 200)]
    regression_points: usize,
    #[clap(long, default_value_t = false)]
    plot: bool,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
}

impl Args {
    fn config(&self, defaults: TrainConfig) -> TrainConfig {
        let mut config = defaults;
        if let Some(max_iterations) = self.max_iterations {
            config = config.with_max_iterations(max_iterations);
        }
        if let Some(learning_rate) = self.learning_rate {
            config = config.with_learning_rate(learning_rate);
        }
        config
    }

    fn warn_no_plot(&self) {
        if self.plot {
            log::warn!("--plot is not supported for the {} task, ignoring it", self.task);
        }
    }

    fn data_dir(&self) -> Result<&PathBuf, Box<dyn Error>> {
        self.data_dir
            .as_ref()
            .ok_or_else(|| format!("--data-dir is required for the {} task", self.task).into())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut rng = match args.seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::from_rng(&mut rand::rng()),
    };
    let shuffle_seed: u64 = rng.random();
    if args.plot {
        fs::create_dir_all(&args.output_dir)?;
    }

    let report: TrainReport = match args.task {
        Task::Perceptron => {
            let (data, labels) = gen_perceptron_data(args.perceptron_points, &mut rng);
            let dataset = DataLoader::new(data.clone(), labels.clone(), false)?;
            let mut model = PerceptronModel::with_rng(data.ncols(), &mut rng)?;
            let report =
                model.train_with(&dataset, &args.config(PerceptronModel::DEFAULT_CONFIG))?;
            log::info!("weights: {}", model.get_weights().data());
            if args.plot {
                plot_perceptron(
                    &model,
                    &data,
                    &labels,
                    &format!("{}/perceptron.png", args.output_dir),
                )?;
            }
            report
        }
        Task::Regression => {
            let (x, y) = gen_regression_data(args.regression_points);
            let dataset = DataLoader::new(x.clone(), y.clone(), false)?;
            let mut model = RegressionModel::with_rng(&mut rng)?;
            let report =
                model.train_with(&dataset, &args.config(RegressionModel::DEFAULT_CONFIG))?;
            if args.plot {
                plot_regression(
                    &model,
                    &x,
                    &y,
                    &format!("{}/regression.png", args.output_dir),
                )?;
            }
            report
        }
        Task::Digits => {
            args.warn_no_plot();
            let dataset = load_mnist(args.data_dir()?, true)?.with_seed(shuffle_seed);
            let mut model = DigitClassificationModel::with_rng(&mut rng)?;
            model.train_with(&dataset, &args.config(DigitClassificationModel::DEFAULT_CONFIG))?
        }
        Task::LangId => {
            args.warn_no_plot();
            let data_dir = args.data_dir()?;
            let (dataset, alphabet) = load_language_words(
                &data_dir.join("train.tsv"),
                &data_dir.join("validation.tsv"),
            )?;
            let dataset = dataset.with_seed(shuffle_seed);
            log::debug!("alphabet: {}", alphabet.iter().collect::<String>());
            let mut model = LanguageIdModel::with_rng(dataset.num_chars(), &mut rng)?;
            model.train_with(&dataset, &args.config(LanguageIdModel::DEFAULT_CONFIG))?
        }
    };

    log::info!(
        "task: {}, iterations: {}, final metric: {}",
        args.task,
        report.iterations,
        report.metric
    );
    Ok(())
}
