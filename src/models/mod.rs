//! The four trainable models
//!
//! Each model owns its parameters, composes tensor operations in `run`, and trains itself with a
//! fixed-rate gradient descent loop bounded by [`TrainConfig::max_iterations`](crate::nn::TrainConfig).

mod digits;
mod lang_id;
mod perceptron;
mod regression;

pub use digits::DigitClassificationModel;
pub use lang_id::{LANGUAGES, LanguageIdModel};
pub use perceptron::PerceptronModel;
pub use regression::RegressionModel;
