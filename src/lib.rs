//! Small neural network models trained by gradient descent, built on a minimal
//! matrix-valued autodiff engine.

pub mod backprop_fns;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod models;
pub mod nn;
pub mod optim;
pub mod tensor;
