pub mod error;
pub mod config;
pub mod tensor;
pub mod tape;
pub mod traced;
pub mod distribution;
pub mod e_step;
pub mod predictor;
pub mod cell;
pub mod loss;
pub mod optim;
pub mod unroll;
pub mod gradient;

pub use cell::{CellState, NemCell, RecurrentCell, StepInput};
pub use config::{NemConfig, PixelPrior, StepWeights};
pub use error::{NemError, Result};
pub use loss::{LossModel, LossRecord};
pub use optim::{AdamW, AdamWConfig, Optimizer, Sgd};
pub use predictor::{InnerPredictor, RnnConfig, RnnPredictor};
pub use tensor::Tensor;
pub use unroll::{compute_gradients, forward_unroll, static_nem_iterations, NemBatch, UnrollReport};
