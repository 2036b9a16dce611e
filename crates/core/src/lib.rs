//! CartoonGAN inference on the CPU, with image and per-frame video entry
//! points.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod frame;
pub mod generator;
pub mod layers;
pub mod logging;
pub mod preprocess;
pub mod runtime;
pub mod streaming_executor;
pub mod tensor;
pub mod transform;
pub mod video;

pub use error::{Result, ToonError};
pub use generator::Generator;
