//! Error types for the overlay composer core

use crate::backend::Output;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("composer initialization failed: {0}")]
    Init(String),

    #[error("display device error: {0}")]
    Device(String),

    #[error("output {0} is disconnected")]
    Disconnected(Output),

    #[error("output {0} has no usable mode")]
    NoMode(Output),

    #[error("mode setting failed on {output}: {reason}")]
    ModeSetting { output: Output, reason: String },

    #[error("buffer allocation failed: {0}")]
    BufferAlloc(String),

    #[error("translation table mapping failed: {0}")]
    GttMap(String),

    #[error("shared context error: {0}")]
    SharedContext(String),

    #[error("scaler coefficient overflow at phase {phase} tap {tap}")]
    CoeffOverflow { phase: usize, tap: usize },

    #[error("scale ratio {0}:1 exceeds the hardware limit")]
    ScaleRatio(u32),

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
