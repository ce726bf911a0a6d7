//! Error types for ballvae.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to write array: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("Failed to read array: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("Directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("No sequences found in dataset: {0}")]
    EmptyDataset(PathBuf),

    #[error("Index {index} out of bounds (size: {size})")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("Frame {path} is {actual:?}, expected {expected:?}")]
    FrameSize {
        path: PathBuf,
        actual: (u32, u32),
        expected: (u32, u32),
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tensor data error: {0}")]
    TensorData(String),
}

pub type Result<T> = std::result::Result<T, Error>;
