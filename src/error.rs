use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OcrError>;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("cannot read config `{path}`: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("cannot read dataset `{path}`: {source}")]
    DatasetRead { path: PathBuf, source: io::Error },

    #[error("cannot decode pickled dataset: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("invalid sample `{file_name}`: {reason}")]
    InvalidSample { file_name: String, reason: String },

    #[error("dataset `{0}` contains no usable samples")]
    EmptyDataset(PathBuf),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("no training device available")]
    NoDevice,

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}
