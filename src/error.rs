use thiserror::Error;

use crate::{bert::DataCollatorForLanguageModelingBuilderError, train::BurnTrainerBuilderError};


/// The kind of errors that can happen in this program
#[derive(Debug, Error)]
pub enum Error {
    /// the arguments are inconsistent: the message names the flag to fix
    #[error("{0}")]
    Configuration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),
    #[error("recorder error: {0}")]
    Recorder(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("collator builder: {0}")]
    CollatorBuilder(#[from] DataCollatorForLanguageModelingBuilderError),
    #[error("trainer builder: {0}")]
    TrainerBuilder(#[from] BurnTrainerBuilderError),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

// burn's record and config errors are only guaranteed to be `Debug`
impl From<burn::record::RecorderError> for Error {
    fn from(e: burn::record::RecorderError) -> Self {
        Error::Recorder(format!("{e:?}"))
    }
}

impl From<burn::config::ConfigError> for Error {
    fn from(e: burn::config::ConfigError) -> Self {
        Error::Config(format!("{e:?}"))
    }
}

/// Custom result type to map the possible errors
pub type Result<T> = std::result::Result<T, Error>;
