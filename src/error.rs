//! Error types for ASL reconstruction

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AslError {
    /// scan parameters that can't describe a real acquisition
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },

    /// a statistical precondition failed, e.g. the outlier statistic came out NaN
    #[error("corrupt signal: {0}")]
    CorruptSignal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("context '{context}' failed: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AslError>,
    },
}

impl AslError {
    pub(crate) fn shape(what: &'static str, expected: impl std::fmt::Debug, found: impl std::fmt::Debug) -> Self {
        AslError::ShapeMismatch {
            what,
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        }
    }

    /// attaches the name of the processing context (e.g. "baseline") to an error
    pub fn in_context(self, context: impl Into<String>) -> Self {
        AslError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// the innermost error, skipping any context wrappers
    pub fn root(&self) -> &AslError {
        match self {
            AslError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<toml::de::Error> for AslError {
    fn from(err: toml::de::Error) -> Self {
        AslError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AslError {
    fn from(err: toml::ser::Error) -> Self {
        AslError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AslError {
    fn from(err: serde_json::Error) -> Self {
        AslError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AslError>;
