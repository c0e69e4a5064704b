//! Error handling module for slingshot
//!
//! Provides the crate-wide error type. Infrastructure failures, decode and
//! parse failures, validation problems and lookup misses all map onto one
//! `ProvisionError` so they can be collected into a single list by the
//! cluster pipeline.

use std::fmt;
use thiserror::Error;

/// Main error type for slingshot
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// IO errors (files, directories, pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A process or container could not be started, inspected or managed
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Malformed or unsupported archive content
    #[error("Decode error: {0}")]
    Decode(String),

    /// Malformed YAML, JSON or base64 input
    #[error("Parse error: {0}")]
    Parse(String),

    /// Semantic problems in a parameter document or cluster definition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Engine settings could not be loaded or are inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// A provider catalog has no command with the requested name
    #[error("command '{name}' not found in provider '{provider}'")]
    CommandNotFound { provider: String, name: String },

    /// Unknown provider name
    #[error("provider '{0}' not found")]
    ProviderNotFound(String),

    /// The pipeline needs a provider that was never initialized
    #[error("provider '{0}' is not initialized (no image name specified?)")]
    ProviderNotInitialized(String),

    /// More than one local image matches a filter
    #[error("more than one image matches '{image}' ({count} found)")]
    AmbiguousImage { image: String, count: usize },

    /// No local image exists even after pulling
    #[error("no image found for '{0}' after pulling")]
    ImageNotFound(String),

    /// An operation that needs at least one input got none
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// An archive stream ended without a regular file
    #[error("reached end of archive without finding a regular file")]
    NoRegularFile,

    /// The provider's discover bootstrap exited non-zero
    #[error("discover failed with exitcode={exit_code}: {stderr}")]
    DiscoverFailed { exit_code: i32, stderr: String },

    /// A step exited non-zero while strict exit codes are enabled
    #[error("step {step} ({argv}) exited with code {exit_code}")]
    StepFailed {
        step: usize,
        argv: String,
        exit_code: i32,
    },

    /// An error annotated with the pipeline step it happened in
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProvisionError>,
    },
}

/// Result type alias for slingshot operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create an infrastructure error
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Annotate with what was being done when the error happened
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error below any context annotations
    pub fn root_cause(&self) -> &ProvisionError {
        match self {
            Self::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_yaml::Error> for ProvisionError {
    fn from(err: serde_yaml::Error) -> Self {
        ProvisionError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(err: serde_json::Error) -> Self {
        ProvisionError::Parse(err.to_string())
    }
}

/// Every independent error a pipeline operation ran into.
///
/// Never constructed empty by the pipeline; an empty list means success and
/// is represented by `Ok(())` instead.
#[derive(Debug, Default)]
pub struct PipelineErrors(pub Vec<ProvisionError>);

impl PipelineErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: ProvisionError) {
        self.0.push(err);
    }

    pub fn extend(&mut self, errs: impl IntoIterator<Item = ProvisionError>) {
        self.0.extend(errs);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProvisionError> {
        self.0.iter()
    }

    /// `Ok(())` when nothing was collected, the list otherwise.
    pub fn into_result(self) -> std::result::Result<(), PipelineErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<ProvisionError> for PipelineErrors {
    fn from(err: ProvisionError) -> Self {
        Self(vec![err])
    }
}

impl IntoIterator for PipelineErrors {
    type Item = ProvisionError;
    type IntoIter = std::vec::IntoIter<ProvisionError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for PipelineErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineErrors {}
