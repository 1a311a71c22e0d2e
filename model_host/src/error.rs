use std::{error::Error, fmt, io};

use crate::storage::StorageError;

/// Failures while turning the stored blob into a runnable model.
#[derive(Debug)]
pub enum LoadError {
    /// The store holds no committed model.
    NoModel,
    /// The blob was produced for another schema version.
    WrongVersion { found: u32, expected: u32 },
    /// The inference workspace could not be reserved.
    ArenaAllocFailure { required: usize, available: usize },
    /// Any other executor-reported failure.
    LoadFailure(i32),
    /// The blob could not be read back from the store.
    Storage(StorageError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoModel => f.write_str("no model stored"),
            Self::WrongVersion { found, expected } => write!(
                f,
                "Model provided is schema version {found} not equal to supported version {expected}."
            ),
            Self::ArenaAllocFailure {
                required,
                available,
            } => write!(
                f,
                "Can't allocate arena: model needs {required} bytes, {available} available"
            ),
            Self::LoadFailure(code) => write!(f, "Can't load model: {code}"),
            Self::Storage(e) => write!(f, "Can't read model: {e}"),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for LoadError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

/// Failures of a single inference run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// No model is loaded, or the last load failed.
    NotReady,
    /// The amount of input tensors doesn't match the model.
    InputCount { got: usize, expected: usize },
    /// An input tensor has the wrong amount of elements.
    InputMismatch {
        index: usize,
        got: usize,
        expected: usize,
    },
    /// The executor reported a failure while running.
    Failure(i32),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => f.write_str("no model loaded"),
            Self::InputCount { got, expected } => write!(
                f,
                "Wrong number of input arrays: {got} expecting: {expected}"
            ),
            Self::InputMismatch {
                index,
                got,
                expected,
            } => write!(
                f,
                "Wrong number of elements in array {index}: {got} expecting: {expected}"
            ),
            Self::Failure(code) => write!(f, "Model invocation error: {code}"),
        }
    }
}

impl Error for InvokeError {}

/// Failures of a chunked model transfer.
#[derive(Debug)]
pub enum UploadError {
    /// The declared size doesn't fit the store or can't hold a model header.
    InvalidSize { declared: usize, available: usize },
    /// The running offset stopped being 8-aligned before the end of the transfer.
    CorruptStream { offset: usize },
    /// The stream closed before the declared size was reached.
    Aborted { received: usize, declared: usize },
    /// The store rejected a write.
    Storage(StorageError),
    /// The transfer completed but the model didn't load.
    Load(LoadError),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize {
                declared,
                available,
            } => write!(
                f,
                "invalid model size {declared}, {available} bytes available"
            ),
            Self::CorruptStream { offset } => {
                write!(f, "corrupt stream: offset {offset} not 8-aligned")
            }
            Self::Aborted { received, declared } => write!(
                f,
                "transfer aborted after {received} of {declared} bytes"
            ),
            Self::Storage(e) => write!(f, "{e}"),
            Self::Load(e) => write!(f, "{e}"),
        }
    }
}

impl Error for UploadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Load(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<LoadError> for UploadError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

/// Failures while reading or validating the node configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file couldn't be read.
    Io { path: String, source: io::Error },
    /// The configuration file isn't valid JSON for `HostConfig`.
    Parse(serde_json::Error),
    /// A field holds a value the node can't run with.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read '{path}': {source}"),
            Self::Parse(e) => write!(f, "invalid JSON: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Boundary conversion for the binary.
impl From<ConfigError> for io::Error {
    fn from(value: ConfigError) -> Self {
        match value {
            ConfigError::Io { source, .. } => source,
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}
