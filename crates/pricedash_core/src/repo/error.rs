use crate::predicate::CompileError;
use crate::store::StoreError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error shared by every `Repository` implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum RepoError {
    /// No item exists for the rendered key.
    NotFound(String),
    /// A query named an index that is not registered in the table options.
    UnknownIndex(String),
    /// A key or record could not be converted to or from a stored item.
    InvalidRecord(String),
    InvalidFilter(CompileError),
    Store(StoreError),
}

impl RepoError {
    /// Whether the underlying store failure may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "resource does not exist: {key}"),
            Self::UnknownIndex(name) => write!(f, "index is not registered: {name}"),
            Self::InvalidRecord(message) => write!(f, "invalid record: {message}"),
            Self::InvalidFilter(err) => write!(f, "invalid filter: {err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidFilter(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::NotFound(_) | Self::UnknownIndex(_) | Self::InvalidRecord(_) => None,
        }
    }
}

impl From<CompileError> for RepoError {
    fn from(value: CompileError) -> Self {
        Self::InvalidFilter(value)
    }
}

impl From<StoreError> for RepoError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidRecord(value.to_string())
    }
}
