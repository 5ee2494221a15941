use std::fmt;
use std::path::PathBuf;

/// Why a command was not applied. These are normal results, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NoDatabaseSelected,
    DatabaseNotFound(String),
    DatabaseExists(String),
    TableNotFound(String),
    TableExists(String),
    TableLocked(String),
    InvalidRecord(String),
    InvalidArgument(String),
    IndexExists(String),
    IndexMissing(String),
    StoreNotFound(PathBuf),
    NotMounted(String),
    Closed,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rejection::NoDatabaseSelected => write!(f, "no database selected"),
            Rejection::DatabaseNotFound(name) => write!(f, "database {} does not exist", name),
            Rejection::DatabaseExists(name) => write!(f, "database {} already exists", name),
            Rejection::TableNotFound(name) => write!(f, "table {} does not exist", name),
            Rejection::TableExists(name) => write!(f, "table {} already exists", name),
            Rejection::TableLocked(name) => write!(f, "table {} is locked", name),
            Rejection::InvalidRecord(reason) => write!(f, "invalid record: {}", reason),
            Rejection::InvalidArgument(reason) => write!(f, "invalid argument: {}", reason),
            Rejection::IndexExists(key) => write!(f, "index {} already exists", key),
            Rejection::IndexMissing(key) => write!(f, "index {} does not exist", key),
            Rejection::StoreNotFound(path) => write!(f, "database file {} not found", path.display()),
            Rejection::NotMounted(name) => write!(f, "database {} is not mounted", name),
            Rejection::Closed => write!(f, "engine is closed"),
        }
    }
}

/// Result of a facade command that may be refused for usage reasons.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Outcome<T> {
    Applied(T),
    Skipped(Rejection),
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Outcome::Applied(value) => Some(value),
            Outcome::Skipped(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Applied(_) => None,
            Outcome::Skipped(reason) => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Applied(value) => Outcome::Applied(f(value)),
            Outcome::Skipped(reason) => Outcome::Skipped(reason),
        }
    }
}

impl<T> From<Rejection> for Outcome<T> {
    fn from(reason: Rejection) -> Self {
        Outcome::Skipped(reason)
    }
}
