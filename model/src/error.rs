use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire model crate.
pub type Result<T> = std::result::Result<T, ModelErr>;

/// The model crate's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelErr {
    /// Two parameter maps don't share the same key set.
    ParameterMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    /// Two parameter maps share a key but the tensor shapes differ.
    ShapeMismatch {
        key: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    EmptyReduction,
    InvalidSpec(String),
    Dataset(String),
}

impl Display for ModelErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelErr::ParameterMismatch {
                missing,
                unexpected,
            } => write!(
                f,
                "parameter key sets differ, missing {missing:?}, unexpected {unexpected:?}"
            ),
            ModelErr::ShapeMismatch { key, got, expected } => write!(
                f,
                "shape mismatch for parameter {key}, got {got:?} and expected {expected:?}"
            ),
            ModelErr::EmptyReduction => f.write_str("tried to reduce an empty set of parameter maps"),
            ModelErr::InvalidSpec(detail) => write!(f, "invalid model spec: {detail}"),
            ModelErr::Dataset(detail) => write!(f, "dataset error: {detail}"),
        }
    }
}

impl Error for ModelErr {}
