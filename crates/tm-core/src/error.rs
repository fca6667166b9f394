use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// A vector or stored array does not have the length/shape the config requires.
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    InvalidConfig(String),
    InvalidData(String),
}

impl ModelError {
    pub fn shape(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        ModelError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Length check for flat vectors.
    pub fn check_len(what: &str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::shape(what, &[expected], &[actual]))
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::ShapeMismatch {
                what,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch for {what}: expected {expected:?}, got {actual:?}"
            ),
            ModelError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ModelError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        ModelError::InvalidData(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
