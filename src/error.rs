use thiserror::Error;

#[derive(Error, Debug)]
pub enum BsmError {
    #[error("invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("parameter length mismatch: expected {expected}, got {got}")]
    ParamLengthMismatch { expected: usize, got: usize },

    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    #[error("optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("data error: {0}")]
    DataError(String),
}

pub type Result<T> = std::result::Result<T, BsmError>;
