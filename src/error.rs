use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid aggregation policy '{0}': expected one of sum, average, end-of-period")]
    InvalidPolicy(String),

    #[error("No explicit aggregation policy for metrics: {}", .0.join(", "))]
    UnresolvedPolicies(Vec<String>),

    #[error("Invalid fiscal year end month {0}: must be between 1 and 12")]
    InvalidFiscalYearEndMonth(u32),

    #[error("Invalid currency divisor {0}: must be a positive finite number")]
    InvalidCurrencyDivisor(f64),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
