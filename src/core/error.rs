use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwrError {
    #[error("asset allocation must sum to 100%, got {total}%")]
    AllocationWeights { total: u32 },

    #[error(
        "payout period of {payout_period_years} years needs at least that many years of history, {available_years} available"
    )]
    InsufficientHistory {
        payout_period_years: u32,
        available_years: usize,
    },

    #[error("return series ({returns} years) and inflation series ({inflation} years) are not aligned")]
    MisalignedSeries { returns: usize, inflation: usize },

    #[error("asset return series cover different years: {expected} and {found}")]
    MisalignedAssets { expected: String, found: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SwrError {
    /// Errors the caller can fix by changing inputs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SwrError::AllocationWeights { .. }
                | SwrError::InsufficientHistory { .. }
                | SwrError::InvalidParameter(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SwrError>;
