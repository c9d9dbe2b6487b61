use thiserror::Error;

/// Errors raised by the power envelope engine
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PowerError {
    #[error("Infeasible limitation: {0}")]
    Feasibility(String),
    #[error("Invalid rated apparent power: {0} VA (must be positive)")]
    InvalidRating(f64),
    #[error("Invalid limitation parameter: {0}")]
    InvalidParameter(String),
    #[error("Unknown limitation: {0}")]
    UnknownLimitation(String),
    #[error("Unknown cluster member: {0}")]
    UnknownMember(String),
}

impl PowerError {
    pub fn is_feasibility(&self) -> bool {
        matches!(self, PowerError::Feasibility(_))
    }
}
