use thiserror::Error;

/// Errors raised by the numeric helpers in `kid-rs-core`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Argument passed into function was invalid.
    #[error("Invalid argument `{arg}`: {reason}")]
    InvalidArg {
        /// The invalid arg
        arg: String,
        /// Explaining why arg is invalid.
        reason: String,
    },
    /// Two paired inputs did not have the same length.
    #[error("Length mismatch between `{lhs}` ({lhs_len}) and `{rhs}` ({rhs_len})")]
    LengthMismatch {
        /// Name of the first argument.
        lhs: &'static str,
        /// Length of the first argument.
        lhs_len: usize,
        /// Name of the second argument.
        rhs: &'static str,
        /// Length of the second argument.
        rhs_len: usize,
    },
    /// A linear system could not be solved.
    #[error("Singular system: {reason}")]
    Singular {
        /// Explaining why the system is singular.
        reason: String,
    },
}

impl Error {
    pub(crate) fn invalid_arg(arg: &str, reason: impl Into<String>) -> Self {
        Error::InvalidArg {
            arg: arg.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout `kid-rs-core`.
pub type Result<T> = core::result::Result<T, Error>;
