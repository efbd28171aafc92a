//! Crate-wide error value.
//!
//! Every failure carries an [`ErrorKind`] so that callers can tell a bad input
//! (reject immediately) from a failed fit (mark the chunk invalid and move on).

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Mismatched array lengths, non-monotonic templates, empty chunks, bad settings.
    Input,
    /// File open/parse/write failures.
    Io,
    /// Pixel mapping falls outside the template or kernel-valid range.
    Domain,
    /// Solver did not converge, or the Jacobian/covariance is singular.
    Convergence,
    /// Zero kernel sum, non-finite absorber or model values.
    Numerical,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Io => "io",
            ErrorKind::Domain => "domain",
            ErrorKind::Convergence => "convergence",
            ErrorKind::Numerical => "numerical",
        }
    }
}

#[derive(Clone)]
pub struct AppError {
    kind: ErrorKind,
    message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Input, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn domain(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Domain, message)
    }

    pub fn convergence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Convergence, message)
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Numerical, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for errors that invalidate one chunk's fit rather than the inputs.
    pub fn is_fit_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::Convergence | ErrorKind::Numerical)
    }

    pub fn exit_code(&self) -> u8 {
        match self.kind {
            ErrorKind::Input | ErrorKind::Io => 2,
            ErrorKind::Domain => 3,
            ErrorKind::Convergence | ErrorKind::Numerical => 4,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_failures_map_to_exit_code_four() {
        assert!(AppError::convergence("x").is_fit_failure());
        assert!(AppError::numerical("x").is_fit_failure());
        assert!(!AppError::domain("x").is_fit_failure());
        assert_eq!(AppError::numerical("x").exit_code(), 4);
        assert_eq!(AppError::input("x").exit_code(), 2);
    }
}
