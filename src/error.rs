use std::fmt::Display;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, FemError>;

#[derive(Debug, Clone, PartialEq)]
pub enum FemError {
    /// Malformed connectivity or DOF declarations
    InvalidMesh(String),
    /// A pipeline stage was invoked before the stage it depends on
    OrderingViolation(String),
    /// The constraint set cannot be satisfied
    ConstraintConflict(String),
    /// Factorization found a singular or non-positive-definite matrix
    SingularSystem(String),
    /// A solution or DOF index is out of range
    OutOfRange(String),
    /// The interpolation grid was queried before it was built
    UninitializedGrid(String),
    /// The interpolation grid geometry is unusable
    InvalidGrid(String),
    Input(String),
    PostProcessor(String),
}

impl Display for FemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (err_name, value) = match self {
            FemError::InvalidMesh(v) => ("Invalid mesh", v),
            FemError::OrderingViolation(v) => ("Ordering violation", v),
            FemError::ConstraintConflict(v) => ("Constraint conflict", v),
            FemError::SingularSystem(v) => ("Singular system", v),
            FemError::OutOfRange(v) => ("Out of range", v),
            FemError::UninitializedGrid(v) => ("Uninitialized grid", v),
            FemError::InvalidGrid(v) => ("Invalid grid", v),
            FemError::Input(v) => ("Input", v),
            FemError::PostProcessor(v) => ("Post Processor", v),
        };

        write!(f, "{} error: {}", err_name, value)
    }
}

impl std::error::Error for FemError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_error_kind() {
        let err = FemError::SingularSystem("pivot 3 is zero".to_owned());
        assert_eq!(err.to_string(), "Singular system error: pivot 3 is zero");

        let err = FemError::PostProcessor("disk full".to_owned());
        assert_eq!(err.to_string(), "Post Processor error: disk full");
    }
}
