//! Error surface: size mismatches (raised before any device work) and
//! validity violations (raised after kernel completion).
//!
//! Every variant is a programming or data-validity error meant to
//! propagate to the caller. There are no retries anywhere in this crate.

use std::fmt;

/// An error raised by matrix construction, assignment, or a validity check.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Two dimensions that must agree do not. Detected before any kernel
    /// is compiled or launched.
    SizeMismatch {
        /// Function name for the error message (e.g. `"cauchy_lcdf"`).
        function: String,
        /// Role of the first dimension (e.g. `"rows of argument"`).
        lhs_role: String,
        lhs: usize,
        /// Role of the second dimension (e.g. `"rows of expression"`).
        rhs_role: String,
        rhs: usize,
    },
    /// A validity check found a failing element. Carries the first failing
    /// location (first to win the atomic claim) and its value.
    Validation {
        function: String,
        variable: String,
        row: u32,
        col: u32,
        value: f32,
        must_be: String,
    },
    /// No operand in the assignment references a matrix, so there is
    /// nothing to size the launch by.
    ShapeUnknown { function: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SizeMismatch {
                function,
                lhs_role,
                lhs,
                rhs_role,
                rhs,
            } => {
                write!(
                    f,
                    "{}: {} ({}) must match {} ({})",
                    function, lhs_role, lhs, rhs_role, rhs
                )
            }
            Error::Validation {
                function,
                variable,
                row,
                col,
                value,
                must_be,
            } => {
                write!(
                    f,
                    "{}: {}[{}, {}] = {}, but it must be {}!",
                    function, variable, row, col, value, must_be
                )
            }
            Error::ShapeUnknown { function } => {
                write!(f, "{}: no operand determines the launch shape", function)
            }
        }
    }
}

impl std::error::Error for Error {}
