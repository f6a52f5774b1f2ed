use std::convert::Infallible;

use thiserror::Error;

/// An identifier that cannot be normalized at the API boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Entity id is not an integer: {0}")]
    NotIntegral(String),

    #[error("Entity id out of range: {0}")]
    OutOfRange(String),

    #[error("Entity id is not numeric: {0:?}")]
    Unparseable(String),

    #[error("Platform id must not be empty")]
    EmptyPlatform,
}

impl From<Infallible> for KeyError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// A research result that cannot be turned into a demographic profile.
/// Never transient; retrying the same text gives the same answer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("No JSON object found in research output")]
    NoJson,

    #[error("Research output does not match the demographic schema: {0}")]
    Schema(String),

    #[error("Research output has no gender, age or geography data")]
    Empty,

    #[error("Percentage out of range in {field}: {value}")]
    OutOfRange { field: String, value: f64 },
}
