use miette::Diagnostic;
use thiserror::Error;

use crate::pipeline::FailedInstance;

#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum CensusError {
    #[error("invalid geography level: {0}")]
    InvalidLevel(String),

    #[error("invalid {level} identifier: {id}")]
    InvalidIdentifier { level: String, id: String },

    #[error("malformed scope at {level}: {reason}")]
    #[diagnostic(help("constrain every ancestor between the topmost filter and the target level"))]
    ScopeGap { level: String, reason: String },

    #[error("{product} is not available for {year}")]
    UnavailableProductYear { product: String, year: u16 },

    #[error("invalid variable spec: {0}")]
    InvalidVariableSpec(String),

    #[error("variable lookup failed: {0}")]
    VariableLookup(String),

    #[error("fetch for {geoid} failed after {attempts} attempts: {message}")]
    TransientFetch {
        geoid: String,
        attempts: usize,
        message: String,
    },

    #[error("fetch for {geoid} rejected: {message}")]
    NonTransientFetch { geoid: String, message: String },

    #[error("enumeration of {level} under {parent} failed: {message}")]
    Enumeration {
        level: String,
        parent: String,
        message: String,
    },

    #[error("scope resolved to zero {0} instances")]
    EmptyResolution(String),

    #[error("all {} fetches failed", .failures.len())]
    #[diagnostic(help("retry the listed instances with Pipeline::run_instances"))]
    AllFetchesFailed { failures: Vec<FailedInstance> },

    #[error("{} of {} fetches failed", .failures.len(), .total)]
    #[diagnostic(help("retry the listed instances with Pipeline::run_instances"))]
    FetchFailures {
        failures: Vec<FailedInstance>,
        total: usize,
    },

    #[error("geometry request failed: {0}")]
    Geometry(String),

    #[error("cannot reproject from {from} to {to}")]
    Reprojection { from: String, to: String },

    #[error("duplicate join key: {0}")]
    DuplicateJoinKey(String),

    #[error("column collision: {0}")]
    ColumnCollision(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error("geometry cache error: {0}")]
    Cache(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CensusError {
    /// Failed instances carried by a run that was aborted after fetching.
    pub fn failures(&self) -> Option<&[FailedInstance]> {
        match self {
            CensusError::AllFetchesFailed { failures }
            | CensusError::FetchFailures { failures, .. } => Some(failures),
            _ => None,
        }
    }
}
