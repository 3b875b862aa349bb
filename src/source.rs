use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::domain::{Product, Row, VariableSpec};
use crate::geography::{GeographyInstance, GeographyLevel, parse_geoid};

/// Failure reported by a remote capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("rate limited")]
    RateLimited,

    #[error("invalid variable: {0}")]
    InvalidVariable(String),

    #[error("invalid geography: {0}")]
    InvalidGeography(String),

    #[error("transport error (status {status:?}): {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    RateLimited,
    InvalidVariable,
    InvalidGeography,
    Transport,
    Cancelled,
}

impl SourceError {
    /// Timeouts, connection failures, 408, 429 and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::RateLimited => true,
            SourceError::Transport { status: None, .. } => true,
            SourceError::Transport {
                status: Some(status),
                ..
            } => *status == 408 || *status >= 500,
            SourceError::InvalidVariable(_) | SourceError::InvalidGeography(_) => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SourceError::RateLimited => FailureKind::RateLimited,
            SourceError::InvalidVariable(_) => FailureKind::InvalidVariable,
            SourceError::InvalidGeography(_) => FailureKind::InvalidGeography,
            SourceError::Transport { .. } => FailureKind::Transport,
        }
    }
}

/// `for`/`in` clauses addressing one instance, or all children of a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeographyFilter {
    pub level: GeographyLevel,
    pub code: String,
    pub within: Vec<(GeographyLevel, String)>,
}

impl GeographyFilter {
    pub fn for_instance(instance: &GeographyInstance) -> Self {
        let within = if instance.level().is_self_identifying() {
            Vec::new()
        } else {
            enclosing_components(instance.id(), instance.level())
        };
        Self {
            level: instance.level(),
            code: instance.api_code().to_string(),
            within,
        }
    }

    pub fn children_of(parent: &GeographyInstance, child_level: GeographyLevel) -> Self {
        let mut within = Vec::new();
        if parent.level() >= GeographyLevel::State && child_level > parent.level() {
            within = parse_geoid(parent.id())
                .map(|parts| {
                    parts
                        .into_iter()
                        .filter(|(level, _)| *level != GeographyLevel::BlockGroup)
                        .collect()
                })
                .unwrap_or_default();
        } else if parent.level() != GeographyLevel::Nation {
            within.push((parent.level(), parent.id().to_string()));
        }
        Self {
            level: child_level,
            code: "*".to_string(),
            within,
        }
    }

    pub fn for_clause(&self) -> String {
        format!("{}:{}", self.level.api_name(), self.code)
    }

    pub fn in_clause(&self) -> Option<String> {
        if self.within.is_empty() {
            return None;
        }
        let parts = self
            .within
            .iter()
            .map(|(level, code)| format!("{}:{}", level.api_name(), code))
            .collect::<Vec<_>>();
        Some(parts.join(" "))
    }
}

// The census API addresses blocks within tracts, so the block group digit
// stays part of the block code instead of becoming an `in` clause.
fn enclosing_components(id: &str, level: GeographyLevel) -> Vec<(GeographyLevel, String)> {
    let mut parts = parse_geoid(id).unwrap_or_default();
    parts.pop();
    if level == GeographyLevel::Block {
        parts.retain(|(level, _)| *level != GeographyLevel::BlockGroup);
    }
    parts
}

pub trait StatisticsSource: Send + Sync {
    /// Rows are keyed by full GEOID, values by source variable code.
    fn fetch(
        &self,
        product: Product,
        year: u16,
        variables: &VariableSpec,
        filter: &GeographyFilter,
    ) -> Result<Vec<Row>, SourceError>;
}

pub trait GeographyCatalog: Send + Sync {
    /// Returns `(identifier, name)` pairs of the children at `child_level`.
    fn enumerate_children(
        &self,
        parent: &GeographyInstance,
        child_level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<(String, Option<String>)>, SourceError>;
}

impl<T: StatisticsSource + ?Sized> StatisticsSource for Arc<T> {
    fn fetch(
        &self,
        product: Product,
        year: u16,
        variables: &VariableSpec,
        filter: &GeographyFilter,
    ) -> Result<Vec<Row>, SourceError> {
        (**self).fetch(product, year, variables, filter)
    }
}

impl<T: GeographyCatalog + ?Sized> GeographyCatalog for Arc<T> {
    fn enumerate_children(
        &self,
        parent: &GeographyInstance,
        child_level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<(String, Option<String>)>, SourceError> {
        (**self).enumerate_children(parent, child_level, year)
    }
}
