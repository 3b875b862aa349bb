use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{Product, VariableSpec};
use crate::error::CensusError;
use crate::fetcher::FetchOptions;
use crate::geography::GeographyLevel;
use crate::geometry::Crs;
use crate::pipeline::{PipelineOptions, PipelineRequest};
use crate::resolver::ScopeFilter;
use crate::store::BoundaryCache;

pub const DEFAULT_YEAR: u16 = 2022;

/// Deserializable pipeline settings. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub level: Option<String>,
    /// `state=39 county=*` style scope.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableEntry>,
    #[serde(default)]
    pub include_margins: bool,
    #[serde(default)]
    pub target_crs: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
    #[serde(default)]
    pub variable_ceiling: Option<usize>,
    #[serde(default)]
    pub require_instances: bool,
    #[serde(default)]
    pub fail_on_any_failure: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VariableEntry {
    Shorthand(String),
    Detailed(VariableEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VariableEntryObject {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub request: PipelineRequest,
    pub options: PipelineOptions,
    pub cache_root: Utf8PathBuf,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Parses and validates a JSON document the caller already holds.
    pub fn from_json(content: &str) -> Result<ResolvedConfig, CensusError> {
        let config: PipelineConfig = serde_json::from_str(content)
            .map_err(|err| CensusError::Config(format!("parse config: {err}")))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: PipelineConfig) -> Result<ResolvedConfig, CensusError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(CensusError::Config(format!(
                "unsupported schema version {schema_version}"
            )));
        }

        let product = match config.product.as_deref() {
            Some(value) => value.parse::<Product>()?,
            None => Product::Acs5,
        };
        let level = match config.level.as_deref() {
            Some(value) => value.parse::<GeographyLevel>()?,
            None => GeographyLevel::County,
        };
        let scope = match config.scope.as_deref() {
            Some(value) => value.parse::<ScopeFilter>()?,
            None => ScopeFilter::new(),
        };
        let target_crs = match config.target_crs.as_deref() {
            Some(value) => value.parse::<Crs>()?,
            None => Crs::WGS84,
        };
        if !target_crs.is_supported() {
            return Err(CensusError::Config(format!(
                "unsupported target crs {target_crs}"
            )));
        }

        let entries = config
            .variables
            .into_iter()
            .map(|entry| match entry {
                VariableEntry::Shorthand(code) => (code.clone(), code),
                VariableEntry::Detailed(obj) => {
                    let name = obj.name.unwrap_or_else(|| obj.code.clone());
                    (obj.code, name)
                }
            })
            .collect::<Vec<_>>();
        let mut variables = VariableSpec::new(entries)?;
        if config.include_margins {
            variables = variables.with_margins()?;
        }

        let defaults = FetchOptions::default();
        let fetch = FetchOptions {
            max_parallel: config.max_parallel.unwrap_or(defaults.max_parallel),
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
            backoff_base: config
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: config
                .backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            variable_ceiling: config.variable_ceiling.unwrap_or(defaults.variable_ceiling),
        };
        validate_fetch_options(&fetch)?;

        let cache_root = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => BoundaryCache::default_root()?,
        };

        Ok(ResolvedConfig {
            schema_version,
            request: PipelineRequest {
                level,
                scope,
                product,
                year: config.year.unwrap_or(DEFAULT_YEAR),
                variables,
                target_crs,
            },
            options: PipelineOptions {
                fetch,
                require_instances: config.require_instances,
                fail_on_any_failure: config.fail_on_any_failure,
            },
            cache_root,
        })
    }
}

pub fn validate_fetch_options(options: &FetchOptions) -> Result<(), CensusError> {
    if options.max_parallel == 0 {
        return Err(CensusError::Config("max_parallel must be at least 1".to_string()));
    }
    if options.variable_ceiling == 0 {
        return Err(CensusError::Config(
            "variable_ceiling must be at least 1".to_string(),
        ));
    }
    if options.backoff_base > options.backoff_max {
        return Err(CensusError::Config(
            "backoff_base must not exceed backoff_max".to_string(),
        ));
    }
    Ok(())
}
