mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tempfile::TempDir;

use census_etl::config::{ConfigLoader, PipelineConfig};
use census_etl::domain::Product;
use census_etl::error::CensusError;
use census_etl::geography::GeographyLevel;
use census_etl::geometry::Crs;
use census_etl::pipeline::Pipeline;
use census_etl::resolver::ScopeValue;
use census_etl::sink::{MemorySink, SinkTarget};

use common::{MockCatalog, MockGeometry, MockSource};

fn parse(json: &str) -> PipelineConfig {
    serde_json::from_str(json).unwrap()
}

#[test]
fn detailed_config_resolves() {
    let config = parse(
        r#"{
            "schema_version": 1,
            "product": "acs5",
            "year": 2021,
            "level": "tract",
            "scope": "state=OH county=049",
            "variables": [
                "B01003_001E",
                {"code": "B19013_001E", "name": "median_income"}
            ],
            "include_margins": true,
            "target_crs": "EPSG:3857",
            "cache_dir": "/tmp/census-etl-test",
            "max_parallel": 8,
            "max_retries": 5,
            "backoff_base_ms": 100,
            "backoff_max_ms": 2000,
            "variable_ceiling": 20,
            "fail_on_any_failure": true
        }"#,
    );
    let resolved = ConfigLoader::resolve_config(config).unwrap();

    assert_eq!(resolved.request.level, GeographyLevel::Tract);
    assert_eq!(resolved.request.year, 2021);
    assert_eq!(resolved.request.product, Product::Acs5);
    assert_eq!(resolved.request.target_crs, Crs::WEB_MERCATOR);
    assert_eq!(
        resolved.request.scope.get(GeographyLevel::State),
        Some(&ScopeValue::Explicit("39".to_string()))
    );
    assert_eq!(
        resolved.request.variables.columns(),
        vec![
            "B01003_001E",
            "median_income",
            "B01003_001E_moe",
            "median_income_moe"
        ]
    );
    assert_eq!(resolved.options.fetch.max_parallel, 8);
    assert_eq!(resolved.options.fetch.max_retries, 5);
    assert_eq!(resolved.options.fetch.backoff_base, Duration::from_millis(100));
    assert_eq!(resolved.options.fetch.variable_ceiling, 20);
    assert!(resolved.options.fail_on_any_failure);
    assert!(!resolved.options.require_instances);
}

#[test]
fn config_errors_are_reported() {
    let cases = [
        r#"{"schema_version": 2}"#,
        r#"{"product": "sf3"}"#,
        r#"{"max_parallel": 0}"#,
        r#"{"variable_ceiling": 0}"#,
        r#"{"backoff_base_ms": 5000, "backoff_max_ms": 10}"#,
        r#"{"target_crs": "EPSG:2834"}"#,
    ];
    for case in cases {
        let mut config = parse(case);
        config.cache_dir = Some("/tmp/census-etl-test".to_string());
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(CensusError::Config(_)),
            "{case}"
        );
    }
}

#[test]
fn bad_variables_and_scope_keep_their_error_kind() {
    let config = parse(r#"{"cache_dir": "/tmp/x", "variables": ["B01003_001E", "B01003_001E"]}"#);
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(CensusError::InvalidVariableSpec(_))
    );

    let config = parse(r#"{"cache_dir": "/tmp/x", "scope": "state=Atlantis"}"#);
    assert!(ConfigLoader::resolve_config(config).is_err());

    let config = parse(r#"{"cache_dir": "/tmp/x", "target_crs": "not a crs"}"#);
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(CensusError::Reprojection { .. })
    );
}

#[test]
fn json_text_resolves_in_one_step() {
    let resolved = ConfigLoader::from_json(
        r#"{"level": "county", "scope": "state=39", "variables": ["B01003_001E"], "cache_dir": "/tmp/census-etl-test"}"#,
    )
    .unwrap();
    assert_eq!(resolved.request.level, GeographyLevel::County);
    assert_eq!(resolved.request.variables.len(), 1);
    assert_eq!(resolved.cache_root.as_str(), "/tmp/census-etl-test");

    assert_matches!(ConfigLoader::from_json("{ not json"), Err(CensusError::Config(_)));
    assert_matches!(
        ConfigLoader::from_json(r#"{"level": "zcta"}"#),
        Err(CensusError::InvalidLevel(_))
    );
}

#[test]
fn resolved_config_drives_a_pipeline() {
    let temp = TempDir::new().unwrap();
    let mut config = parse(
        r#"{"level": "county", "scope": "state=39", "variables": [{"code": "B01003_001E", "name": "population"}], "backoff_base_ms": 1, "backoff_max_ms": 2}"#,
    );
    config.cache_dir = temp.path().to_str().map(str::to_string);
    let resolved = ConfigLoader::resolve_config(config).unwrap();

    let geometry = Arc::new(MockGeometry::new().with_features(GeographyLevel::County, 2022, &["39049"]));
    let pipeline = Pipeline::from_config(
        &resolved,
        Arc::new(MockSource::new()),
        Arc::new(MockCatalog::ohio()),
        Arc::clone(&geometry),
    )
    .unwrap();
    let sink = MemorySink::new();
    let report = pipeline
        .run(&resolved.request, &sink, &SinkTarget::named("ohio"))
        .unwrap();

    assert_eq!(report.records_written, 88);
    assert_eq!(sink.last().unwrap().columns(), ["population"]);
    assert!(pipeline.joiner().cache().contains(GeographyLevel::County, 2022));
    assert_eq!(pipeline.joiner().cache().root().as_str(), temp.path().to_str().unwrap());
}
