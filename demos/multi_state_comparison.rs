//! Compares county-level economic indicators across six Midwest states and
//! rolls them up to one row per state.
//!
//! ```text
//! CENSUS_API_KEY=... CENSUS_BOUNDARY_URL='https://host/{year}/{level}.geojson' \
//!     cargo run --example multi_state_comparison
//! ```

use std::env;
use std::sync::Arc;

use miette::miette;

use census_etl::boundaries::GeoJsonBoundaryClient;
use census_etl::census_api::CensusApiClient;
use census_etl::domain::{Product, Value, VariableSpec};
use census_etl::fetcher::FetchOptions;
use census_etl::geography::{GeographyLevel, STATES};
use census_etl::joiner::JoinedRecord;
use census_etl::logging::init_tracing;
use census_etl::pipeline::{Pipeline, PipelineOptions, PipelineRequest};
use census_etl::resolver::ScopeFilter;
use census_etl::sink::{JsonFileSink, MemorySink, RecordSink, SinkTarget};
use census_etl::store::BoundaryCache;
use census_etl::transform::{Aggregate, DerivedColumn, RecordSet, Transformer, rollup};

const MIDWEST: [&str; 6] = ["39", "18", "26", "17", "55", "27"];

fn main() -> miette::Result<()> {
    init_tracing();

    let mut client = CensusApiClient::new()?;
    if let Ok(key) = env::var("CENSUS_API_KEY") {
        client = client.with_api_key(key);
    }
    let client = Arc::new(client);
    let boundary_url = env::var("CENSUS_BOUNDARY_URL")
        .map_err(|_| miette!("set CENSUS_BOUNDARY_URL to a {{year}}/{{level}} GeoJSON template"))?;

    let options = PipelineOptions {
        fetch: FetchOptions {
            max_parallel: 4,
            ..FetchOptions::default()
        },
        ..PipelineOptions::default()
    };
    let pipeline = Pipeline::new(
        Arc::clone(&client),
        Arc::clone(&client),
        GeoJsonBoundaryClient::new(boundary_url)?,
        BoundaryCache::new()?,
        options,
    )?
    .with_transformer(
        Transformer::new()
            .derive(DerivedColumn::percentage(
                "unemployment_rate",
                "unemployed",
                "labor_force",
            ))
            .derive(DerivedColumn::percentage(
                "poverty_rate",
                "below_poverty",
                "total_population",
            )),
    );

    let variables = VariableSpec::new([
        ("B01003_001E", "total_population"),
        ("B19013_001E", "median_household_income"),
        ("B19301_001E", "per_capita_income"),
        ("B23025_003E", "labor_force"),
        ("B23025_005E", "unemployed"),
        ("B25077_001E", "median_home_value"),
        ("B17001_002E", "below_poverty"),
    ])?;

    let sink = MemorySink::new();
    for fips in MIDWEST {
        let request = PipelineRequest::new(
            GeographyLevel::County,
            ScopeFilter::new().with(GeographyLevel::State, fips)?,
            Product::Acs5,
            2022,
            variables.clone(),
        );
        let report = pipeline.run(&request, &sink, &SinkTarget::named(fips))?;
        println!(
            "{}: {} counties, {} failed",
            state_name(fips),
            report.records_written,
            report.fetches_failed
        );
    }

    let written = sink.written();
    let columns = written
        .first()
        .map(|(_, records)| records.columns().to_vec())
        .ok_or_else(|| miette!("no state produced records"))?;
    let counties = RecordSet::new(
        columns,
        written
            .into_iter()
            .flat_map(|(_, records)| records.into_records())
            .collect(),
    );

    let states = rollup(
        &counties,
        GeographyLevel::State,
        &[
            ("median_household_income", Aggregate::Mean),
            ("per_capita_income", Aggregate::Mean),
            ("median_home_value", Aggregate::Mean),
            ("unemployment_rate", Aggregate::Mean),
            ("poverty_rate", Aggregate::Mean),
        ],
    )?;
    println!(
        "{:<15} {:>12} {:>12} {:>12} {:>8} {:>8}",
        "State", "Population", "Avg Income", "Avg Home", "Unemp%", "Pov%"
    );
    let mut rows = states.records().iter().collect::<Vec<_>>();
    rows.sort_by(|a, b| number(b, "total_population").total_cmp(&number(a, "total_population")));
    for row in rows {
        println!(
            "{:<15} {:>12.0} {:>12.0} {:>12.0} {:>7.1}% {:>7.1}%",
            state_name(&row.geoid),
            number(row, "total_population"),
            number(row, "median_household_income"),
            number(row, "median_home_value"),
            number(row, "unemployment_rate"),
            number(row, "poverty_rate"),
        );
    }

    for (label, column) in [
        ("median household income", "median_household_income"),
        ("unemployment rate", "unemployment_rate"),
        ("population", "total_population"),
    ] {
        println!("Top 5 counties by {label}:");
        let mut ranked = counties.records().iter().collect::<Vec<_>>();
        ranked.sort_by(|a, b| number(b, column).total_cmp(&number(a, column)));
        for record in ranked.into_iter().take(5) {
            println!(
                "  {}: {:.1}",
                record.name.as_deref().unwrap_or(&record.geoid),
                number(record, column)
            );
        }
    }

    JsonFileSink.write(&counties, &SinkTarget::file("midwest_counties_2022.geojson"))?;
    JsonFileSink.write(&states, &SinkTarget::file("midwest_states_2022.json"))?;
    Ok(())
}

fn state_name(fips: &str) -> &'static str {
    STATES
        .iter()
        .find(|state| state.fips == fips)
        .map(|state| state.name)
        .unwrap_or("unknown")
}

// Missing and undefined sort last.
fn number(record: &JoinedRecord, column: &str) -> f64 {
    match record.get(column) {
        Value::Number(value) => *value,
        _ => f64::NEG_INFINITY,
    }
}
