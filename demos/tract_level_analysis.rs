//! Fetches ACS 5-year tract data for Ohio, derives rates, joins boundaries
//! and writes a GeoJSON feature collection.
//!
//! ```text
//! CENSUS_API_KEY=... CENSUS_BOUNDARY_URL='https://host/{year}/{level}.geojson' \
//!     cargo run --example tract_level_analysis
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, miette};

use census_etl::boundaries::GeoJsonBoundaryClient;
use census_etl::census_api::CensusApiClient;
use census_etl::domain::{Product, VariableSpec};
use census_etl::geography::GeographyLevel;
use census_etl::logging::init_tracing;
use census_etl::pipeline::{Pipeline, PipelineOptions, PipelineRequest};
use census_etl::sink::{JsonFileSink, MemorySink, RecordSink, SinkTarget};
use census_etl::store::BoundaryCache;
use census_etl::transform::{
    DerivedColumn, Normalization, RecordSet, Transformer, demographic_rates, normalize,
};

const OUTPUT: &str = "ohio_tracts_2022.geojson";

fn main() -> miette::Result<()> {
    init_tracing();

    let mut client = CensusApiClient::new()?.with_min_interval(Duration::from_millis(50));
    if let Ok(key) = env::var("CENSUS_API_KEY") {
        client = client.with_api_key(key);
    }
    let client = Arc::new(client);
    let boundary_url = env::var("CENSUS_BOUNDARY_URL")
        .map_err(|_| miette!("set CENSUS_BOUNDARY_URL to a {{year}}/{{level}} GeoJSON template"))?;
    let boundaries = GeoJsonBoundaryClient::new(boundary_url)?;

    let variables = VariableSpec::new([
        ("B01003_001E", "total_population"),
        ("B01002_001E", "median_age"),
        ("B02001_002E", "white_alone"),
        ("B02001_003E", "black_alone"),
        ("B03003_003E", "hispanic_latino"),
        ("B19013_001E", "median_household_income"),
        ("B19301_001E", "per_capita_income"),
        ("B17001_002E", "below_poverty_level"),
        ("B25001_001E", "total_housing_units"),
        ("B25077_001E", "median_home_value"),
        ("B25002_003E", "vacant_units"),
        ("B15003_022E", "bachelors_degree"),
        ("B15003_023E", "masters_degree"),
        ("B15003_025E", "doctorate_degree"),
    ])?;

    let transformer = Transformer::new()
        .derive_all(demographic_rates(&variables.columns(), "total_population"))
        .derive(DerivedColumn::percentage(
            "vacancy_rate",
            "vacant_units",
            "total_housing_units",
        ))
        .derive(DerivedColumn::sum(
            "college_educated",
            &["bachelors_degree", "masters_degree", "doctorate_degree"],
        ))
        .derive(DerivedColumn::percentage(
            "pct_college",
            "college_educated",
            "total_population",
        ));

    let pipeline = Pipeline::new(
        Arc::clone(&client),
        Arc::clone(&client),
        boundaries,
        BoundaryCache::new()?,
        PipelineOptions::default(),
    )?
    .with_transformer(transformer);

    let request = PipelineRequest::new(
        GeographyLevel::Tract,
        "state=39".parse()?,
        Product::Acs5,
        2022,
        variables,
    );
    let sink = MemorySink::new();
    let report = pipeline.run(&request, &sink, &SinkTarget::named("ohio_tracts_acs5_2022"))?;
    if !report.is_complete() {
        eprintln!(
            "{} of {} tracts failed; rerun them with Pipeline::run_instances",
            report.fetches_failed, report.instances_resolved
        );
    }

    let records = sink
        .last()
        .ok_or_else(|| miette!("pipeline wrote no records"))?;
    let records = normalize(
        records,
        "median_household_income",
        Normalization::Robust,
        Some("income_index"),
    )?;
    JsonFileSink.write(&records, &SinkTarget::file(OUTPUT))?;

    print_summary(&records)?;
    println!("Output saved to: {OUTPUT}");
    println!(
        "{}",
        serde_json::to_string_pretty(&report).into_diagnostic()?
    );
    Ok(())
}

fn print_summary(records: &RecordSet) -> miette::Result<()> {
    println!("OHIO TRACT SUMMARY STATISTICS (ACS 2022)");
    println!("Total tracts: {}", records.len());
    println!("Tracts without boundary: {}", records.geometry_absent());

    let population = records.numbers("total_population")?;
    println!(
        "Total population: {:.0}",
        population.iter().flatten().sum::<f64>()
    );
    for (label, column) in [
        ("Median household income", "median_household_income"),
        ("Poverty rate", "poverty_rate"),
        ("Median home value", "median_home_value"),
        ("College education rate", "pct_college"),
    ] {
        let values = records.numbers(column)?;
        let mut present = values.into_iter().flatten().collect::<Vec<_>>();
        if present.is_empty() {
            println!("{label}: no data");
            continue;
        }
        present.sort_by(f64::total_cmp);
        let mean = present.iter().sum::<f64>() / present.len() as f64;
        let median = present[present.len() / 2];
        println!(
            "{label}: mean {mean:.1}, median {median:.1}, min {:.1}, max {:.1}",
            present[0],
            present[present.len() - 1]
        );
    }
    Ok(())
}
