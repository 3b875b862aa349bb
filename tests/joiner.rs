mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use census_etl::domain::{Row, Value};
use census_etl::error::CensusError;
use census_etl::geography::GeographyLevel;
use census_etl::geometry::{Crs, Geometry};
use census_etl::joiner::{GeometryJoiner, JoinedGeometry};
use census_etl::store::BoundaryCache;

use common::{MockGeometry, square, temp_cache};

fn rows(geoids: &[&str]) -> Vec<Row> {
    geoids
        .iter()
        .map(|geoid| Row::new(*geoid).with_value("population", Value::Number(100.0)))
        .collect()
}

#[test]
fn rows_without_boundaries_are_retained() {
    let (_temp, cache) = temp_cache();
    let geometry = MockGeometry::new().with_features(GeographyLevel::County, 2022, &["39049", "39035"]);
    let joiner = GeometryJoiner::new(geometry, cache);

    let records = joiner
        .join(
            GeographyLevel::County,
            2022,
            &rows(&["39049", "39035", "39061"]),
            Crs::WGS84,
        )
        .unwrap();

    assert_eq!(records.len(), 3);
    assert!(records[0].has_geometry());
    assert!(records[1].has_geometry());
    assert_eq!(records[2].geoid, "39061");
    assert_eq!(records[2].geometry, JoinedGeometry::Absent);
    assert_eq!(records[2].get("population"), &Value::Number(100.0));
    assert_eq!(records[0].name.as_deref(), Some("Boundary 39049"));
}

#[test]
fn joining_twice_gives_the_same_records() {
    let (_temp, cache) = temp_cache();
    let geometry = Arc::new(MockGeometry::new().with_features(
        GeographyLevel::County,
        2022,
        &["39049", "39035"],
    ));
    let joiner = GeometryJoiner::new(Arc::clone(&geometry), cache);
    let input = rows(&["39035", "39049"]);

    let first = joiner.join(GeographyLevel::County, 2022, &input, Crs::WGS84).unwrap();
    let second = joiner.join(GeographyLevel::County, 2022, &input, Crs::WGS84).unwrap();
    assert_eq!(first, second);
    assert_eq!(geometry.call_count(), 1);
}

#[test]
fn concurrent_first_joins_fetch_once() {
    let (_temp, cache) = temp_cache();
    let geometry = Arc::new(
        MockGeometry::new()
            .with_features(GeographyLevel::Tract, 2021, &["39049000100"])
            .with_delay(Duration::from_millis(50)),
    );
    let joiner = GeometryJoiner::new(Arc::clone(&geometry), cache);
    let threads = 8;
    let barrier = Barrier::new(threads);
    let input = rows(&["39049000100"]);

    let outcomes = thread::scope(|scope| {
        let handles = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    joiner.join(GeographyLevel::Tract, 2021, &input, Crs::WGS84)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(geometry.call_count(), 1);
    for outcome in outcomes {
        let records = outcome.unwrap();
        assert!(records[0].has_geometry());
    }
}

#[test]
fn cached_entry_survives_a_new_joiner() {
    let (temp, cache) = temp_cache();
    let first = Arc::new(MockGeometry::new().with_features(GeographyLevel::County, 2022, &["39049"]));
    GeometryJoiner::new(Arc::clone(&first), cache)
        .join(GeographyLevel::County, 2022, &rows(&["39049"]), Crs::WGS84)
        .unwrap();
    assert_eq!(first.call_count(), 1);

    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let second = Arc::new(MockGeometry::new());
    let joiner = GeometryJoiner::new(Arc::clone(&second), BoundaryCache::with_root(root));
    let records = joiner
        .join(GeographyLevel::County, 2022, &rows(&["39049"]), Crs::WGS84)
        .unwrap();
    assert!(records[0].has_geometry());
    assert_eq!(second.call_count(), 0);
    assert!(joiner.cache().contains(GeographyLevel::County, 2022));
}

#[test]
fn geometry_is_reprojected_to_the_target() {
    let (_temp, cache) = temp_cache();
    let geometry = MockGeometry::new().with_features(GeographyLevel::County, 2022, &["39049"]);
    let joiner = GeometryJoiner::new(geometry, cache);
    let records = joiner
        .join(GeographyLevel::County, 2022, &rows(&["39049"]), Crs::WEB_MERCATOR)
        .unwrap();

    let JoinedGeometry::Present { geometry, crs } = &records[0].geometry else {
        panic!("expected geometry");
    };
    assert_eq!(*crs, Crs::WEB_MERCATOR);
    let Geometry::Polygon(rings) = geometry else {
        panic!("expected polygon");
    };
    let [x, y] = rings[0][0];
    let expected_x = (-83.0_f64).to_radians() * 6_378_137.0;
    let expected_y = 40.0_f64.to_radians().tan().asinh() * 6_378_137.0;
    assert!((x - expected_x).abs() < 1e-3, "{x}");
    assert!((y - expected_y).abs() < 1e-3, "{y}");
}

#[test]
fn duplicate_boundaries_for_one_row_merge() {
    let (_temp, cache) = temp_cache();
    let geometry = MockGeometry::new().with_feature_list(
        GeographyLevel::County,
        2022,
        vec![square("39049", Crs::NAD83), square("39049", Crs::WGS84)],
    );
    let joiner = GeometryJoiner::new(geometry, cache);
    let records = joiner
        .join(GeographyLevel::County, 2022, &rows(&["39049"]), Crs::WGS84)
        .unwrap();
    assert_matches!(
        &records[0].geometry,
        JoinedGeometry::Present { geometry: Geometry::MultiPolygon(polygons), .. } if polygons.len() == 2
    );
}

#[test]
fn duplicate_rows_are_rejected() {
    let (_temp, cache) = temp_cache();
    let joiner = GeometryJoiner::new(MockGeometry::new(), cache);
    let err = joiner
        .join(GeographyLevel::County, 2022, &rows(&["39049", "39049"]), Crs::WGS84)
        .unwrap_err();
    assert_matches!(err, CensusError::DuplicateJoinKey(geoid) if geoid == "39049");
}

#[test]
fn empty_boundary_set_leaves_every_row_absent() {
    let (_temp, cache) = temp_cache();
    let joiner = GeometryJoiner::new(MockGeometry::new(), cache);
    let records = joiner
        .join(GeographyLevel::County, 2019, &rows(&["39049", "39035"]), Crs::WGS84)
        .unwrap();
    assert!(records.iter().all(|record| !record.has_geometry()));
}
